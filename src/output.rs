//! Output formatting and persistence for traffic batches.
//!
//! Plain-text reports are [`Display`](fmt::Display) adapters so they can go to
//! stdout or a log line alike. Snapshots are written as JSON or CSV; summary
//! rows are appended to a CSV history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use csv::WriterBuilder;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::record::TrafficRecord;
use crate::stats::{StatisticsSummary, congested};
use crate::store::DatabaseStats;

const RULE: &str = "================================================================================";
const THIN_RULE: &str = "--------------------------------------------------------------------------------";

/// Records shown in the sample section.
pub const SAMPLE_SIZE: usize = 10;
/// Congestion alerts shown per report.
pub const ALERT_LIMIT: usize = 15;

/// File format for batch snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SnapshotFormat {
    #[default]
    Json,
    Csv,
}

impl SnapshotFormat {
    fn extension(self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Csv => "csv",
        }
    }
}

/// Overall numbers, borough and status breakdowns, and sample records.
pub struct SummaryReport<'a> {
    pub records: &'a [TrafficRecord],
    pub summary: &'a StatisticsSummary,
}

impl fmt::Display for SummaryReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary;

        writeln!(f, "{RULE}")?;
        writeln!(
            f,
            "Real-Time Traffic Data - {}",
            s.timestamp.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(f, "{RULE}")?;

        if self.records.is_empty() {
            return writeln!(f, "No traffic data available");
        }

        writeln!(f)?;
        writeln!(f, "OVERALL STATISTICS")?;
        writeln!(f, "{THIN_RULE}")?;
        writeln!(f, "Total road segments: {}", s.total_segments)?;
        writeln!(f, "Average speed: {:.1} mph", s.avg_speed)?;
        writeln!(
            f,
            "Speed range: {:.1} - {:.1} mph",
            s.min_speed, s.max_speed
        )?;
        writeln!(f, "Average travel time: {:.1} seconds", s.avg_travel_time)?;

        writeln!(f)?;
        writeln!(f, "BY BOROUGH")?;
        writeln!(f, "{THIN_RULE}")?;
        for c in s.boroughs_by_count() {
            writeln!(f, "  {}: {} segments", c.key, c.count)?;
        }

        writeln!(f)?;
        writeln!(f, "TRAFFIC STATUS")?;
        writeln!(f, "{THIN_RULE}")?;
        for c in s.statuses_by_count() {
            writeln!(f, "  {}: {} segments", c.key, c.count)?;
        }

        writeln!(f)?;
        writeln!(f, "SAMPLE ROAD SEGMENTS (First {SAMPLE_SIZE})")?;
        writeln!(f, "{THIN_RULE}")?;
        for (idx, r) in self.records.iter().take(SAMPLE_SIZE).enumerate() {
            writeln!(f)?;
            writeln!(f, "Segment {}:", idx + 1)?;
            writeln!(f, "  Link ID: {}", r.link_id)?;
            writeln!(f, "  Name: {}", r.link_name)?;
            writeln!(f, "  Borough: {}", r.borough)?;
            writeln!(f, "  Current Speed: {:.1} mph", r.speed)?;
            writeln!(f, "  Travel Time: {:.1} seconds", r.travel_time)?;
            writeln!(f, "  Status: {}", r.status)?;
            writeln!(f, "  Data as of: {}", r.data_as_of)?;
        }

        if self.records.len() > SAMPLE_SIZE {
            writeln!(f)?;
            writeln!(
                f,
                "... and {} more segments",
                self.records.len() - SAMPLE_SIZE
            )?;
        }
        Ok(())
    }
}

/// Segments slower than the threshold, slowest first.
pub struct CongestionReport<'a> {
    pub records: &'a [TrafficRecord],
    pub threshold: f64,
}

impl CongestionReport<'_> {
    pub fn count(&self) -> usize {
        congested(self.records, self.threshold).len()
    }
}

impl fmt::Display for CongestionReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slow = congested(self.records, self.threshold);

        writeln!(f, "{RULE}")?;
        writeln!(f, "CONGESTED AREAS (Speed < {} mph)", self.threshold)?;
        writeln!(f, "{RULE}")?;

        if slow.is_empty() {
            return writeln!(f, "No significant congestion detected!");
        }

        writeln!(f, "Found {} congested segments", slow.len())?;
        for (idx, r) in slow.iter().take(ALERT_LIMIT).enumerate() {
            writeln!(f)?;
            writeln!(f, "{}. {} ({})", idx + 1, r.link_name, r.borough)?;
            writeln!(f, "   Speed: {:.1} mph | Status: {}", r.speed, r.status)?;
        }
        Ok(())
    }
}

/// Aggregates over everything persisted so far.
pub struct DatabaseReport<'a>(pub &'a DatabaseStats);

impl fmt::Display for DatabaseReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.0;

        writeln!(f, "{RULE}")?;
        writeln!(f, "DATABASE STATISTICS")?;
        writeln!(f, "{RULE}")?;

        if stats.total_records == 0 {
            return writeln!(f, "No data collected yet");
        }

        writeln!(f)?;
        writeln!(f, "OVERALL")?;
        writeln!(f, "  Total records: {}", stats.total_records)?;
        writeln!(f, "  Unique road links: {}", stats.unique_links)?;
        if let (Some(earliest), Some(latest)) = (stats.earliest, stats.latest) {
            writeln!(f, "  Data range: {earliest} to {latest}")?;
            writeln!(f, "  Duration: {}", format_span(earliest, latest))?;
        }

        if !stats.by_borough.is_empty() {
            writeln!(f)?;
            writeln!(f, "RECORDS BY BOROUGH")?;
            for (borough, count) in &stats.by_borough {
                writeln!(f, "  {borough}: {count}")?;
            }
        }

        let window = window_label(stats.window_minutes);

        if !stats.avg_speed_by_borough.is_empty() {
            writeln!(f)?;
            writeln!(f, "AVERAGE SPEED (Last {window})")?;
            for (borough, avg_speed) in &stats.avg_speed_by_borough {
                writeln!(f, "  {borough}: {avg_speed:.2} mph")?;
            }
        }

        if !stats.most_congested.is_empty() {
            writeln!(f)?;
            writeln!(f, "MOST CONGESTED LINKS (Last {window})")?;
            for (idx, link) in stats.most_congested.iter().enumerate() {
                writeln!(
                    f,
                    "  {}. {} ({}): {:.2} mph",
                    idx + 1,
                    link.link_name,
                    link.borough,
                    link.avg_speed
                )?;
            }
        }
        Ok(())
    }
}

fn format_span(earliest: DateTime<Utc>, latest: DateTime<Utc>) -> String {
    let span = latest - earliest;
    let days = span.num_days();
    let hours = span.num_hours() % 24;
    let minutes = span.num_minutes() % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else {
        format!("{hours}h {minutes}m")
    }
}

fn window_label(minutes: i64) -> String {
    match minutes {
        60 => "Hour".to_string(),
        m if m % 60 == 0 => format!("{} Hours", m / 60),
        m => format!("{m} Minutes"),
    }
}

/// Logs a serializable value as pretty-printed JSON.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes a normalized batch to `<dir>/nyc_traffic_data_<unix_ts>.<ext>`.
pub fn write_snapshot(
    dir: &Path,
    records: &[TrafficRecord],
    format: SnapshotFormat,
    taken_at: DateTime<Utc>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

    let path = dir.join(format!(
        "nyc_traffic_data_{}.{}",
        taken_at.timestamp(),
        format.extension()
    ));
    let file =
        File::create(&path).with_context(|| format!("creating snapshot {}", path.display()))?;

    match format {
        SnapshotFormat::Json => {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, records)?;
        }
        SnapshotFormat::Csv => {
            let mut writer = csv::Writer::from_writer(file);
            for record in records {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
    }

    debug!(path = %path.display(), records = records.len(), "Snapshot written");
    Ok(path)
}

/// Appends a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, row: &impl Serialize) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(row)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CongestedLink;
    use chrono::TimeZone;
    use std::fs;

    fn record(link_id: &str, speed: f64) -> TrafficRecord {
        TrafficRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 11, 58, 3).unwrap(),
            link_id: link_id.to_string(),
            link_name: format!("Link {link_id}"),
            borough: "Brooklyn".to_string(),
            speed,
            travel_time: 90.0,
            status: "0".to_string(),
            data_as_of: "2025-03-01T11:58:03.000".to_string(),
            link_points: "40.7,-73.9".to_string(),
            encoded_poly_line: "abc".to_string(),
            owner: "NYC_DOT_LIC".to_string(),
        }
    }

    #[test]
    fn test_summary_report_for_empty_batch() {
        let summary = StatisticsSummary::from_records(&[]);
        let text = SummaryReport {
            records: &[],
            summary: &summary,
        }
        .to_string();

        assert!(text.contains("No traffic data available"));
    }

    #[test]
    fn test_summary_report_truncates_samples() {
        let records: Vec<_> = (0..12).map(|i| record(&i.to_string(), 30.0)).collect();
        let summary = StatisticsSummary::from_records(&records);
        let text = SummaryReport {
            records: &records,
            summary: &summary,
        }
        .to_string();

        assert!(text.contains("Total road segments: 12"));
        assert!(text.contains("Brooklyn: 12 segments"));
        assert!(text.contains("Segment 10:"));
        assert!(!text.contains("Segment 11:"));
        assert!(text.contains("... and 2 more segments"));
    }

    #[test]
    fn test_congestion_report_lists_slowest_first() {
        let records = vec![record("a", 12.0), record("b", 40.0), record("c", 4.5)];
        let report = CongestionReport {
            records: &records,
            threshold: 15.0,
        };
        let text = report.to_string();

        assert_eq!(report.count(), 2);
        let first = text.find("1. Link c").unwrap();
        let second = text.find("2. Link a").unwrap();
        assert!(first < second);
        assert!(!text.contains("Link b"));
    }

    #[test]
    fn test_congestion_report_without_congestion() {
        let records = vec![record("a", 50.0)];
        let text = CongestionReport {
            records: &records,
            threshold: 15.0,
        }
        .to_string();

        assert!(text.contains("No significant congestion detected!"));
    }

    #[test]
    fn test_database_report_sections() {
        let stats = DatabaseStats {
            total_records: 1200,
            earliest: Some(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()),
            latest: Some(Utc.with_ymd_and_hms(2025, 3, 2, 10, 30, 0).unwrap()),
            unique_links: 140,
            by_borough: vec![("Manhattan".to_string(), 700)],
            avg_speed_by_borough: vec![("Manhattan".to_string(), 18.456)],
            most_congested: vec![CongestedLink {
                link_name: "FDR N".to_string(),
                borough: "Manhattan".to_string(),
                avg_speed: 6.0,
            }],
            window_minutes: 60,
        };
        let text = DatabaseReport(&stats).to_string();

        assert!(text.contains("Total records: 1200"));
        assert!(text.contains("Duration: 1d 2h 30m"));
        assert!(text.contains("AVERAGE SPEED (Last Hour)"));
        assert!(text.contains("Manhattan: 18.46 mph"));
        assert!(text.contains("1. FDR N (Manhattan): 6.00 mph"));
    }

    #[test]
    fn test_database_report_for_empty_table() {
        let text = DatabaseReport(&DatabaseStats::default()).to_string();

        assert!(text.contains("No data collected yet"));
        assert!(!text.contains("OVERALL"));
    }

    #[test]
    fn test_window_label() {
        assert_eq!(window_label(60), "Hour");
        assert_eq!(window_label(180), "3 Hours");
        assert_eq!(window_label(15), "15 Minutes");
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&DatabaseStats::default()).unwrap();
    }

    #[test]
    fn test_write_json_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let taken_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let records = vec![record("1", 20.0), record("2", 0.0)];

        let path = write_snapshot(dir.path(), &records, SnapshotFormat::Json, taken_at).unwrap();

        assert_eq!(
            path.file_name().unwrap(),
            format!("nyc_traffic_data_{}.json", taken_at.timestamp()).as_str()
        );
        let back: Vec<TrafficRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn test_write_csv_snapshot_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record("1", 20.0), record("2", 0.0)];

        let path =
            write_snapshot(dir.path(), &records, SnapshotFormat::Csv, Utc::now()).unwrap();

        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,link_id,link_name"));
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let path = path.to_str().unwrap();

        let row = StatisticsSummary::from_records(&[record("1", 20.0)]).to_row(0, 1);
        append_record(path, &row).unwrap();
        append_record(path, &row).unwrap();

        let content = fs::read_to_string(path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);
    }
}
