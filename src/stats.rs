use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::record::TrafficRecord;

/// Default congestion cutoff in mph.
pub const DEFAULT_SPEED_THRESHOLD: f64 = 15.0;

/// Occurrences of one literal category value (a borough or a status).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub key: String,
    pub count: usize,
}

/// Descriptive statistics over one normalized batch.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StatisticsSummary {
    pub timestamp: DateTime<Utc>,
    pub total_segments: usize,

    // speed, positive readings only
    pub speed_samples: usize,
    pub avg_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,

    // travel time, positive readings only
    pub travel_time_samples: usize,
    pub avg_travel_time: f64,

    // first-seen order
    pub borough_counts: Vec<CategoryCount>,
    pub status_counts: Vec<CategoryCount>,
}

/// One row of the summary history CSV.
#[derive(Debug, Serialize)]
pub struct SummaryRow {
    pub timestamp: DateTime<Utc>,
    pub total_segments: usize,
    pub avg_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub avg_travel_time: f64,
    pub boroughs: usize,
    pub congested: usize,
    pub rows_written: u64,
}

impl StatisticsSummary {
    pub fn from_records(records: &[TrafficRecord]) -> Self {
        let mut s = StatisticsSummary {
            timestamp: Utc::now(),
            total_segments: records.len(),
            ..Default::default()
        };

        let speeds: Vec<f64> = records
            .iter()
            .map(|r| r.speed)
            .filter(|v| *v > 0.0)
            .collect();
        let travel_times: Vec<f64> = records
            .iter()
            .map(|r| r.travel_time)
            .filter(|v| *v > 0.0)
            .collect();

        s.speed_samples = speeds.len();
        s.avg_speed = mean(&speeds);
        s.min_speed = speeds.iter().copied().reduce(f64::min).unwrap_or(0.0);
        s.max_speed = speeds.iter().copied().reduce(f64::max).unwrap_or(0.0);

        s.travel_time_samples = travel_times.len();
        s.avg_travel_time = mean(&travel_times);

        s.borough_counts = count_by(records, |r| &r.borough);
        s.status_counts = count_by(records, |r| &r.status);

        s
    }

    /// Borough counts, highest first; equal counts keep first-seen order.
    pub fn boroughs_by_count(&self) -> Vec<CategoryCount> {
        sorted_by_count(&self.borough_counts)
    }

    /// Status counts, highest first; equal counts keep first-seen order.
    pub fn statuses_by_count(&self) -> Vec<CategoryCount> {
        sorted_by_count(&self.status_counts)
    }

    /// Flattens the headline numbers for the history CSV.
    pub fn to_row(&self, congested: usize, rows_written: u64) -> SummaryRow {
        SummaryRow {
            timestamp: self.timestamp,
            total_segments: self.total_segments,
            avg_speed: self.avg_speed,
            min_speed: self.min_speed,
            max_speed: self.max_speed,
            avg_travel_time: self.avg_travel_time,
            boroughs: self.borough_counts.len(),
            congested,
            rows_written,
        }
    }
}

/// Records moving slower than `threshold`, slowest first.
///
/// Zero-speed readings mean "no data" and are never reported as congestion.
pub fn congested(records: &[TrafficRecord], threshold: f64) -> Vec<&TrafficRecord> {
    let mut slow: Vec<&TrafficRecord> = records
        .iter()
        .filter(|r| r.speed > 0.0 && r.speed < threshold)
        .collect();
    slow.sort_by(|a, b| a.speed.total_cmp(&b.speed));
    slow
}

/// Arithmetic mean; 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn count_by<'a, F>(records: &'a [TrafficRecord], key: F) -> Vec<CategoryCount>
where
    F: Fn(&'a TrafficRecord) -> &'a String,
{
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut counts: Vec<CategoryCount> = Vec::new();

    for record in records {
        let k = key(record);
        match index.get(k.as_str()) {
            Some(&i) => counts[i].count += 1,
            None => {
                index.insert(k.as_str(), counts.len());
                counts.push(CategoryCount {
                    key: k.clone(),
                    count: 1,
                });
            }
        }
    }

    counts
}

fn sorted_by_count(counts: &[CategoryCount]) -> Vec<CategoryCount> {
    let mut sorted = counts.to_vec();
    // stable: ties stay in first-seen order
    sorted.sort_by(|a, b| b.count.cmp(&a.count));
    sorted
}
