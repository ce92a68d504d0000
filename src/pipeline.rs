//! Cycle orchestration: fetch → write → report, once or on an interval.
//!
//! Each cycle runs to completion before the next one starts. A stop request
//! is only honored while sleeping between cycles.

use chrono::{Local, TimeDelta, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineSettings, RunMode};
use crate::error::PipelineError;
use crate::fetch::{HttpClient, fetch_records};
use crate::output::{CongestionReport, DatabaseReport, SummaryReport, append_record};
use crate::record::{TrafficRecord, normalize};
use crate::stats::StatisticsSummary;
use crate::store::{DatabaseStats, StatsQuery, StoreConnector, TrafficStore};

const RULE: &str = "================================================================================";

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Writing,
    Reporting,
    Sleeping,
}

/// Outcome of one completed cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub fetched: usize,
    pub records: Vec<TrafficRecord>,
    pub rows_written: u64,
    /// Set when the batch was rolled back.
    pub write_error: Option<String>,
    pub summary: StatisticsSummary,
    pub congested: usize,
    /// `None` if the statistics query failed.
    pub database: Option<DatabaseStats>,
}

struct StoreOutcome {
    rows_written: u64,
    write_error: Option<String>,
    database: Option<DatabaseStats>,
}

/// Fetches from one source and writes into one store.
pub struct Pipeline<C, S> {
    client: C,
    connector: S,
    settings: PipelineSettings,
}

impl<C: HttpClient, S: StoreConnector> Pipeline<C, S> {
    pub fn new(client: C, connector: S, settings: PipelineSettings) -> Self {
        Self {
            client,
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn connector(&self) -> &S {
        &self.connector
    }

    /// Runs `mode` to completion and returns the number of cycles started.
    ///
    /// # Errors
    ///
    /// In [`RunMode::Single`] a failed cycle is returned as the error.
    /// Continuous mode logs failures, backs off, and only returns once `stop`
    /// flips to `true`.
    pub async fn run(
        &self,
        mode: RunMode,
        mut stop: watch::Receiver<bool>,
    ) -> Result<u64, PipelineError> {
        let interval = match mode {
            RunMode::Single => {
                self.run_cycle().await?;
                return Ok(1);
            }
            RunMode::Continuous { interval } => interval,
        };

        info!(
            interval_secs = interval.as_secs(),
            target_db = %self.connector.describe(),
            "Continuous collection started. Press Ctrl+C to stop."
        );

        let mut cycle_count = 0u64;
        loop {
            cycle_count += 1;
            info!(cycle = cycle_count, "Starting cycle");

            let pause = match self.run_cycle().await {
                Ok(_) => {
                    let next_run = TimeDelta::from_std(interval)
                        .ok()
                        .and_then(|wait| Local::now().checked_add_signed(wait));
                    match next_run {
                        Some(at) => info!(
                            next_run = %at.format("%Y-%m-%d %H:%M:%S"),
                            "Cycle complete, sleeping"
                        ),
                        None => info!(interval_secs = interval.as_secs(), "Cycle complete, sleeping"),
                    }
                    interval
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = self.settings.failure_backoff.as_secs(),
                        "Error in cycle, retrying after backoff"
                    );
                    self.settings.failure_backoff
                }
            };

            enter(CyclePhase::Sleeping);
            if sleep_or_stop(pause, &mut stop).await {
                break;
            }
        }

        info!(cycles = cycle_count, "Stopped by user");
        Ok(cycle_count)
    }

    /// One fetch → write → report pass.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Network`] if the fetch fails (no database
    /// connection is attempted) and [`PipelineError::Connection`] if the
    /// store cannot be opened. Write and statistics failures are reported
    /// and recorded in the returned [`CycleReport`] instead.
    #[tracing::instrument(skip(self), fields(source = %self.settings.source_url))]
    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        enter(CyclePhase::Idle);
        println!("{RULE}");
        println!(
            "COLLECTION CYCLE - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        println!("{RULE}");

        enter(CyclePhase::Fetching);
        let raw = fetch_records(
            &self.client,
            &self.settings.source_url,
            self.settings.fetch_limit,
        )
        .await?;
        info!(fetched = raw.len(), "Fetched records");
        let records = normalize(&raw, Utc::now(), self.settings.source_tz);

        enter(CyclePhase::Writing);
        let mut store = self.connector.connect().await?;
        let outcome = self.write_and_query(&mut store, &records).await;
        if let Err(e) = store.close().await {
            warn!(error = %e, "Failed to close database connection");
        }

        enter(CyclePhase::Reporting);
        let summary = StatisticsSummary::from_records(&records);
        let congestion = CongestionReport {
            records: &records,
            threshold: self.settings.speed_threshold,
        };
        let congested = congestion.count();

        println!(
            "{}",
            SummaryReport {
                records: &records,
                summary: &summary,
            }
        );
        println!("{congestion}");
        if let Some(stats) = &outcome.database {
            println!("{}", DatabaseReport(stats));
        }
        println!("{RULE}");
        println!("CYCLE COMPLETE");
        println!("{RULE}");

        if let Some(path) = &self.settings.summary_csv {
            let row = summary.to_row(congested, outcome.rows_written);
            if let Err(e) = append_record(path, &row) {
                warn!(path = %path, error = %e, "Failed to append summary row");
            }
        }

        Ok(CycleReport {
            fetched: raw.len(),
            records,
            rows_written: outcome.rows_written,
            write_error: outcome.write_error,
            summary,
            congested,
            database: outcome.database,
        })
    }

    async fn write_and_query(
        &self,
        store: &mut S::Store,
        records: &[TrafficRecord],
    ) -> StoreOutcome {
        let mut outcome = StoreOutcome {
            rows_written: 0,
            write_error: None,
            database: None,
        };

        let written = if self.settings.init_schema {
            match store.ensure_schema().await {
                Ok(()) => store.upsert(records).await,
                Err(e) => Err(e),
            }
        } else {
            store.upsert(records).await
        };

        match written {
            Ok(rows) => {
                info!(rows, "Inserted/Updated records");
                outcome.rows_written = rows;
            }
            Err(e) => {
                error!(error = %e, "Insert failed");
                outcome.write_error = Some(e.to_string());
            }
        }

        let query = StatsQuery {
            window: self.settings.stats_window,
            top_n: self.settings.top_congested,
        };
        match store.query_statistics(query).await {
            Ok(stats) => outcome.database = Some(stats),
            Err(e) => error!(error = %e, "Failed to retrieve database statistics"),
        }

        outcome
    }
}

fn enter(phase: CyclePhase) {
    debug!(phase = ?phase, "Entering phase");
}

/// Sleeps for `duration` unless a stop is requested first. Returns `true`
/// when the loop should end.
pub async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        Ok(_) = stop.wait_for(|stopped| *stopped) => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
