//! Plain configuration values shared by the binary and the pipeline.

use chrono::TimeDelta;
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;

use crate::fetch::{DEFAULT_FETCH_LIMIT, DEFAULT_SOURCE_URL};
use crate::record::DEFAULT_SOURCE_TZ;
use crate::stats::DEFAULT_SPEED_THRESHOLD;

/// Delay before retrying after a failed cycle in continuous mode.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// Default spacing between cycles in continuous mode.
pub const DEFAULT_INTERVAL_MINUTES: u64 = 5;

/// Connection parameters for a PostgreSQL server.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "traffic_db".to_string(),
            user: "traffic_user".to_string(),
            password: None,
        }
    }
}

/// How many cycles the orchestrator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One fetch → write → report pass, then exit.
    Single,
    /// Repeat until stopped, sleeping `interval` between successful cycles.
    Continuous { interval: Duration },
}

impl RunMode {
    pub fn every_minutes(minutes: u64) -> Self {
        RunMode::Continuous {
            interval: Duration::from_secs(minutes.saturating_mul(60)),
        }
    }

    /// Maps an interactive menu answer to a mode. Unknown answers fall back
    /// to a single cycle.
    pub fn from_menu_choice(choice: &str) -> Self {
        match choice.trim() {
            "2" => RunMode::every_minutes(5),
            "3" => RunMode::every_minutes(10),
            "4" => RunMode::every_minutes(1),
            _ => RunMode::Single,
        }
    }
}

/// Everything a cycle needs besides its HTTP client and store.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source_url: String,
    pub fetch_limit: u32,
    /// Zone for feed timestamps that carry no offset.
    pub source_tz: Tz,
    pub speed_threshold: f64,
    /// Trailing window for the per-borough and most-congested queries.
    pub stats_window: TimeDelta,
    pub top_congested: i64,
    pub failure_backoff: Duration,
    /// Create `traffic_data` if it does not exist at the start of a cycle.
    pub init_schema: bool,
    /// Append each cycle's headline numbers to this CSV.
    pub summary_csv: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            source_tz: DEFAULT_SOURCE_TZ,
            speed_threshold: DEFAULT_SPEED_THRESHOLD,
            stats_window: TimeDelta::hours(1),
            top_congested: 5,
            failure_backoff: FAILURE_BACKOFF,
            init_schema: false,
            summary_csv: None,
        }
    }
}
