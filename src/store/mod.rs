//! Persistence of normalized records.
//!
//! [`StoreConnector`] opens one connection per cycle; the returned
//! [`TrafficStore`] performs the batch upsert and the statistics queries and
//! is consumed by [`TrafficStore::close`].
//!
//! Rows are keyed on `(link_id, time_stamp)`. On a key collision only the
//! measurements (`speed`, `travel_time`, `status`) are refreshed; the
//! descriptive columns keep the values from the first write.

mod postgres;
mod sqlite;

pub use postgres::{PgConnector, PgStore};
pub use sqlite::{SqliteConnector, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::PipelineError;
use crate::record::TrafficRecord;

/// What to do when a row with the same `(link_id, time_stamp)` exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ConflictPolicy {
    /// Overwrite speed, travel time and status.
    #[default]
    Update,
    /// Leave the existing row untouched.
    Ignore,
}

/// Parameters for [`TrafficStore::query_statistics`].
#[derive(Debug, Clone, Copy)]
pub struct StatsQuery {
    pub window: TimeDelta,
    pub top_n: i64,
}

impl StatsQuery {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }
}

/// A road link with one of the lowest average speeds in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CongestedLink {
    pub link_name: String,
    pub borough: String,
    pub avg_speed: f64,
}

/// Aggregates computed by the database over everything stored so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub unique_links: i64,
    /// Highest count first.
    pub by_borough: Vec<(String, i64)>,
    /// Positive speeds inside the window, slowest borough first.
    pub avg_speed_by_borough: Vec<(String, f64)>,
    /// Slowest links inside the window.
    pub most_congested: Vec<CongestedLink>,
    pub window_minutes: i64,
}

/// Opens a fresh connection for one cycle.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: TrafficStore;

    /// # Errors
    ///
    /// Returns [`PipelineError::Connection`] if the database is unreachable
    /// or rejects the credentials.
    async fn connect(&self) -> Result<Self::Store, PipelineError>;

    /// Short human-readable target description for logs.
    fn describe(&self) -> String;
}

/// A live connection to a traffic table.
#[async_trait]
pub trait TrafficStore: Send {
    /// Creates `traffic_data` and its unique key if missing.
    async fn ensure_schema(&mut self) -> Result<(), PipelineError>;

    /// Writes `records` in a single transaction and returns the number of
    /// rows inserted or updated.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Write`] after rolling back if any row fails.
    async fn upsert(&mut self, records: &[TrafficRecord]) -> Result<u64, PipelineError>;

    async fn query_statistics(&mut self, query: StatsQuery)
    -> Result<DatabaseStats, PipelineError>;

    /// Releases the connection.
    async fn close(self) -> Result<(), PipelineError>;
}

/// Opens a connection, makes sure the table exists, and reads the
/// statistics. A database nothing was collected into yet reports zero rows.
pub async fn read_statistics<S: StoreConnector>(
    connector: &S,
    query: StatsQuery,
) -> Result<DatabaseStats, PipelineError> {
    let mut store = connector.connect().await?;
    let stats = match store.ensure_schema().await {
        Ok(()) => store.query_statistics(query).await,
        Err(e) => Err(e),
    };
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close database connection");
    }
    stats
}
