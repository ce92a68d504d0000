use async_trait::async_trait;
use chrono::Utc;
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{
    CongestedLink, ConflictPolicy, DatabaseStats, StatsQuery, StoreConnector, TrafficStore,
};
use crate::error::PipelineError;
use crate::record::{TrafficRecord, parse_timestamp};

// Timestamps are stored as RFC 3339 text; one instant always encodes to the
// same string, so text comparison and the unique key both hold.
const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS traffic_data (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        time_stamp  TEXT NOT NULL,
        link_id     TEXT NOT NULL,
        link_name   TEXT NOT NULL,
        borough     TEXT NOT NULL,
        speed       REAL NOT NULL DEFAULT 0,
        travel_time REAL NOT NULL DEFAULT 0,
        status      TEXT NOT NULL,
        data_as_of  TEXT NOT NULL,
        owner       TEXT NOT NULL,
        UNIQUE (link_id, time_stamp)
    )
"#;

const UPSERT_UPDATE: &str = r#"
    INSERT INTO traffic_data
        (time_stamp, link_id, link_name, borough, speed,
         travel_time, status, data_as_of, owner)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (link_id, time_stamp)
    DO UPDATE SET
        speed = excluded.speed,
        travel_time = excluded.travel_time,
        status = excluded.status
"#;

const UPSERT_IGNORE: &str = r#"
    INSERT INTO traffic_data
        (time_stamp, link_id, link_name, borough, speed,
         travel_time, status, data_as_of, owner)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (link_id, time_stamp) DO NOTHING
"#;

/// Opens connections to a SQLite database file, creating it if missing.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    policy: ConflictPolicy,
}

impl SqliteConnector {
    pub fn new(path: impl AsRef<Path>, policy: ConflictPolicy) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            policy,
        }
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    type Store = SqliteStore;

    async fn connect(&self) -> Result<SqliteStore, PipelineError> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(PipelineError::Connection)?;
        info!(path = %self.path.display(), "Connected to SQLite");

        Ok(SqliteStore {
            conn,
            policy: self.policy,
        })
    }

    fn describe(&self) -> String {
        format!("SQLite at {}", self.path.display())
    }
}

/// One open SQLite connection.
pub struct SqliteStore {
    conn: SqliteConnection,
    policy: ConflictPolicy,
}

#[async_trait]
impl TrafficStore for SqliteStore {
    async fn ensure_schema(&mut self) -> Result<(), PipelineError> {
        sqlx::query(CREATE_TABLE)
            .execute(&mut self.conn)
            .await
            .map_err(PipelineError::Write)?;
        Ok(())
    }

    async fn upsert(&mut self, records: &[TrafficRecord]) -> Result<u64, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }

        let sql = match self.policy {
            ConflictPolicy::Update => UPSERT_UPDATE,
            ConflictPolicy::Ignore => UPSERT_IGNORE,
        };

        let mut tx = self.conn.begin().await.map_err(PipelineError::Write)?;
        let mut affected = 0;

        for record in records {
            let result = sqlx::query(sql)
                .bind(record.timestamp)
                .bind(&record.link_id)
                .bind(&record.link_name)
                .bind(&record.borough)
                .bind(record.speed)
                .bind(record.travel_time)
                .bind(&record.status)
                // data_as_of holds the parsed observation time, not the raw text
                .bind(record.timestamp)
                .bind(&record.owner)
                .execute(&mut *tx)
                .await;

            match result {
                Ok(done) => affected += done.rows_affected(),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback failed");
                    }
                    return Err(PipelineError::Write(e));
                }
            }
        }

        tx.commit().await.map_err(PipelineError::Write)?;
        debug!(rows = affected, "Batch committed");
        Ok(affected)
    }

    async fn query_statistics(
        &mut self,
        query: StatsQuery,
    ) -> Result<DatabaseStats, PipelineError> {
        query_statistics(&mut self.conn, query)
            .await
            .map_err(PipelineError::Query)
    }

    async fn close(self) -> Result<(), PipelineError> {
        self.conn.close().await.map_err(PipelineError::Connection)?;
        info!("Database connection closed");
        Ok(())
    }
}

async fn query_statistics(
    conn: &mut SqliteConnection,
    query: StatsQuery,
) -> Result<DatabaseStats, sqlx::Error> {
    let cutoff = query.cutoff(Utc::now());

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM traffic_data")
        .fetch_one(&mut *conn)
        .await?;

    let (earliest, latest): (Option<String>, Option<String>) =
        sqlx::query_as("SELECT MIN(time_stamp), MAX(time_stamp) FROM traffic_data")
            .fetch_one(&mut *conn)
            .await?;

    let unique_links: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT link_id) FROM traffic_data")
        .fetch_one(&mut *conn)
        .await?;

    let by_borough: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT borough, COUNT(*) AS count
        FROM traffic_data
        GROUP BY borough
        ORDER BY count DESC, borough
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let avg_speed_by_borough: Vec<(String, f64)> = sqlx::query_as(
        r#"
        SELECT borough, AVG(speed) AS avg_speed
        FROM traffic_data
        WHERE time_stamp >= ?
        AND speed > 0
        GROUP BY borough
        ORDER BY avg_speed
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?;

    let most_congested: Vec<(String, String, f64)> = sqlx::query_as(
        r#"
        SELECT link_name, borough, AVG(speed) AS avg_speed
        FROM traffic_data
        WHERE time_stamp >= ?
        AND speed > 0
        GROUP BY link_name, borough
        ORDER BY avg_speed
        LIMIT ?
        "#,
    )
    .bind(cutoff)
    .bind(query.top_n)
    .fetch_all(&mut *conn)
    .await?;

    Ok(DatabaseStats {
        total_records,
        earliest: earliest.as_deref().and_then(parse_timestamp),
        latest: latest.as_deref().and_then(parse_timestamp),
        unique_links,
        by_borough,
        avg_speed_by_borough,
        most_congested: most_congested
            .into_iter()
            .map(|(link_name, borough, avg_speed)| CongestedLink {
                link_name,
                borough,
                avg_speed,
            })
            .collect(),
        window_minutes: query.window.num_minutes(),
    })
}
