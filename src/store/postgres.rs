use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info, warn};

use super::{
    CongestedLink, ConflictPolicy, DatabaseStats, StatsQuery, StoreConnector, TrafficStore,
};
use crate::config::DbConfig;
use crate::error::PipelineError;
use crate::record::TrafficRecord;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS traffic_data (
        id          BIGSERIAL PRIMARY KEY,
        time_stamp  TIMESTAMPTZ NOT NULL,
        link_id     TEXT NOT NULL,
        link_name   TEXT NOT NULL,
        borough     TEXT NOT NULL,
        speed       DOUBLE PRECISION NOT NULL DEFAULT 0,
        travel_time DOUBLE PRECISION NOT NULL DEFAULT 0,
        status      TEXT NOT NULL,
        data_as_of  TIMESTAMPTZ NOT NULL,
        owner       TEXT NOT NULL,
        UNIQUE (link_id, time_stamp)
    )
"#;

const UPSERT_UPDATE: &str = r#"
    INSERT INTO traffic_data
        (time_stamp, link_id, link_name, borough, speed,
         travel_time, status, data_as_of, owner)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (link_id, time_stamp)
    DO UPDATE SET
        speed = EXCLUDED.speed,
        travel_time = EXCLUDED.travel_time,
        status = EXCLUDED.status
"#;

const UPSERT_IGNORE: &str = r#"
    INSERT INTO traffic_data
        (time_stamp, link_id, link_name, borough, speed,
         travel_time, status, data_as_of, owner)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (link_id, time_stamp) DO NOTHING
"#;

/// Opens PostgreSQL connections from a [`DbConfig`].
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    target: String,
    policy: ConflictPolicy,
}

impl PgConnector {
    pub fn new(config: &DbConfig, policy: ConflictPolicy) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user);
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        Self {
            options,
            target: format!("{}:{}/{}", config.host, config.port, config.database),
            policy,
        }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Store = PgStore;

    async fn connect(&self) -> Result<PgStore, PipelineError> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(PipelineError::Connection)?;
        info!(target_db = %self.target, "Connected to PostgreSQL");

        Ok(PgStore {
            conn,
            policy: self.policy,
        })
    }

    fn describe(&self) -> String {
        format!("PostgreSQL at {}", self.target)
    }
}

/// One open PostgreSQL connection.
pub struct PgStore {
    conn: PgConnection,
    policy: ConflictPolicy,
}

#[async_trait]
impl TrafficStore for PgStore {
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
    conn: &mut PgConnection,
    query: StatsQuery,
) -> Result<DatabaseStats, sqlx::Error> {
    let cutoff = query.cutoff(Utc::now());

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM traffic_data")
        .fetch_one(&mut *conn)
        .await?;

    let (earliest, latest): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
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
        WHERE time_stamp >= $1
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
        WHERE time_stamp >= $1
        AND speed > 0
        GROUP BY link_name, borough
        ORDER BY avg_speed
        LIMIT $2
        "#,
    )
    .bind(cutoff)
    .bind(query.top_n)
    .fetch_all(&mut *conn)
    .await?;

    Ok(DatabaseStats {
        total_records,
        earliest,
        latest,
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

#[cfg(test)]
mod tests {
    //! Run against a scratch database with
    //! `DATABASE_URL=postgres://... cargo test -- --ignored`.

    use super::*;
    use chrono::TimeZone;

    fn connector(policy: ConflictPolicy) -> PgConnector {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgConnector {
            options: url.parse().expect("DATABASE_URL is not a postgres URL"),
            target: "DATABASE_URL".to_string(),
            policy,
        }
    }

    async fn open(policy: ConflictPolicy) -> PgStore {
        let mut store = connector(policy).connect().await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn record(link_id: &str, speed: f64, link_name: &str) -> TrafficRecord {
        let timestamp = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        TrafficRecord {
            timestamp,
            link_id: link_id.to_string(),
            link_name: link_name.to_string(),
            borough: "Queens".to_string(),
            speed,
            travel_time: 100.0,
            status: "0".to_string(),
            data_as_of: timestamp.to_rfc3339(),
            link_points: "Unknown".to_string(),
            encoded_poly_line: "Unknown".to_string(),
            owner: "NYC_DOT_LIC".to_string(),
        }
    }

    async fn rows_with_prefix(store: &mut PgStore, prefix: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM traffic_data WHERE link_id LIKE $1")
            .bind(format!("{prefix}%"))
            .fetch_one(&mut store.conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_upsert_refreshes_measurements_only() {
        let mut store = open(ConflictPolicy::Update).await;

        store
            .upsert(&[record("pg-upsert-1", 12.0, "Original name")])
            .await
            .unwrap();
        store
            .upsert(&[record("pg-upsert-1", 33.0, "Renamed")])
            .await
            .unwrap();

        let (speed, link_name): (f64, String) = sqlx::query_as(
            "SELECT speed, link_name FROM traffic_data WHERE link_id = 'pg-upsert-1'",
        )
        .fetch_one(&mut store.conn)
        .await
        .unwrap();
        store.close().await.unwrap();

        assert_eq!(speed, 33.0);
        assert_eq!(link_name, "Original name");
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_upsert_twice_is_idempotent() {
        let mut store = open(ConflictPolicy::Update).await;
        let batch = vec![
            record("pg-idem-1", 20.0, "Link 1"),
            record("pg-idem-2", 30.0, "Link 2"),
        ];

        assert_eq!(store.upsert(&batch).await.unwrap(), 2);
        assert_eq!(store.upsert(&batch).await.unwrap(), 2);
        let count = rows_with_prefix(&mut store, "pg-idem-").await;
        store.close().await.unwrap();

        assert_eq!(count, 2);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_failed_row_rolls_back_whole_batch() {
        let mut store = open(ConflictPolicy::Update).await;
        // text columns reject NUL bytes
        let batch = vec![
            record("pg-rollback-1", 20.0, "Fine"),
            record("pg-rollback-2", 20.0, "Bad\0name"),
        ];

        let err = store.upsert(&batch).await.unwrap_err();
        let count = rows_with_prefix(&mut store, "pg-rollback-").await;
        store.close().await.unwrap();

        assert!(matches!(err, PipelineError::Write(_)));
        assert_eq!(count, 0);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_ignore_policy_keeps_first_measurement() {
        let mut store = open(ConflictPolicy::Ignore).await;

        store
            .upsert(&[record("pg-ignore-1", 20.0, "Link")])
            .await
            .unwrap();
        assert_eq!(
            store
                .upsert(&[record("pg-ignore-1", 45.0, "Link")])
                .await
                .unwrap(),
            0
        );

        let speed: f64 =
            sqlx::query_scalar("SELECT speed FROM traffic_data WHERE link_id = 'pg-ignore-1'")
                .fetch_one(&mut store.conn)
                .await
                .unwrap();
        store.close().await.unwrap();

        assert_eq!(speed, 20.0);
    }
}
