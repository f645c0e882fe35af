use crate::reading::{format_timestamp, Reading};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;

// sqlite caps bound parameters per statement; four binds per row.
const MAX_ROWS_PER_STATEMENT: usize = 200;

const HOURLY_BUCKET: &str = "strftime('%Y-%m-%d %H:00:00', timestamp)";

/// Append-only history of every reading, one row per observation.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryRow {
    pub sensor_type: String,
    pub location: String,
    pub timestamp: String,
    pub value: f64,
}

/// Relative windows accepted by the history API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HistoryWindow {
    LastHour,
    Last6Hours,
    #[default]
    Last24Hours,
    Last7Days,
    Last30Days,
}

impl HistoryWindow {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "1h" => Some(Self::LastHour),
            "6h" => Some(Self::Last6Hours),
            "24h" => Some(Self::Last24Hours),
            "7d" => Some(Self::Last7Days),
            "30d" => Some(Self::Last30Days),
            _ => None,
        }
    }

    pub fn duration(self) -> ChronoDuration {
        match self {
            Self::LastHour => ChronoDuration::hours(1),
            Self::Last6Hours => ChronoDuration::hours(6),
            Self::Last24Hours => ChronoDuration::hours(24),
            Self::Last7Days => ChronoDuration::days(7),
            Self::Last30Days => ChronoDuration::days(30),
        }
    }

    /// Windows longer than a day come back hourly-averaged.
    pub fn downsample(self) -> bool {
        matches!(self, Self::Last7Days | Self::Last30Days)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RangeQuery {
    pub sensor_type: Option<String>,
    pub location: Option<String>,
    pub since: NaiveDateTime,
    pub until: Option<NaiveDateTime>,
    pub downsample: bool,
}

impl RangeQuery {
    pub fn for_window(window: HistoryWindow, now: NaiveDateTime) -> Self {
        Self {
            since: now - window.duration(),
            downsample: window.downsample(),
            ..Self::default()
        }
    }

    pub fn sensor_type(mut self, sensor_type: Option<String>) -> Self {
        self.sensor_type = sensor_type.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|v| !v.trim().is_empty());
        self
    }
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create database dir {}", parent.display()))?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("open {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_type TEXT NOT NULL,
                location TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                value REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp ON sensor_data (timestamp)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sensor_data_key_timestamp
            ON sensor_data (sensor_type, location, timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts every reading in one transaction; on error nothing is committed.
    pub async fn append_batch(&self, readings: &[Reading]) -> Result<u64> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in readings.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO sensor_data (sensor_type, location, timestamp, value) ",
            );
            builder.push_values(chunk, |mut b, reading| {
                b.push_bind(reading.sensor_type.as_str().to_string())
                    .push_bind(reading.location.clone())
                    .push_bind(reading.timestamp_text())
                    .push_bind(reading.value);
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn query_range(&self, query: &RangeQuery) -> Result<Vec<HistoryRow>> {
        let mut builder: QueryBuilder<Sqlite> = if query.downsample {
            QueryBuilder::new(format!(
                "SELECT sensor_type, location, {HOURLY_BUCKET} AS bucket, AVG(value) AS value \
                 FROM sensor_data WHERE timestamp >= "
            ))
        } else {
            QueryBuilder::new(
                "SELECT sensor_type, location, timestamp AS bucket, value \
                 FROM sensor_data WHERE timestamp >= ",
            )
        };
        builder.push_bind(format_timestamp(query.since));
        if let Some(until) = query.until {
            builder.push(" AND timestamp <= ").push_bind(format_timestamp(until));
        }
        if let Some(sensor_type) = &query.sensor_type {
            builder.push(" AND sensor_type = ").push_bind(sensor_type.clone());
        }
        if let Some(location) = &query.location {
            builder.push(" AND location = ").push_bind(location.clone());
        }
        if query.downsample {
            builder.push(" GROUP BY sensor_type, location, bucket ORDER BY bucket, sensor_type, location");
        } else {
            builder.push(" ORDER BY timestamp, id");
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| -> Result<HistoryRow> {
                Ok(HistoryRow {
                    sensor_type: row.try_get("sensor_type")?,
                    location: row.try_get("location")?,
                    timestamp: row.try_get("bucket")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    pub async fn count_rows(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sensor_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
