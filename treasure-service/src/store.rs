// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, types::Type};
use treasure_common::{RoutePoints, RouteProgress};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS route_progress (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        route_id TEXT UNIQUE NOT NULL,
        visited INTEGER NOT NULL DEFAULT 0 CHECK (visited IN (0, 1)),
        points INTEGER NOT NULL CHECK (points >= 0),
        visited_at TEXT,
        CHECK ((visited = 0 AND visited_at IS NULL) OR (visited = 1 AND visited_at IS NOT NULL))
    );

    CREATE TABLE IF NOT EXISTS misc_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_route_progress_route_id ON route_progress(route_id);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Seeded { routes: usize },
    AlreadyInitialized { routes: usize },
}

/// Durable per-route progress plus a free-form key/value table.
///
/// `mark_visited` is the only per-route write: it must flip a row from
/// unvisited to visited atomically and report how many rows it changed, so
/// callers can detect a lost race without holding a lock of their own.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Seed one unvisited row per entry when the store holds no routes yet.
    async fn bootstrap(&self, seed: &[RoutePoints]) -> anyhow::Result<BootstrapOutcome>;

    /// All rows ordered by route id.
    async fn get_all(&self) -> anyhow::Result<Vec<RouteProgress>>;

    async fn get_by_route_id(&self, route_id: &str) -> anyhow::Result<Option<RouteProgress>>;

    /// Conditional write; returns the number of rows changed (0 or 1).
    async fn mark_visited(&self, route_id: &str, visited_at: DateTime<Utc>)
    -> anyhow::Result<usize>;

    /// Clear every visit and all misc entries in one transaction.
    async fn reset_all(&self) -> anyhow::Result<()>;

    /// Insert `key` only while every route is visited and the key is unset.
    /// Evaluated in one statement, so a reset that lands first leaves it unset.
    async fn put_misc_if_all_visited(&self, key: &str, value: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open progress database {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("failed to enable WAL journal")?;
        Self::from_connection(conn, busy_timeout)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::from_connection(conn, Duration::from_secs(1))
    }

    #[cfg(test)]
    pub async fn misc_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM misc_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read misc key {key}"))
        })
        .await
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> anyhow::Result<Self> {
        conn.busy_timeout(busy_timeout)
            .context("failed to set busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("failed to create progress schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("progress store connection poisoned"))?;
            op(&mut *guard)
        })
        .await
        .context("progress store task aborted")?
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn bootstrap(&self, seed: &[RoutePoints]) -> anyhow::Result<BootstrapOutcome> {
        let seed = seed.to_vec();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin bootstrap transaction")?;

            let existing: i64 = tx
                .query_row("SELECT COUNT(*) FROM route_progress", [], |row| row.get(0))
                .context("failed to count routes")?;
            if existing > 0 {
                return Ok(BootstrapOutcome::AlreadyInitialized {
                    routes: existing as usize,
                });
            }

            {
                let mut insert = tx
                    .prepare("INSERT INTO route_progress (route_id, points) VALUES (?1, ?2)")
                    .context("failed to prepare seed insert")?;
                for route in &seed {
                    insert
                        .execute(params![route.route_id, route.points])
                        .with_context(|| format!("failed to seed route {}", route.route_id))?;
                }
            }

            tx.commit().context("failed to commit route seed")?;
            Ok(BootstrapOutcome::Seeded { routes: seed.len() })
        })
        .await
    }

    async fn get_all(&self) -> anyhow::Result<Vec<RouteProgress>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT route_id, visited, points, visited_at
                     FROM route_progress
                     ORDER BY route_id",
                )
                .context("failed to prepare route listing")?;
            let rows = stmt
                .query_map([], map_progress_row)
                .context("failed to list routes")?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("failed to read route row")
        })
        .await
    }

    async fn get_by_route_id(&self, route_id: &str) -> anyhow::Result<Option<RouteProgress>> {
        let route_id = route_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT route_id, visited, points, visited_at
                 FROM route_progress
                 WHERE route_id = ?1",
                params![route_id],
                map_progress_row,
            )
            .optional()
            .with_context(|| format!("failed to load route {route_id}"))
        })
        .await
    }

    async fn mark_visited(
        &self,
        route_id: &str,
        visited_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let route_id = route_id.to_string();
        let visited_at = encode_timestamp(visited_at);
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE route_progress
                 SET visited = 1, visited_at = ?1
                 WHERE route_id = ?2 AND visited = 0",
                params![visited_at, route_id],
            )
            .with_context(|| format!("failed to mark route {route_id} visited"))
        })
        .await
    }

    async fn reset_all(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin reset transaction")?;
            tx.execute(
                "UPDATE route_progress SET visited = 0, visited_at = NULL",
                [],
            )
            .context("failed to clear route visits")?;
            tx.execute("DELETE FROM misc_state", [])
                .context("failed to clear misc state")?;
            tx.commit().context("failed to commit reset")?;
            Ok(())
        })
        .await
    }

    async fn put_misc_if_all_visited(&self, key: &str, value: &str) -> anyhow::Result<bool> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "INSERT INTO misc_state (key, value)
                     SELECT ?1, ?2
                     WHERE NOT EXISTS (SELECT 1 FROM route_progress WHERE visited = 0)
                     ON CONFLICT(key) DO NOTHING",
                    params![key, value],
                )
                .with_context(|| format!("failed to write misc key {key}"))?;
            Ok(changed == 1)
        })
        .await
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn map_progress_row(row: &Row<'_>) -> rusqlite::Result<RouteProgress> {
    let visited_at = row
        .get::<_, Option<String>>(3)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(error))
                })
        })
        .transpose()?;

    Ok(RouteProgress {
        route_id: row.get(0)?,
        visited: row.get(1)?,
        points: row.get(2)?,
        visited_at,
    })
}
