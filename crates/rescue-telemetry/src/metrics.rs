use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Metric names recorded by the relay.
pub mod names {
    pub const CONNECTIONS_ADMITTED: &str = "ws.connections.admitted";
    pub const CONNECTIONS_REJECTED: &str = "ws.connections.rejected";
    pub const CONNECTIONS_EVICTED: &str = "ws.connections.evicted";
    pub const CONNECTIONS_ACTIVE: &str = "ws.connections.active";
    pub const MESSAGES_RECEIVED: &str = "ws.messages.received";
    pub const MESSAGES_INVALID: &str = "ws.messages.invalid";
    pub const BROADCAST_DELIVERED: &str = "ws.broadcast.delivered";
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// One persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Name plus label pairs, sorted by label key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: BTreeMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// In-memory counters and gauges with SQLite snapshots for history.
pub struct RelayMetrics {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
    db: Option<Mutex<Connection>>,
}

impl RelayMetrics {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Counters and gauges only; snapshots are skipped.
    pub fn detached() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            db: Some(Mutex::new(conn)),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    /// Persist every current value. Returns the number of rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(String, f64, Option<String>, MetricType)> = Vec::new();
        for (key, c) in self.counters.read().iter() {
            rows.push((
                key.name.clone(),
                c.load(Ordering::Relaxed) as f64,
                key.labels_json(),
                MetricType::Counter,
            ));
        }
        for (key, g) in self.gauges.read().iter() {
            rows.push((
                key.name.clone(),
                g.load(Ordering::Relaxed) as f64,
                key.labels_json(),
                MetricType::Gauge,
            ));
        }

        let db = db.lock();
        for (name, value, labels, metric_type) in &rows {
            db.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, name, value, labels, metric_type.as_str()],
            )?;
        }
        Ok(rows.len())
    }

    /// Newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let db = db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let metric_type = match row.get::<_, String>(5)?.as_str() {
                "gauge" => MetricType::Gauge,
                _ => MetricType::Counter,
            };
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type,
            })
        })?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp <= ?1",
            rusqlite::params![cutoff],
        )
    }
}
