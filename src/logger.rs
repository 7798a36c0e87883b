//! Global logger
//!
//! Source-tagged logging with persistence to a SQLite database. Records are
//! pushed over a channel to a background thread that batch-inserts them, so
//! request paths never block on disk. Every record is also echoed to stderr.

use dirs::data_dir;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// Log message for batching
#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

// Async log channel sender
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

// ============================================
// Database Functions
// ============================================

fn db_path() -> PathBuf {
    if let Ok(path) = std::env::var("RELAY_GATEWAY_LOG_DB") {
        return PathBuf::from(path);
    }
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("gateway.db");
    p
}

fn open_conn() -> Option<Connection> {
    Connection::open(db_path()).ok()
}

/// Initialize the logger: create tables and start the batch writer.
pub fn init() {
    INIT.call_once(|| {
        if let Some(conn) = open_conn() {
            let _ = conn.execute(
                "CREATE TABLE IF NOT EXISTS gateway_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL
                )",
                [],
            );
            let _ = conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_gateway_logs_timestamp ON gateway_logs(timestamp DESC)",
                [],
            );
            let _ = conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_gateway_logs_source ON gateway_logs(source)",
                [],
            );
        }

        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        if let Ok(mut sender) = LOG_SENDER.write() {
            *sender = Some(tx);
        }
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }

    let Some(mut conn) = open_conn() else {
        buffer.clear();
        return;
    };
    let Ok(tx) = conn.transaction() else {
        buffer.clear();
        return;
    };

    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO gateway_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }

    let _ = tx.commit();
}

// ============================================
// Global Log Functions
// ============================================

fn min_level() -> LogLevel {
    crate::config::load()
        .log_level
        .as_deref()
        .and_then(LogLevel::from_str)
        .unwrap_or(LogLevel::Info)
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    if level < min_level() {
        return;
    }

    let timestamp = chrono::Utc::now().timestamp();
    eprintln!("[{}] [{}] {}", level.as_str(), source, message);

    let msg = LogMessage {
        timestamp,
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    if let Ok(guard) = LOG_SENDER.read() {
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(msg);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

/// Query persisted logs, newest first.
pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let Some(conn) = open_conn() else {
        return Vec::new();
    };
    let mut sql = String::from(
        "SELECT id, timestamp, level, source, message FROM gateway_logs WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }

    sql.push_str(" ORDER BY timestamp DESC");

    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return Vec::new();
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    });

    match rows {
        Ok(mapped) => mapped.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Delete records older than the cutoff; returns rows removed.
pub fn prune_before(cutoff: i64) -> usize {
    let Some(conn) = open_conn() else {
        return 0;
    };
    conn.execute(
        "DELETE FROM gateway_logs WHERE timestamp < ?1",
        params![cutoff],
    )
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_round_trip() {
        for raw in ["debug", "info", "warn", "error"] {
            let level = LogLevel::from_str(raw).unwrap();
            assert_eq!(level.as_str(), raw);
        }
        assert!(LogLevel::from_str("verbose").is_none());
    }

    #[test]
    fn test_query_and_prune_on_temp_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.db");
        std::env::set_var("RELAY_GATEWAY_LOG_DB", &path);

        init();
        error("test", "first message");
        // Flush happens on the writer thread; give it a moment.
        std::thread::sleep(Duration::from_millis(1200));

        let entries = query_logs(&LogQuery {
            source: Some("test".to_string()),
            ..Default::default()
        });
        assert!(entries.iter().any(|e| e.message == "first message"));

        let removed = prune_before(chrono::Utc::now().timestamp() + 10);
        assert!(removed >= 1);

        std::env::remove_var("RELAY_GATEWAY_LOG_DB");
    }
}
