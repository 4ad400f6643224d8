//! Structured JSON logging for the marketplace engine.
//!
//! Library-friendly trim of the usual run-dir logger: one JSONL stream on
//! stderr, level and domain filters from the environment, a global sequence
//! counter for ordering across tasks.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Vault,  // custody: locks, releases, forfeits, earnings
    Motion, // reputation events and recomputation
    Room,   // lifecycle transitions
    Queue,  // applications, accepts, settlement
    Match,  // recommendation reads
    Sweep,  // background orchestrator
    System, // startup, config, store
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Vault => "vault",
            Domain::Motion => "motion",
            Domain::Room => "room",
            Domain::Queue => "queue",
            Domain::Match => "match",
            Domain::Sweep => "sweep",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

/// RFC3339 timestamp with milliseconds.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("seq".to_string(), json!(LOG_SEQ.fetch_add(1, Ordering::SeqCst)));
    entry.insert("lvl".to_string(), json!(level.as_str()));
    entry.insert("domain".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("data".to_string(), Value::Object(fields));

    let line = Value::Object(entry).to_string();
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "{}", line);
}

pub fn json_log(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Info, domain, event, fields);
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key.to_string(), value.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_int(n: i64) -> Value {
    json!(n)
}
