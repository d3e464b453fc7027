//! Structured JSON-lines logging.
//!
//! Every record carries a run id and a sequence number so a session can be
//! replayed and audited. Records go to stdout and to per-run files:
//! `events.jsonl` (info and above), `trace.jsonl` (trace/debug) and
//! `metrics.jsonl` (anything in the metrics domain).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,  // Ticks and price buffers
    Signal,  // Drift readings and decisions
    Risk,    // Sizing and trade gates
    Exec,    // Order submission and fills
    Audit,   // Proof capsules
    Metrics, // Observability readings
    System,  // Startup, shutdown, backtest runs
    Profile, // Timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Signal => "signal",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Audit => "audit",
            Domain::Metrics => "metrics",
            Domain::System => "system",
            Domain::Profile => "profile",
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

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    metrics: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            metrics: open_sink(run_dir.join("metrics.jsonl")),
            run_id,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["symbol", "signal_hash", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

static SINK_ERROR_REPORTED: AtomicBool = AtomicBool::new(false);

/// Append one record. The first write failure is reported on stderr;
/// later ones are dropped silently.
fn write_line<W: Write>(writer: &Option<Mutex<W>>, line: &str) -> bool {
    let Some(Ok(mut w)) = writer.as_ref().map(|w| w.lock()) else {
        return false;
    };
    match writeln!(w, "{}", line).and_then(|_| w.flush()) {
        Ok(()) => true,
        Err(err) => {
            if !SINK_ERROR_REPORTED.swap(true, Ordering::SeqCst) {
                eprintln!("[log] failed to write log record: {}", err);
            }
            false
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain, event, fields);
}

fn emit_record(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if domain == Domain::Metrics {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    };
    println!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_tick(symbol: &str, price: f64, buffered: usize) {
    log(
        Level::Trace,
        Domain::Market,
        "tick",
        obj(&[
            ("symbol", v_str(symbol)),
            ("price", v_num(price)),
            ("buffered", json!(buffered)),
        ]),
    );
}

pub fn log_signal(symbol: &str, delta_phi: f64, confidence: f64, np_wall: bool, no_recovery: bool, direction: i8) {
    log(
        Level::Debug,
        Domain::Signal,
        "signal",
        obj(&[
            ("symbol", v_str(symbol)),
            ("delta_phi", v_num(delta_phi)),
            ("confidence", v_num(confidence)),
            ("np_wall", json!(np_wall)),
            ("no_recovery", json!(no_recovery)),
            ("direction", json!(direction)),
        ]),
    );
}

pub fn log_risk_check(check: &str, result: &str, value: f64, threshold: f64) {
    log(
        Level::Debug,
        Domain::Risk,
        "guard",
        obj(&[
            ("check", v_str(check)),
            ("result", v_str(result)),
            ("value", v_num(value)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

pub fn log_order_submit(symbol: &str, side: &str, qty: f64, price: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "order_submit",
        obj(&[
            ("symbol", v_str(symbol)),
            ("side", v_str(side)),
            ("qty", v_num(qty)),
            ("price", v_num(price)),
        ]),
    );
}

pub fn log_fill(symbol: &str, side: &str, price: f64, qty: f64, fee: f64, cash_after: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "fill",
        obj(&[
            ("symbol", v_str(symbol)),
            ("side", v_str(side)),
            ("price", v_num(price)),
            ("qty", v_num(qty)),
            ("fee", v_num(fee)),
            ("cash_after", v_num(cash_after)),
        ]),
    );
}

pub fn log_capsule(symbol: &str, signal_hash: &str, verdict: &str, id: i64) {
    log(
        Level::Debug,
        Domain::Audit,
        "capsule_stored",
        obj(&[
            ("symbol", v_str(symbol)),
            ("signal_hash", v_str(signal_hash)),
            ("verdict", v_str(verdict)),
            ("id", json!(id)),
        ]),
    );
}

pub fn log_metric(name: &str, labels: &[(&str, &str)], value: f64) {
    let labels: Map<String, Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v_str(v)))
        .collect();
    log(
        Level::Debug,
        Domain::Metrics,
        "reading",
        obj(&[
            ("name", v_str(name)),
            ("labels", Value::Object(labels)),
            ("value", v_num(value)),
        ]),
    );
}

/// Session summary on shutdown
pub fn log_session_summary(
    duration_secs: u64,
    stored_capsules: u64,
    session_capsules: u64,
    orders: u64,
    cash: f64,
) {
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("duration_secs", json!(duration_secs)),
            ("stored_capsules", json!(stored_capsules)),
            ("session_capsules", json!(session_capsules)),
            ("orders", json!(orders)),
            ("cash", v_num(cash)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Non-finite numbers become null.
pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}
