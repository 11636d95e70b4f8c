//! Structured JSON-lines logging for experiment sessions.
//!
//! Design goals:
//! 1. Levels from TRACE to FATAL, filtered by LOG_LEVEL
//! 2. Domain categories for filtering (session, phase, draw, drift, ...)
//! 3. One run directory per process with events and trace streams
//! 4. Enough per-draw detail to audit a session against its seed

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

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
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
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
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Session, // Creation, phase order, archive
    Phase,   // Phase start/complete
    Draw,    // Ball draws and rewards
    Drift,   // Probability adjustments
    Persist, // Local CSV / archive writes
    Remote,  // Secondary sink delivery
    System,  // Startup, shutdown, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Session => "session",
            Domain::Phase => "phase",
            Domain::Draw => "draw",
            Domain::Drift => "drift",
            Domain::Persist => "persist",
            Domain::Remote => "remote",
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

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
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

        // A missing stream only loses file output; stderr echo still works.
        let open = |name: &str| match File::create(run_dir.join(name)) {
            Ok(f) => Some(Mutex::new(BufWriter::new(f))),
            Err(err) => {
                eprintln!("[log] failed to create {}: {}", name, err);
                None
            }
        };

        RunContext {
            events: open("events.jsonl"),
            trace: open("trace.jsonl"),
            run_id,
        }
    })
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(Ok(mut w)) = writer.as_ref().map(|m| m.lock()) {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

fn echo_enabled(level: Level) -> bool {
    if level >= Level::Warn {
        return true;
    }
    matches!(
        std::env::var("LOG_ECHO").as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, mut fields: Map<String, Value>) {
    let ctx = ensure_run_context();

    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    // participant and phase sit at top level for grep-ability
    for key in ["participant_id", "phase", "msg"] {
        if let Some(value) = fields.remove(key) {
            entry.insert(key.to_string(), value);
        }
    }
    entry.insert("data".to_string(), Value::Object(fields));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if echo_enabled(level) {
        eprintln!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_session_created(participant_id: &str, seed: u64, phase_order: &[u8]) {
    log(
        Level::Info,
        Domain::Session,
        "session_created",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("seed", json!(seed.to_string())),
            ("phase_order", json!(phase_order)),
        ]),
    );
}

pub fn log_phase_start(participant_id: &str, phase: u8, phase_seed: u64, p_safe: f64, p_uncertain: f64) {
    log(
        Level::Info,
        Domain::Phase,
        "phase_start",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("phase", json!(phase)),
            ("phase_seed", json!(phase_seed.to_string())),
            ("init_p_safe", v_num(p_safe)),
            ("init_p_uncertain", v_num(p_uncertain)),
        ]),
    );
}

pub fn log_phase_complete(participant_id: &str, phase: u8, cumulative_earnings: i64) {
    log(
        Level::Info,
        Domain::Phase,
        "phase_complete",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("phase", json!(phase)),
            ("cumulative_earnings", json!(cumulative_earnings)),
        ]),
    );
}

pub fn log_draw(
    participant_id: &str,
    phase: u8,
    round: u32,
    box_chosen: &str,
    outcome: &str,
    reward: i64,
    cumulative_earnings: i64,
) {
    log(
        Level::Debug,
        Domain::Draw,
        "draw",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("phase", json!(phase)),
            ("round", json!(round)),
            ("box", v_str(box_chosen)),
            ("outcome", v_str(outcome)),
            ("reward", json!(reward)),
            ("cumulative_earnings", json!(cumulative_earnings)),
        ]),
    );
}

pub fn log_adjustment(phase: u8, box_chosen: &str, before: (f64, f64), after: (f64, f64)) {
    log(
        Level::Trace,
        Domain::Drift,
        "adjust",
        obj(&[
            ("phase", json!(phase)),
            ("box", v_str(box_chosen)),
            ("p_safe_before", v_num(before.0)),
            ("p_uncertain_before", v_num(before.1)),
            ("p_safe", v_num(after.0)),
            ("p_uncertain", v_num(after.1)),
        ]),
    );
}

pub fn log_persist(target: &str, path: &str, rows: usize) {
    log(
        Level::Info,
        Domain::Persist,
        "rows_written",
        obj(&[
            ("target", v_str(target)),
            ("path", v_str(path)),
            ("rows", json!(rows)),
        ]),
    );
}

pub fn log_persist_rejected(target: &str, reason: &str) {
    log(
        Level::Error,
        Domain::Persist,
        "save_rejected",
        obj(&[("target", v_str(target)), ("reason", v_str(reason))]),
    );
}

pub fn log_remote_failure(sheet: &str, rows: usize, error: &str) {
    log(
        Level::Warn,
        Domain::Remote,
        "append_failed",
        obj(&[
            ("sheet", v_str(sheet)),
            ("rows", json!(rows)),
            ("error", v_str(error)),
        ]),
    );
}

pub fn log_remote_delivered(sheet: &str, rows: usize) {
    log(
        Level::Debug,
        Domain::Remote,
        "append_ok",
        obj(&[("sheet", v_str(sheet)), ("rows", json!(rows))]),
    );
}

pub fn log_session_summary(participant_id: &str, rounds: usize, cumulative_earnings: i64, digest: &str) {
    log(
        Level::Info,
        Domain::Session,
        "session_summary",
        obj(&[
            ("participant_id", v_str(participant_id)),
            ("rounds", json!(rounds)),
            ("cumulative_earnings", json!(cumulative_earnings)),
            ("digest", v_str(digest)),
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

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================
