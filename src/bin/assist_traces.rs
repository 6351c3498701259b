//! assist-traces host
//!
//! Runs a `TraceService` behind a line-delimited JSON protocol on stdin/stdout.
//!
//! Each input line is one object:
//!
//! - `{"command": "<name>", ...payload}` runs a command
//! - `{"event": "state_changed", "data": {...}}` fires a host bus event
//! - `{"pipeline": "<run_id>", "event": {...}}` feeds the pipeline tracer
//!
//! Each produces one response line. On EOF the service is unloaded.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assist_traces::{BusEvent, EventBus, LocalEventBus, PipelineEvent, TraceService, TracesConfig, TracesError};

/// Host configuration
#[derive(Default)]
struct Config {
    /// JSON options file
    options: Option<PathBuf>,
    /// Overrides `sink_dir` from the options
    sink_dir: Option<PathBuf>,
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--options" | "-o" => {
                if i + 1 < args.len() {
                    config.options = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --options requires a value");
                    std::process::exit(1);
                }
            }
            "--sink-dir" | "-s" => {
                if i + 1 < args.len() {
                    config.sink_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --sink-dir requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("assist-traces - assistant trace capture host");
                println!();
                println!("USAGE:");
                println!("    assist-traces [OPTIONS] < commands.jsonl");
                println!();
                println!("OPTIONS:");
                println!("    -o, --options <FILE>      JSON options file");
                println!("    -s, --sink-dir <DIR>      Segment output root [default: /config/assist_traces/ndjson]");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn load_config(args: &Config) -> Result<TracesConfig, Box<dyn std::error::Error>> {
    let options: Value = match &args.options {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => Value::Null,
    };
    let mut config = TracesConfig::from_options(&options)?;
    if let Some(dir) = &args.sink_dir {
        config.sink_dir = dir.clone();
    }
    Ok(config.validate()?)
}

fn error_response(err: &TracesError) -> Value {
    json!({
        "ok": false,
        "error": err.to_string(),
        "retryable": err.is_retryable(),
    })
}

fn handle_line(service: &TraceService, bus: &LocalEventBus, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return json!({"ok": false, "error": format!("invalid JSON: {e}")}),
    };

    if let Some(name) = request.get("command").and_then(Value::as_str) {
        let mut payload = request.clone();
        if let Some(map) = payload.as_object_mut() {
            map.remove("command");
        }
        return match service.dispatch(name, payload) {
            Ok(result) => json!({"ok": true, "result": result}),
            Err(e) => error_response(&e),
        };
    }

    if let Some(run_id) = request.get("pipeline").and_then(Value::as_str) {
        let event: PipelineEvent = match request.get("event").cloned().map(serde_json::from_value) {
            Some(Ok(event)) => event,
            Some(Err(e)) => return json!({"ok": false, "error": format!("invalid pipeline event: {e}")}),
            None => return json!({"ok": false, "error": "pipeline request needs an 'event'"}),
        };
        return match service.pipeline_tracer().process(run_id, &event) {
            Ok(_) => json!({"ok": true}),
            Err(e) => error_response(&e),
        };
    }

    if let Some(event_type) = request.get("event").and_then(Value::as_str) {
        let data = request.get("data").cloned().unwrap_or(Value::Null);
        let delivered = bus.fire(&BusEvent::new(event_type, data));
        return json!({"ok": true, "delivered": delivered});
    }

    json!({"ok": false, "error": "expected 'command', 'event' or 'pipeline'"})
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = parse_args();
    let config = load_config(&args)?;

    let bus = Arc::new(LocalEventBus::new());
    let service = TraceService::setup(config, Arc::clone(&bus) as Arc<dyn EventBus>)?;
    info!("reading commands from stdin");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&service, &bus, &line);
        writeln!(out, "{response}")?;
        out.flush()?;
    }

    match service.unload() {
        Ok(stats) => info!(records = stats.records_written, errors = stats.write_errors, "done"),
        Err(e) => warn!(error = %e, "unload failed"),
    }
    Ok(())
}
