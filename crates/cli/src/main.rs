//! `convertctl` – local file conversion tools over one shared ffmpeg engine.
//!
//! Cheap text tools run immediately; media tools share a single lazily
//! loaded engine. `serve` keeps that engine warm across requests.

mod config;
mod logging;
mod serve;

use clap::{Parser, Subcommand};
use convert_engine::ffmpeg::FfmpegFactory;
use convert_engine::types::*;
use convert_engine::{
    EngineError, EngineManager, EngineState, ProgressSubscription, ToolContext, ToolRegistry,
};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Exit code for a failed scenario.
const EXIT_SCENARIO_FAILED: i32 = 1;
/// Exit code for a failed tool invocation.
const EXIT_TOOL_FAILED: i32 = 2;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "convertctl",
    version,
    about = "Local file conversion tools over a shared ffmpeg engine"
)]
struct Cli {
    /// Extra config file layered over convertctl.yaml / .convertctl.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available tools.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Invoke a tool by name with JSON args.
    Call {
        /// Tool name (e.g. "base64", "convert_audio").
        tool: String,
        /// JSON args to pass to the tool.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Render engine progress on stderr while the tool runs.
        #[arg(long)]
        watch: bool,
        /// Give up waiting after this long (e.g. "30s", "5000ms", "2m").
        #[arg(long)]
        timeout: Option<String>,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Run a scripted scenario from a YAML file.
    RunScenario {
        /// Path to the scenario YAML file.
        file: PathBuf,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Report platform facts, ffmpeg availability and engine state.
    Doctor {
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Start daemon mode over a Unix socket.
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(EXIT_TOOL_FAILED);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let cfg = config::load_config(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;
    logging::init_logging(&cfg.logging);

    let engine = EngineManager::new(
        FfmpegFactory::new(cfg.engine.ffmpeg_path.clone()),
        cfg.engine.settings(),
    );
    let mut ctx = ToolContext::new(engine.clone());
    if let Some(limit) = cfg.engine.acquire_timeout() {
        ctx = ctx.with_acquire_timeout(limit);
    }
    let registry = ToolRegistry::new();

    let code = match cli.command {
        Commands::List { json } => cmd_list(&registry, json),
        Commands::Call {
            tool,
            args,
            json,
            watch,
            timeout,
            artifacts,
        } => {
            let timeout = timeout.as_deref().map(parse_duration).transpose()?;
            let opts = CallOptions {
                json,
                watch,
                timeout,
                artifacts,
            };
            cmd_call(&tool, &args, opts, &ctx, &registry).await
        }
        Commands::RunScenario {
            file,
            artifacts,
            json,
        } => cmd_run_scenario(&file, json, artifacts, &ctx, &registry).await,
        Commands::Doctor { json, out } => {
            cmd_doctor(cfg.engine.ffmpeg_path.clone(), &engine, json, out).await
        }
        Commands::Serve { socket } => {
            serve::run_daemon(socket, ctx, registry).await?;
            0
        }
    };
    Ok(code)
}

/// Parse `"250ms"`, `"30s"`, `"2m"`; a bare number is seconds.
fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration '{}'", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n.saturating_mul(60))),
        _ => anyhow::bail!("invalid duration unit in '{}' (use ms, s or m)", s),
    }
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_list(registry: &ToolRegistry, json: bool) -> i32 {
    let catalog = registry.catalog();
    if json {
        println!("{}", serde_json::to_string_pretty(&catalog).unwrap_or_default());
    } else {
        for info in catalog {
            let marker = if info.uses_engine { " [engine]" } else { "" };
            println!("{:<14} {}{}", info.name, info.description, marker);
        }
    }
    0
}

struct CallOptions {
    json: bool,
    watch: bool,
    timeout: Option<Duration>,
    artifacts: Option<PathBuf>,
}

async fn cmd_call(
    tool: &str,
    args_str: &str,
    opts: CallOptions,
    ctx: &ToolContext,
    registry: &ToolRegistry,
) -> i32 {
    let args: Value = match serde_json::from_str(args_str) {
        Ok(v) => v,
        Err(e) => {
            let r = ToolResult::err(format!("invalid JSON args: {}", e))
                .with_metadata("error_code", ErrorCode::InvalidInput.to_string())
                .with_metadata("tool", tool);
            return output_result(tool, &r, opts.json);
        }
    };

    let started = Instant::now();
    let watcher = opts.watch.then(|| spawn_watcher(ctx.engine().clone()));

    let result = match attach_progress(tool, &opts, ctx, registry).await {
        Err(failure) => failure,
        Ok(subscription) => {
            let remaining = opts.timeout.map(|l| l.saturating_sub(started.elapsed()));
            let result = match remaining {
                Some(limit) => registry.execute_with_timeout(tool, &args, ctx, limit).await,
                None => registry.execute(tool, &args, ctx).await,
            };
            drop(subscription);
            result
        }
    };

    if let Some(w) = watcher {
        w.abort();
        let _ = w.await;
        eprintln!();
    }

    if let Some(ref dir) = opts.artifacts {
        write_artifacts(dir, &result);
    }
    output_result(tool, &result, opts.json)
}

/// With `--watch` on an engine tool, load the engine up front and attach the
/// progress subscription before the tool runs, so no progress event is missed.
async fn attach_progress(
    tool: &str,
    opts: &CallOptions,
    ctx: &ToolContext,
    registry: &ToolRegistry,
) -> Result<Option<ProgressSubscription>, ToolResult<Value>> {
    let uses_engine = registry
        .catalog()
        .iter()
        .any(|info| info.name == tool && info.uses_engine);
    if !opts.watch || !uses_engine {
        return Ok(None);
    }

    let acquired = match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, ctx.acquire_engine())
            .await
            .unwrap_or(Err(EngineError::Timeout(limit))),
        None => ctx.acquire_engine().await,
    };
    match acquired {
        Ok(_) => Ok(ctx.engine().subscribe_progress().ok()),
        Err(e) => Err(ToolResult::err(e.to_string())
            .with_metadata("error_code", e.error_code().to_string())
            .with_metadata("tool", tool)),
    }
}

/// Render state changes on stderr until aborted.
fn spawn_watcher(engine: EngineManager) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = engine.watch_state();
        loop {
            let state = rx.borrow_and_update().clone();
            render_progress(&state);
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

fn render_progress(state: &EngineState) {
    let busy = if state.busy { "*" } else { " " };
    let message = state.status_message.as_deref().unwrap_or("");
    let line: String = format!(
        "[{:<12}] {:>3}%{} {}",
        state.status.to_string(),
        state.display_progress,
        busy,
        message
    )
    .chars()
    .take(99)
    .collect();
    let mut err = std::io::stderr();
    let _ = write!(err, "\r{:<99}", line);
    let _ = err.flush();
}

async fn cmd_run_scenario(
    file: &Path,
    json: bool,
    artifacts: Option<PathBuf>,
    ctx: &ToolContext,
    registry: &ToolRegistry,
) -> i32 {
    let yaml = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            let r = ToolResult::err(format!("cannot read scenario file: {}", e))
                .with_metadata("error_code", ErrorCode::InvalidInput.to_string());
            return output_result("run-scenario", &r, json);
        }
    };

    let scenario = match convert_engine::scenario::load_scenario(&yaml) {
        Ok(s) => s,
        Err(e) => {
            let r = ToolResult::err(e)
                .with_metadata("error_code", ErrorCode::InvalidInput.to_string());
            return output_result("run-scenario", &r, json);
        }
    };

    let scenario_result = convert_engine::scenario::run_scenario(&scenario, ctx, registry).await;

    if json {
        let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
        println!("{}", j);
    } else {
        println!(
            "Scenario: {}",
            scenario_result.name.as_deref().unwrap_or("<unnamed>")
        );
        println!("Overall: {:?}", scenario_result.overall_status);
        for (i, sr) in scenario_result.step_results.iter().enumerate() {
            let target = sr.meta("tool").and_then(Value::as_str).unwrap_or("reset");
            let outcome = if sr.is_success() { "ok" } else { "failed" };
            let elapsed = sr.meta("elapsed_ms").and_then(Value::as_u64).unwrap_or(0);
            println!("  Step {}: {} -> {} ({}ms)", i, target, outcome, elapsed);
        }
    }

    if let Some(ref dir) = artifacts {
        let art_dir = dir.join(new_run_id());
        if let Err(e) = std::fs::create_dir_all(&art_dir) {
            eprintln!(
                "warning: failed to create artifacts dir {}: {}",
                art_dir.display(),
                e
            );
        } else {
            let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
            let _ = std::fs::write(art_dir.join("result.json"), j);

            // Per-step results as events.jsonl
            let mut lines = String::new();
            for sr in &scenario_result.step_results {
                if let Ok(line) = serde_json::to_string(sr) {
                    lines.push_str(&line);
                    lines.push('\n');
                }
            }
            let _ = std::fs::write(art_dir.join("events.jsonl"), lines);
        }
    }

    match scenario_result.overall_status {
        ScenarioStatus::Pass => 0,
        ScenarioStatus::Fail => EXIT_SCENARIO_FAILED,
    }
}

async fn cmd_doctor(
    ffmpeg_path: Option<PathBuf>,
    engine: &EngineManager,
    json: bool,
    out: Option<PathBuf>,
) -> i32 {
    let result = convert_engine::doctor::run_doctor(ffmpeg_path, engine).await;
    if let Some(ref path) = out {
        write_result_file(path, &result);
    }
    output_result("doctor", &result, json)
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(label: &str, result: &ToolResult<Value>, json: bool) -> i32 {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(label, result);
    }

    if result.is_success() {
        0
    } else {
        EXIT_TOOL_FAILED
    }
}

fn print_human(label: &str, r: &ToolResult<Value>) {
    let status = if r.is_success() { "OK" } else { "FAILED" };
    println!("[{}] {}", status, label);

    if let Some(run_id) = r.meta("run_id").and_then(Value::as_str) {
        println!("  run_id: {}", run_id);
    }
    if let Some(ms) = r.meta("elapsed_ms").and_then(Value::as_u64) {
        println!("  timing: {}ms", ms);
    }

    if let Some(err) = r.error() {
        match r.meta("error_code").and_then(Value::as_str) {
            Some(code) => println!("  error:  {} – {}", code, err),
            None => println!("  error:  {}", err),
        }
    }

    if let Some(data) = r.data() {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_result_file(path: &Path, result: &ToolResult<Value>) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        eprintln!(
            "warning: failed to write result to {}: {}",
            path.display(),
            e
        );
    }
}

fn write_artifacts(dir: &Path, result: &ToolResult<Value>) {
    let run_id = result
        .meta("run_id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(new_run_id);
    let art_dir = dir.join(run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        eprintln!(
            "warning: failed to create artifacts dir {}: {}",
            art_dir.display(),
            e
        );
        return;
    }

    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    let _ = std::fs::write(art_dir.join("result.json"), &j);

    // events.jsonl (single event for a plain call)
    if let Ok(line) = serde_json::to_string(result) {
        let _ = std::fs::write(art_dir.join("events.jsonl"), format!("{}\n", line));
    }
}
