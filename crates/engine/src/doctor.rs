//! Doctor – gather environment facts for diagnostics.

use crate::ffmpeg::FfmpegFactory;
use crate::lifecycle::{EngineManager, EngineState};
use crate::types::*;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_version: Option<String>,
    pub ffmpeg_error: Option<String>,
    pub engine: EngineState,
}

/// Run the doctor check and return the report as a [`ToolResult`].
///
/// Never loads the engine; it only reports where ffmpeg would come from.
pub async fn run_doctor(ffmpeg_path: Option<PathBuf>, engine: &EngineManager) -> ToolResult<Value> {
    let run_id = new_run_id();
    let start = Instant::now();

    let report = gather_report(ffmpeg_path, engine).await;
    let elapsed = start.elapsed().as_millis() as u64;

    let result = match serde_json::to_value(&report) {
        Ok(v) => ToolResult::ok(v),
        Err(e) => ToolResult::err(e.to_string())
            .with_metadata("error_code", ErrorCode::InternalError.to_string()),
    };
    result
        .with_metadata("run_id", run_id)
        .with_metadata("tool", "doctor")
        .with_metadata("elapsed_ms", elapsed)
}

async fn gather_report(ffmpeg_path: Option<PathBuf>, engine: &EngineManager) -> DoctorReport {
    let (path, version, error) = match FfmpegFactory::new(ffmpeg_path).resolve() {
        Ok(p) => {
            let version = ffmpeg_version(&p).await;
            (Some(p.display().to_string()), version, None)
        }
        Err(e) => (None, None, Some(e.to_string())),
    };
    DoctorReport {
        os: std::env::consts::OS.to_string(),
        os_version: os_version(),
        arch: std::env::consts::ARCH.to_string(),
        ffmpeg_path: path,
        ffmpeg_version: version,
        ffmpeg_error: error,
        engine: engine.state(),
    }
}

async fn ffmpeg_version(path: &Path) -> Option<String> {
    let out = tokio::process::Command::new(path)
        .args(["-hide_banner", "-version"])
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())?;
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
}

fn os_version() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            if let Some(v) = pretty_name(&content) {
                return v;
            }
        }
        "unknown".to_string()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".into())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|l| l.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}
