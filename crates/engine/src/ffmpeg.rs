//! ffmpeg-backed conversion engine.
//!
//! - [`FfmpegFactory`]: locates the executable (configured path, else `PATH`)
//! - [`FfmpegBackend`]: runs conversions in a private temp dir, reporting
//!   progress from ffmpeg's `-progress` stream
//!
//! Everything happens on the local machine; input never leaves it.

use crate::traits::*;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL: usize = 8;

pub struct FfmpegFactory {
    configured_path: Option<PathBuf>,
}

impl FfmpegFactory {
    pub fn new(configured_path: Option<PathBuf>) -> Self {
        Self { configured_path }
    }

    /// Resolve the ffmpeg executable. A configured path that does not exist
    /// falls back to `PATH`.
    pub fn resolve(&self) -> BackendResult<PathBuf> {
        if let Some(p) = &self.configured_path {
            if p.exists() {
                return Ok(p.clone());
            }
            tracing::warn!(path = %p.display(), "configured ffmpeg path does not exist; searching PATH");
        }
        which::which("ffmpeg")
            .map_err(|_| BackendError::DependencyMissing("ffmpeg not found in PATH".into()))
    }
}

impl BackendFactory for FfmpegFactory {
    fn create(&self) -> BackendResult<Box<dyn ConversionBackend>> {
        let path = self.resolve()?;
        Ok(Box::new(FfmpegBackend { path }))
    }
}

pub struct FfmpegBackend {
    path: PathBuf,
}

#[async_trait::async_trait]
impl ConversionBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn load(&self, events: &EngineEvents) -> BackendResult<()> {
        events.progress(0.0);
        let output = Command::new(&self.path)
            .arg("-hide_banner")
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Process(format!(
                "ffmpeg -version exited with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.lines().next().unwrap_or("ffmpeg").trim().to_string();
        tracing::info!(path = %self.path.display(), %version, "ffmpeg loaded");
        events.log(version);
        events.progress(1.0);
        Ok(())
    }

    async fn run(&self, op: &Operation, events: &EngineEvents) -> BackendResult<Payload> {
        if op.name != "transcode" {
            return Err(BackendError::Unsupported(format!(
                "ffmpeg engine has no operation '{}'",
                op.name
            )));
        }
        let input_format = op
            .get_param("input_format")
            .ok_or_else(|| BackendError::Other("missing input_format".into()))?;
        let output_format = op
            .get_param("output_format")
            .ok_or_else(|| BackendError::Other("missing output_format".into()))?;

        let workdir = tempfile::Builder::new().prefix("convert-engine-").tempdir()?;
        let input_path = workdir.path().join(format!("input.{}", input_format));
        let output_path = workdir.path().join(format!("output.{}", output_format));
        tokio::fs::write(&input_path, op.input.as_bytes()).await?;

        let mut child = Command::new(&self.path)
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(&input_path)
            .args(&op.args)
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Other("ffmpeg stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Other("ffmpeg stderr not captured".into()))?;
        // Split on raw bytes: stream metadata echoed on stderr is not always UTF-8.
        let mut progress_lines = BufReader::new(stdout).split(b'\n');
        let mut log_lines = BufReader::new(stderr).split(b'\n');

        events.progress(0.0);
        let mut total_us: Option<f64> = None;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let (mut progress_done, mut log_done) = (false, false);

        while !(progress_done && log_done) {
            tokio::select! {
                line = progress_lines.next_segment(), if !progress_done => match line? {
                    Some(line) => {
                        let line = decode_line(&line);
                        if let Some(ratio) = progress_ratio(&line, total_us) {
                            events.progress(ratio);
                        }
                    }
                    None => progress_done = true,
                },
                line = log_lines.next_segment(), if !log_done => match line? {
                    Some(line) => {
                        let line = decode_line(&line);
                        if total_us.is_none() {
                            total_us = parse_duration_us(&line);
                        }
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                        events.log(line);
                    }
                    None => log_done = true,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let detail = tail.back().cloned().unwrap_or_default();
            return Err(BackendError::Process(format!(
                "ffmpeg exited with {}: {}",
                status, detail
            )));
        }

        let bytes = tokio::fs::read(&output_path).await?;
        Ok(Payload::Binary(bytes))
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse the `Duration: HH:MM:SS.xx` banner ffmpeg prints for each input.
pub fn parse_duration_us(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let stamp = rest.trim_start().split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let total = (hours * 3600.0 + minutes * 60.0 + seconds) * 1_000_000.0;
    (total > 0.0).then_some(total)
}

/// Map one `-progress` key=value line to a completion ratio.
pub fn progress_ratio(line: &str, total_us: Option<f64>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" => {
            let total = total_us?;
            let done: f64 = value.parse().ok()?;
            Some((done / total).clamp(0.0, 1.0))
        }
        "progress" if value == "end" => Some(1.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_banner() {
        let line = "  Duration: 00:01:02.50, start: 0.000000, bitrate: 128 kb/s";
        assert_eq!(parse_duration_us(line), Some(62_500_000.0));
        assert_eq!(parse_duration_us("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_duration_us("Stream #0:0: Audio: pcm_s16le"), None);
    }

    #[test]
    fn test_progress_ratio() {
        let total = Some(10_000_000.0);
        assert_eq!(progress_ratio("out_time_us=2500000", total), Some(0.25));
        assert_eq!(progress_ratio("out_time_us=99000000", total), Some(1.0));
        assert_eq!(progress_ratio("out_time_us=2500000", None), None);
        assert_eq!(progress_ratio("progress=continue", total), None);
        assert_eq!(progress_ratio("progress=end", None), Some(1.0));
        assert_eq!(progress_ratio("frame=12", total), None);
    }

    #[test]
    fn test_missing_configured_path_falls_back_to_path_lookup() {
        let factory = FfmpegFactory::new(Some(PathBuf::from("/definitely/not/ffmpeg")));
        match factory.resolve() {
            Ok(p) => assert!(p.ends_with("ffmpeg") || p.ends_with("ffmpeg.exe")),
            Err(e) => assert!(matches!(e, BackendError::DependencyMissing(_))),
        }
    }

    #[test]
    fn test_decode_line_is_lossy() {
        assert_eq!(decode_line(b"progress=end\r"), "progress=end");
        assert_eq!(decode_line(b"title : Caf\xe9"), "title : Caf\u{fffd}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_stderr_does_not_fail_conversion() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             printf 'title : Caf\\351\\n' >&2\n\
             printf 'progress=end\\n'\n\
             for last; do :; done\n\
             printf 'converted' > \"$last\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = FfmpegBackend { path: script };
        let events = EngineEvents::new();
        let (_id, mut rx) = events.subscribe();
        let op = Operation::new("transcode", Payload::Binary(b"RIFF".to_vec()))
            .param("input_format", "wav")
            .param("output_format", "mp3");

        let out = backend.run(&op, &events).await.unwrap();
        assert_eq!(out.as_bytes(), b"converted");

        let mut logs = Vec::new();
        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::Log { message } => logs.push(message),
                EngineEvent::Progress { progress: p } => progress.push(p),
            }
        }
        assert!(logs.iter().any(|l| l.starts_with("title : Caf")));
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn test_unknown_operation_is_unsupported() {
        let backend = FfmpegBackend {
            path: PathBuf::from("ffmpeg"),
        };
        let err = backend
            .run(&Operation::new("ocr", Payload::Binary(vec![1])), &EngineEvents::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
    }
}
