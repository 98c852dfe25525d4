//! Media conversion tools – audio, video and image, delegated to the shared
//! engine.
//!
//! Input is validated completely before the engine is touched, so a bad
//! request never triggers an engine load.

use super::{parse_input, Tool, ToolError};
use crate::context::ToolContext;
use crate::traits::{Operation, Payload};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

const AUDIO_FORMATS: &[&str] = &["mp3", "wav", "ogg", "flac", "aac", "m4a", "opus"];
const VIDEO_FORMATS: &[&str] = &["mp4", "webm", "mkv", "mov", "avi", "gif"];
const IMAGE_FORMATS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif", "tiff"];

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }

    pub fn formats(self) -> &'static [&'static str] {
        match self {
            MediaKind::Audio => AUDIO_FORMATS,
            MediaKind::Video => VIDEO_FORMATS,
            MediaKind::Image => IMAGE_FORMATS,
        }
    }

    /// Audio tracks can be pulled out of video containers.
    fn accepts_input(self, format: &str) -> bool {
        match self {
            MediaKind::Audio => AUDIO_FORMATS.contains(&format) || VIDEO_FORMATS.contains(&format),
            other => other.formats().contains(&format),
        }
    }
}

/// Input for the `convert_*` tools.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConvertInput {
    /// Base64-encoded source file.
    pub data: String,
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub options: MediaOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaOptions {
    pub audio_bitrate_kbps: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// 1 (smallest) ..= 100 (best).
    pub quality: Option<u8>,
    pub start_seconds: Option<f64>,
    pub duration_seconds: Option<f64>,
}

/// A validated request, ready for the engine.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub bytes: Vec<u8>,
    pub input_format: String,
    pub output_format: String,
    pub args: Vec<String>,
}

fn normalize_format(format: &str) -> String {
    format.trim().trim_start_matches('.').to_ascii_lowercase()
}

pub fn prepare(kind: MediaKind, input: &MediaConvertInput) -> Result<MediaRequest, ToolError> {
    if input.data.is_empty() {
        return Err(ToolError::InvalidInput("'data' must not be empty".into()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(input.data.trim())
        .map_err(|e| ToolError::InvalidInput(format!("'data' is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(ToolError::InvalidInput("'data' decodes to zero bytes".into()));
    }

    let input_format = normalize_format(&input.input_format);
    let output_format = normalize_format(&input.output_format);
    if !kind.accepts_input(&input_format) {
        return Err(ToolError::InvalidInput(format!(
            "unsupported {} input format '{}'",
            kind.as_str(),
            input.input_format
        )));
    }
    if !kind.formats().contains(&output_format.as_str()) {
        return Err(ToolError::InvalidInput(format!(
            "unsupported {} output format '{}' (expected one of: {})",
            kind.as_str(),
            input.output_format,
            kind.formats().join(", ")
        )));
    }

    validate_options(&input.options)?;
    let args = engine_args(kind, &input.options, &output_format);
    Ok(MediaRequest {
        bytes,
        input_format,
        output_format,
        args,
    })
}

fn validate_options(opts: &MediaOptions) -> Result<(), ToolError> {
    if let Some(q) = opts.quality {
        if !(1..=100).contains(&q) {
            return Err(ToolError::InvalidInput("'quality' must be within 1..=100".into()));
        }
    }
    if opts.width == Some(0) || opts.height == Some(0) {
        return Err(ToolError::InvalidInput("dimensions must be positive".into()));
    }
    if opts.channels == Some(0) || opts.sample_rate == Some(0) || opts.audio_bitrate_kbps == Some(0) {
        return Err(ToolError::InvalidInput("audio settings must be positive".into()));
    }
    for (name, value) in [
        ("start_seconds", opts.start_seconds),
        ("duration_seconds", opts.duration_seconds),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(ToolError::InvalidInput(format!("'{}' must be >= 0", name)));
            }
        }
    }
    Ok(())
}

/// Translate options into engine arguments.
pub fn engine_args(kind: MediaKind, opts: &MediaOptions, output_format: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(start) = opts.start_seconds {
        args.extend(["-ss".to_string(), start.to_string()]);
    }
    if let Some(duration) = opts.duration_seconds {
        args.extend(["-t".to_string(), duration.to_string()]);
    }

    let scale = match (opts.width, opts.height) {
        (None, None) => None,
        (w, h) => Some(format!(
            "scale={}:{}",
            w.map_or("-2".to_string(), |v| v.to_string()),
            h.map_or("-2".to_string(), |v| v.to_string())
        )),
    };

    match kind {
        MediaKind::Audio => {
            args.push("-vn".into());
        }
        MediaKind::Video => {
            if let Some(filter) = &scale {
                args.extend(["-vf".to_string(), filter.clone()]);
            }
            if let Some(q) = opts.quality {
                if output_format != "gif" {
                    // quality 100 -> crf 0, quality 1 -> crf 50
                    let crf = (u32::from(100u8.saturating_sub(q)) * 51) / 100;
                    args.extend(["-crf".to_string(), crf.to_string()]);
                }
            }
        }
        MediaKind::Image => {
            if let Some(filter) = &scale {
                args.extend(["-vf".to_string(), filter.clone()]);
            }
            args.extend(["-frames:v".to_string(), "1".to_string()]);
            if let Some(q) = opts.quality {
                if matches!(output_format, "jpg" | "jpeg") {
                    // quality 100 -> qscale 2, quality 1 -> qscale 31
                    let qscale = 31 - (u32::from(q.saturating_sub(1)) * 29) / 99;
                    args.extend(["-q:v".to_string(), qscale.to_string()]);
                }
            }
        }
    }

    if kind != MediaKind::Image {
        if let Some(kbps) = opts.audio_bitrate_kbps {
            args.extend(["-b:a".to_string(), format!("{}k", kbps)]);
        }
        if let Some(rate) = opts.sample_rate {
            args.extend(["-ar".to_string(), rate.to_string()]);
        }
        if let Some(channels) = opts.channels {
            args.extend(["-ac".to_string(), channels.to_string()]);
        }
    }

    args
}

/// `convert_audio` / `convert_video` / `convert_image`
///
/// Args: `{ "data": "<base64>", "input_format": "wav", "output_format": "mp3", "options": {...} }`
/// Returns: `{ "data": "<base64>", "format": "mp3", "size_bytes": 123, "input_size_bytes": 456 }`
pub struct MediaTool {
    kind: MediaKind,
}

impl MediaTool {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind }
    }
}

#[async_trait::async_trait]
impl Tool for MediaTool {
    fn name(&self) -> &'static str {
        match self.kind {
            MediaKind::Audio => "convert_audio",
            MediaKind::Video => "convert_video",
            MediaKind::Image => "convert_image",
        }
    }

    fn description(&self) -> &'static str {
        match self.kind {
            MediaKind::Audio => "Convert audio between formats (or extract audio from video)",
            MediaKind::Video => "Convert video between container formats",
            MediaKind::Image => "Convert images between formats",
        }
    }

    fn uses_engine(&self) -> bool {
        true
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let input: MediaConvertInput = parse_input(args)?;
        let request = prepare(self.kind, &input)?;
        let input_size = request.bytes.len();

        let handle = ctx.acquire_engine().await?;
        let op = Operation::new("transcode", Payload::Binary(request.bytes))
            .param("kind", self.kind.as_str())
            .param("input_format", request.input_format)
            .param("output_format", request.output_format.clone())
            .args(request.args);
        let output = handle.run(&op).await?;
        if output.is_empty() {
            return Err(ToolError::Operation("engine produced no output".into()));
        }

        let bytes = output.into_bytes();
        Ok(serde_json::json!({
            "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
            "format": request.output_format,
            "size_bytes": bytes.len(),
            "input_size_bytes": input_size,
        }))
    }
}
