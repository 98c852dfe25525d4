//! Text encoding tools – pure computation, no engine.

use super::{parse_input, Tool, ToolError};
use crate::context::ToolContext;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecMode {
    Encode,
    Decode,
}

/// Input shared by the encode/decode tools.
#[derive(Debug, Clone, Deserialize)]
pub struct CodecInput {
    pub data: String,
    pub mode: CodecMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodecOutput {
    pub result: String,
    pub mode: CodecMode,
    pub length: usize,
}

impl CodecOutput {
    fn new(result: String, mode: CodecMode) -> Self {
        let length = result.len();
        Self {
            result,
            mode,
            length,
        }
    }
}

fn require_data(input: &CodecInput) -> Result<(), ToolError> {
    if input.data.is_empty() {
        return Err(ToolError::InvalidInput("'data' must not be empty".into()));
    }
    Ok(())
}

fn utf8(bytes: Vec<u8>) -> Result<String, ToolError> {
    String::from_utf8(bytes)
        .map_err(|_| ToolError::InvalidInput("decoded data is not valid UTF-8 text".into()))
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn base64_transform(input: &CodecInput) -> Result<CodecOutput, ToolError> {
    require_data(input)?;
    let result = match input.mode {
        CodecMode::Encode => base64::engine::general_purpose::STANDARD.encode(input.data.as_bytes()),
        CodecMode::Decode => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(strip_whitespace(&input.data))
                .map_err(|e| ToolError::InvalidInput(format!("invalid base64: {}", e)))?;
            utf8(bytes)?
        }
    };
    Ok(CodecOutput::new(result, input.mode))
}

pub fn hex_transform(input: &CodecInput) -> Result<CodecOutput, ToolError> {
    require_data(input)?;
    let result = match input.mode {
        CodecMode::Encode => hex::encode(input.data.as_bytes()),
        CodecMode::Decode => {
            let bytes = hex::decode(strip_whitespace(&input.data))
                .map_err(|e| ToolError::InvalidInput(format!("invalid hex: {}", e)))?;
            utf8(bytes)?
        }
    };
    Ok(CodecOutput::new(result, input.mode))
}

pub fn url_transform(input: &CodecInput) -> Result<CodecOutput, ToolError> {
    require_data(input)?;
    let result = match input.mode {
        CodecMode::Encode => urlencoding::encode(&input.data).into_owned(),
        CodecMode::Decode => urlencoding::decode(&input.data)
            .map_err(|_| ToolError::InvalidInput("decoded data is not valid UTF-8 text".into()))?
            .into_owned(),
    };
    Ok(CodecOutput::new(result, input.mode))
}

fn to_value(out: CodecOutput) -> Result<Value, ToolError> {
    serde_json::to_value(out).map_err(|e| ToolError::Operation(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tool wrappers
// ---------------------------------------------------------------------------

/// `base64` – `{ "data": "...", "mode": "encode" | "decode" }`
pub struct Base64Tool;

#[async_trait::async_trait]
impl Tool for Base64Tool {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn description(&self) -> &'static str {
        "Encode text to Base64 or decode Base64 back to text"
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        to_value(base64_transform(&parse_input(args)?)?)
    }
}

/// `hex` – `{ "data": "...", "mode": "encode" | "decode" }`
pub struct HexTool;

#[async_trait::async_trait]
impl Tool for HexTool {
    fn name(&self) -> &'static str {
        "hex"
    }

    fn description(&self) -> &'static str {
        "Encode text to hexadecimal or decode hexadecimal back to text"
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        to_value(hex_transform(&parse_input(args)?)?)
    }
}

/// `url` – `{ "data": "...", "mode": "encode" | "decode" }`
pub struct UrlTool;

#[async_trait::async_trait]
impl Tool for UrlTool {
    fn name(&self) -> &'static str {
        "url"
    }

    fn description(&self) -> &'static str {
        "Percent-encode text for URLs or decode percent-encoded text"
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        to_value(url_transform(&parse_input(args)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(data: &str, mode: CodecMode) -> CodecInput {
        CodecInput {
            data: data.to_string(),
            mode,
        }
    }

    #[test]
    fn test_base64_encode_decode() {
        let enc = base64_transform(&input("hello world", CodecMode::Encode)).unwrap();
        assert_eq!(enc.result, "aGVsbG8gd29ybGQ=");
        assert_eq!(enc.length, 16);

        let dec = base64_transform(&input("aGVsbG8g\nd29ybGQ=", CodecMode::Decode)).unwrap();
        assert_eq!(dec.result, "hello world");
        assert_eq!(dec.mode, CodecMode::Decode);
    }

    #[test]
    fn test_base64_rejects_garbage() {
        let err = base64_transform(&input("not*base64", CodecMode::Decode)).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn test_base64_rejects_binary_output() {
        // 0xff 0xfe is not UTF-8
        let err = base64_transform(&input("//4=", CodecMode::Decode)).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_empty_input_is_rejected() {
        for f in [base64_transform, hex_transform, url_transform] {
            let err = f(&input("", CodecMode::Encode)).unwrap_err();
            assert!(matches!(err, ToolError::InvalidInput(_)));
        }
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex_transform(&input("Hi", CodecMode::Encode)).unwrap().result, "4869");
        assert_eq!(hex_transform(&input("48 69", CodecMode::Decode)).unwrap().result, "Hi");
        assert!(hex_transform(&input("486", CodecMode::Decode)).is_err());
    }

    #[test]
    fn test_url() {
        let enc = url_transform(&input("a b&c=d/é", CodecMode::Encode)).unwrap();
        assert_eq!(enc.result, "a%20b%26c%3Dd%2F%C3%A9");
        let dec = url_transform(&input(&enc.result, CodecMode::Decode)).unwrap();
        assert_eq!(dec.result, "a b&c=d/é");
    }

    #[test]
    fn test_unknown_mode_is_invalid_input() {
        let args = serde_json::json!({ "data": "x", "mode": "rot13" });
        let err = parse_input::<CodecInput>(&args).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
