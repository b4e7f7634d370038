//! Submission validation and image input detection
//!
//! Screenshot names arriving over HTTP go through the strict validator;
//! names derived from crawled inputs (sitemap entries, story ids) go through
//! the sanitizer. The image payload may arrive as raw bytes, a base64
//! string, a data URI or a filesystem path; `detect_image_input` implements
//! the fallback auto-detection used when the client omits an explicit type.

use crate::VizzlyError;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PROPERTY_VALUE_LEN: usize = 255;

/// Strict screenshot-name validator for submissions.
///
/// Rejects separators, traversal components, absolute paths and over-long
/// names. A leading dot is the one transforming case: the name is stored
/// with a `file_` prefix so it never becomes a hidden file.
pub fn validate_screenshot_name(name: &str) -> Result<String, VizzlyError> {
    if name.is_empty() {
        return Err(VizzlyError::validation("name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VizzlyError::validation(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(VizzlyError::validation(
            "name",
            "must not contain path separators",
        ));
    }
    if name.contains("..") {
        return Err(VizzlyError::validation("name", "must not contain '..'"));
    }
    if Path::new(name).is_absolute() {
        return Err(VizzlyError::validation("name", "must not be absolute"));
    }
    if name.starts_with('.') {
        return Ok(format!("file_{}", name));
    }
    Ok(name.to_string())
}

/// Sanitizing validator for names derived from external inputs.
///
/// Unsafe characters become `_`; a leading dot gets the `file_` prefix.
pub fn sanitize_derived_name(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string();

    let collapsed = sanitized.replace("..", "__");
    if collapsed.starts_with('.') {
        format!("file_{}", collapsed)
    } else if collapsed.is_empty() {
        "file_unnamed".to_string()
    } else {
        collapsed
    }
}

fn is_valid_property_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if key.len() > 64 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn strip_html_unsafe(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '&' | '"' | '\''))
        .collect()
}

/// Validates and normalizes a submission's properties map.
///
/// The result is an ordered map so serialized output is stable regardless of
/// the submission's key order.
pub fn validate_properties(
    properties: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, VizzlyError> {
    let mut out = BTreeMap::new();
    for (key, value) in properties {
        if !is_valid_property_key(key) {
            return Err(VizzlyError::validation(
                format!("properties.{}", key),
                "key must match [a-zA-Z_][a-zA-Z0-9_-]{0,63}",
            ));
        }
        let normalized = match value {
            Value::String(s) => {
                if s.len() > MAX_PROPERTY_VALUE_LEN {
                    return Err(VizzlyError::validation(
                        format!("properties.{}", key),
                        format!("string value exceeds {} characters", MAX_PROPERTY_VALUE_LEN),
                    ));
                }
                Value::String(strip_html_unsafe(s))
            }
            Value::Number(n) => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() {
                    return Err(VizzlyError::validation(
                        format!("properties.{}", key),
                        "number must be finite",
                    ));
                }
                value.clone()
            }
            Value::Bool(_) => value.clone(),
            Value::Null => continue,
            other => {
                return Err(VizzlyError::validation(
                    format!("properties.{}", key),
                    format!("unsupported value type: {}", type_name(other)),
                ))
            }
        };
        let normalized = match key.as_str() {
            "viewportWidth" | "viewportHeight" => validate_viewport_dimension(key, &normalized)?,
            _ => normalized,
        };
        out.insert(key.clone(), normalized);
    }
    Ok(out)
}

fn validate_viewport_dimension(key: &str, value: &Value) -> Result<Value, VizzlyError> {
    let raw = value
        .as_f64()
        .ok_or_else(|| VizzlyError::validation(format!("properties.{}", key), "must be a number"))?;
    let floored = raw.floor();
    if !(1.0..=10_000.0).contains(&floored) {
        return Err(VizzlyError::validation(
            format!("properties.{}", key),
            "must be between 1 and 10000",
        ));
    }
    Ok(Value::from(floored as u64))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// How the submission's `image` field should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Base64(String),
    FilePath(PathBuf),
}

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp", ".gif", ".bmp"];

fn looks_like_path(value: &str) -> bool {
    if value.starts_with('/') || value.starts_with("./") || value.starts_with("../") {
        return true;
    }
    if value.contains('/') || value.contains('\\') {
        return true;
    }
    let lower = value.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn is_base64_like(value: &str) -> bool {
    !value.is_empty()
        && value.len() % 4 == 0
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

/// Auto-detects the image input type when the client omits `type`.
///
/// Prefer an explicit discriminator where the client can send one; this
/// fallback trades strictness for convenience and rejects anything
/// ambiguous.
pub fn detect_image_input(value: &str) -> Result<ImageInput, VizzlyError> {
    if value.is_empty() {
        return Err(VizzlyError::validation("image", "must not be empty"));
    }
    if let Some(rest) = value.strip_prefix("data:") {
        let payload = rest
            .split_once("base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| {
                VizzlyError::validation("image", "data URI must carry base64 payload")
            })?;
        return Ok(ImageInput::Base64(payload.to_string()));
    }
    if value.starts_with("/9j/") || value.len() > 1000 {
        return Ok(ImageInput::Base64(value.to_string()));
    }
    if looks_like_path(value) {
        return Ok(ImageInput::FilePath(PathBuf::from(value)));
    }
    if is_base64_like(value) {
        return Ok(ImageInput::Base64(value.to_string()));
    }
    Err(VizzlyError::validation(
        "image",
        "ambiguous image input; pass an explicit type of base64 or file-path",
    ))
}

/// Interprets an explicit `type` discriminator, falling back to detection.
pub fn resolve_image_input(
    value: &str,
    explicit_type: Option<&str>,
) -> Result<ImageInput, VizzlyError> {
    match explicit_type {
        Some("base64") => {
            let payload = value
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once("base64,").map(|(_, data)| data))
                .unwrap_or(value);
            Ok(ImageInput::Base64(payload.to_string()))
        }
        Some("file-path") => Ok(ImageInput::FilePath(PathBuf::from(value))),
        Some(other) => Err(VizzlyError::validation(
            "type",
            format!("unknown image type: {}", other),
        )),
        None => detect_image_input(value),
    }
}

impl ImageInput {
    /// Loads the raw image bytes this input refers to.
    pub async fn read_bytes(&self) -> Result<Vec<u8>, VizzlyError> {
        match self {
            ImageInput::Base64(payload) => base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| VizzlyError::validation("image", format!("invalid base64: {}", e))),
            ImageInput::FilePath(path) => tokio::fs::read(path).await.map_err(|e| {
                VizzlyError::validation(
                    "image",
                    format!("cannot read {}: {}", path.display(), e),
                )
            }),
        }
    }
}
