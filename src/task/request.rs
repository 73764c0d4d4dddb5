//! Immutable task input: prompt, optional reference image, style and fan-out shape.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// Visual style applied on top of the user's prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    Cute,
    Toy,
    Cyber,
}

impl Style {
    /// Parse from a request value. Unknown styles are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "cute" | "chibi" => Some(Self::Cute),
            "toy" | "figurine" => Some(Self::Toy),
            "cyber" | "cyberpunk" => Some(Self::Cyber),
            _ => None,
        }
    }

    /// Instruction prepended to the user prompt.
    pub fn preamble(&self) -> &'static str {
        match self {
            Self::Cute => {
                "Chibi full-body illustration of the main character from the reference image, \
                 background removed. Keep hairstyle, visible accessories, facial features and \
                 expression. Large eyes, rounded limbs, pastel flat colours with soft cel shading, \
                 square 1:1 canvas."
            }
            Self::Toy => {
                "Isometric 3D vinyl toy figurine of the main character from the reference image, \
                 background removed. Keep hairstyle, visible accessories, facial features and \
                 expression. Smooth plastic surfaces, clear part segmentation, soft studio \
                 reflections, square 1:1 render."
            }
            Self::Cyber => {
                "Cyberpunk full-body character illustration of the main character from the \
                 reference image, background removed. Keep hairstyle, visible accessories, facial \
                 features and expression. Neon circuit patterns on armour, metallic and leather \
                 textures, strong rim lighting, square 1:1 digital painting."
            }
        }
    }
}

impl std::fmt::Display for Style {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cute => write!(f, "cute"),
            Self::Toy => write!(f, "toy"),
            Self::Cyber => write!(f, "cyber"),
        }
    }
}

/// Reference image uploaded with a request. Stored base64-encoded in JSON records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

impl ReferenceImage {
    pub fn new(data: Vec<u8>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let content_type = guess_content_type(&file_name).to_string();
        Self {
            data,
            file_name,
            content_type,
        }
    }
}

fn guess_content_type(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

/// The immutable input of a task.
///
/// # Invariants
/// - `fan_out_width >= 1`
/// - `1 <= min_success <= fan_out_width`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<ReferenceImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Style>,
    /// Number of concurrent sub-jobs (N)
    pub fan_out_width: usize,
    /// Successful sub-jobs required to complete (K)
    pub min_success: usize,
}

impl TaskRequest {
    /// Create a request with the given width; K defaults to 1 and is clamped on every change.
    pub fn new(prompt: impl Into<String>, fan_out_width: usize) -> Self {
        let fan_out_width = fan_out_width.max(1);
        Self {
            prompt: prompt.into(),
            reference_image: None,
            style: None,
            fan_out_width,
            min_success: 1,
        }
    }

    pub fn with_min_success(mut self, min_success: usize) -> Self {
        self.min_success = min_success.clamp(1, self.fan_out_width);
        self
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = Some(style);
        self
    }

    pub fn with_reference_image(mut self, image: ReferenceImage) -> Self {
        self.reference_image = Some(image);
        self
    }

    /// Prompt sent to the provider: style preamble followed by the user's text.
    pub fn full_prompt(&self) -> String {
        match self.style {
            Some(style) if self.prompt.trim().is_empty() => style.preamble().to_string(),
            Some(style) => format!(
                "{} Additional requirements: {}",
                style.preamble(),
                self.prompt.trim()
            ),
            None => self.prompt.trim().to_string(),
        }
    }

    /// Validate a client-supplied request against the configured limits.
    pub fn validate(&self, max_prompt_chars: usize, max_width: usize) -> Result<(), RequestError> {
        let chars = self.prompt.chars().count();
        if self.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        if chars > max_prompt_chars {
            return Err(RequestError::PromptTooLong {
                len: chars,
                max: max_prompt_chars,
            });
        }
        if self.fan_out_width == 0 || self.fan_out_width > max_width {
            return Err(RequestError::InvalidFanOutWidth {
                width: self.fan_out_width,
                max: max_width,
            });
        }
        Ok(())
    }
}

/// Errors raised while validating a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("Prompt is {len} characters long, the limit is {max}")]
    PromptTooLong { len: usize, max: usize },

    #[error("Fan-out width {width} is outside 1..={max}")]
    InvalidFanOutWidth { width: usize, max: usize },

    #[error("Unknown style: {0}")]
    UnknownStyle(String),

    #[error("Reference image is not valid base64: {0}")]
    InvalidImageEncoding(String),
}

/// Decode a base64 reference image, tolerating a `data:...;base64,` prefix.
pub fn decode_base64_image(value: &str) -> Result<Vec<u8>, RequestError> {
    let payload = match value.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => value,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| RequestError::InvalidImageEncoding(e.to_string()))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
