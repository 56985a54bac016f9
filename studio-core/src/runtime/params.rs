//! Kind-specific task parameters.
//!
//! Requests carry parameters as a loose JSON object. They are parsed into a
//! typed variant at admission time so that unknown keys and out-of-range
//! values are rejected before a task exists.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StudioError;
use crate::runtime::types::TaskKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParameters {
    Video(VideoParams),
    Audio(AudioParams),
    Image(ImageParams),
    Code(CodeParams),
    Text(TextParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoParams {
    pub model: String,
    /// Clip length in seconds.
    pub duration: u32,
    pub style: String,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            model: "wan22".into(),
            duration: 5,
            style: "realistic".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioParams {
    pub model: String,
    pub duration: u32,
    pub genre: String,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            model: "musicgen".into(),
            duration: 30,
            genre: "ambient".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageParams {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub num_images: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            model: "sdxl".into(),
            width: 1024,
            height: 1024,
            num_images: 1,
            negative_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodeParams {
    pub language: String,
}

impl Default for CodeParams {
    fn default() -> Self {
        Self {
            language: "python".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextParams {
    pub model: String,
    pub max_tokens: u32,
}

impl Default for TextParams {
    fn default() -> Self {
        Self {
            model: "default".into(),
            max_tokens: 512,
        }
    }
}

fn check_range(kind: TaskKind, field: &str, value: u32, min: u32, max: u32) -> Result<(), StudioError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(StudioError::InvalidParameters {
            kind,
            message: format!("{field} must be between {min} and {max}, got {value}"),
        })
    }
}

fn decode<T: DeserializeOwned>(kind: TaskKind, raw: Value) -> Result<T, StudioError> {
    serde_json::from_value(raw).map_err(|e| StudioError::InvalidParameters {
        kind,
        message: e.to_string(),
    })
}

impl TaskParameters {
    /// All-defaults parameters for `kind`.
    pub fn default_for(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Video => TaskParameters::Video(VideoParams::default()),
            TaskKind::Audio => TaskParameters::Audio(AudioParams::default()),
            TaskKind::Image => TaskParameters::Image(ImageParams::default()),
            TaskKind::Code => TaskParameters::Code(CodeParams::default()),
            TaskKind::Text => TaskParameters::Text(TextParams::default()),
        }
    }

    /// Parse and range-check the raw request parameters for `kind`.
    ///
    /// `null` is treated as an empty object.
    pub fn parse(kind: TaskKind, raw: Value) -> Result<Self, StudioError> {
        let raw = match raw {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(StudioError::InvalidParameters {
                    kind,
                    message: format!("expected an object, got {other}"),
                });
            }
        };

        let params = match kind {
            TaskKind::Video => {
                let p: VideoParams = decode(kind, raw)?;
                check_range(kind, "duration", p.duration, 1, 60)?;
                TaskParameters::Video(p)
            }
            TaskKind::Audio => {
                let p: AudioParams = decode(kind, raw)?;
                check_range(kind, "duration", p.duration, 1, 300)?;
                TaskParameters::Audio(p)
            }
            TaskKind::Image => {
                let p: ImageParams = decode(kind, raw)?;
                check_range(kind, "num_images", p.num_images, 1, 4)?;
                check_range(kind, "width", p.width, 64, 2048)?;
                check_range(kind, "height", p.height, 64, 2048)?;
                TaskParameters::Image(p)
            }
            TaskKind::Code => TaskParameters::Code(decode(kind, raw)?),
            TaskKind::Text => {
                let p: TextParams = decode(kind, raw)?;
                check_range(kind, "max_tokens", p.max_tokens, 1, 8192)?;
                TaskParameters::Text(p)
            }
        };
        Ok(params)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParameters::Video(_) => TaskKind::Video,
            TaskParameters::Audio(_) => TaskKind::Audio,
            TaskParameters::Image(_) => TaskKind::Image,
            TaskParameters::Code(_) => TaskKind::Code,
            TaskParameters::Text(_) => TaskKind::Text,
        }
    }

    /// Units of the per-kind quota resource this task consumes.
    pub fn quota_units(&self) -> u64 {
        match self {
            TaskParameters::Image(p) => u64::from(p.num_images),
            _ => 1,
        }
    }
}
