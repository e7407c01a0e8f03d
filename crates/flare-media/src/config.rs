use flare_transport::StoreConfig;
use flare_transport::wire::{DEFAULT_MAX_FRAME_BYTES, MAX_DATA_FRAGMENTS};
use serde::Deserialize;

use crate::media::nal::Codec;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfigInput {
    pub version: u32,
    pub codec: Option<String>,
    pub deliver_lossy_frames: Option<bool>,
    pub fec: FecConfigInput,
    pub output: OutputConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub enabled: Option<bool>,
    pub window: Option<usize>,
    pub max_frame_bytes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfigInput {
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecConfig {
    /// When false every record is a whole frame and bypasses the store.
    pub enabled: bool,
    /// Frames reassembled concurrently before the oldest is evicted.
    pub window: usize,
    pub max_frame_bytes: u32,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: StoreConfig::default().window,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Undelivered units the decoder channel holds.
    pub capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_DATA_FRAGMENTS as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub version: u32,
    pub codec: Codec,
    /// Split frames that finished with unrecovered gaps.
    pub deliver_lossy_frames: bool,
    pub fec: FecConfig,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            codec: Codec::H264,
            deliver_lossy_frames: false,
            fec: FecConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Accepts `h264`/`avc` and `h265`/`hevc`, case-insensitively.
pub fn parse_codec(name: &str) -> Result<Codec, String> {
    match name.trim().to_ascii_lowercase().as_str() {
        "h264" | "avc" => Ok(Codec::H264),
        "h265" | "hevc" => Ok(Codec::H265),
        other => Err(format!("Unsupported codec {:?}", other)),
    }
}

impl PipelineConfigInput {
    pub fn resolve(self) -> Result<PipelineConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = PipelineConfig::default();
        let codec = match self.codec.as_deref() {
            Some(name) => parse_codec(name)?,
            None => defaults.codec,
        };

        let max_frame_bytes = self
            .fec
            .max_frame_bytes
            .unwrap_or(defaults.fec.max_frame_bytes);
        if max_frame_bytes == 0 {
            return Err("fec.max_frame_bytes must be positive".to_string());
        }

        let fec = FecConfig {
            enabled: self.fec.enabled.unwrap_or(defaults.fec.enabled),
            window: self.fec.window.unwrap_or(defaults.fec.window).max(1),
            max_frame_bytes,
        };
        let output = OutputConfig {
            capacity: self
                .output
                .capacity
                .unwrap_or(defaults.output.capacity)
                .max(1),
        };

        Ok(PipelineConfig {
            version,
            codec,
            deliver_lossy_frames: self
                .deliver_lossy_frames
                .unwrap_or(defaults.deliver_lossy_frames),
            fec,
            output,
        })
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(PipelineConfig::default());
        }
        let parsed: PipelineConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            window: self.fec.window,
            max_frame_bytes: self.fec.max_frame_bytes,
        }
    }
}
