//! Frame ingestion for the gateway
//!
//! This module turns inbound payloads into canonical frame records
//! and keeps a small cache of metadata for frames seen before.

mod cache;
mod decoder;

pub use cache::{cache_key, CacheEntry, CacheStats, FrameCache};
pub use decoder::{DecoderStats, FrameDecoder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    Jpeg,
    Png,
    Webp,
    Unknown,
}

impl FrameFormat {
    /// Resolve a format name as it appears in a data URL or frame header.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(FrameFormat::Jpeg),
            "png" => Some(FrameFormat::Png),
            "webp" => Some(FrameFormat::Webp),
            _ => None,
        }
    }

    /// Classify a buffer by its leading magic bytes.
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0xFF, 0xD8]) {
            FrameFormat::Jpeg
        } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            FrameFormat::Png
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            FrameFormat::Webp
        } else {
            FrameFormat::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "jpeg",
            FrameFormat::Png => "png",
            FrameFormat::Webp => "webp",
            FrameFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional metadata supplied alongside a binary frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Capture time in milliseconds since the unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A decoded frame ready to be handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub data: Vec<u8>,
    pub format: FrameFormat,
    pub size: usize,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
}

impl FrameRecord {
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            format: self.format,
            size: self.size,
            width: self.width,
            height: self.height,
            timestamp: self.timestamp,
            cache_hit: self.cache_hit,
        }
    }

    /// Fill in whatever a cached entry knows that this frame does not.
    pub fn merge_cached(&mut self, entry: &CacheEntry) {
        if self.format == FrameFormat::Unknown {
            self.format = entry.format;
        }
        self.width = self.width.or(entry.width);
        self.height = self.height.or(entry.height);
        self.cache_hit = true;
    }
}

/// Frame description sent back to clients, without the raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSummary {
    pub format: FrameFormat,
    pub size: usize,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
}
