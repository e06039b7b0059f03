use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::{FrameFormat, FrameMetadata, FrameRecord};
use crate::config::FrameConfig;
use crate::error::FrameError;

const DATA_URL_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = ";base64,";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub bytes_decoded: u64,
    pub decode_errors: u64,
}

/// Converts data URLs and raw buffers into [`FrameRecord`]s.
///
/// The decoder never touches the frame cache; callers decide what to
/// cache once a decode has succeeded.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    supported_formats: Vec<FrameFormat>,
    frames_decoded: AtomicU64,
    bytes_decoded: AtomicU64,
    decode_errors: AtomicU64,
}

impl FrameDecoder {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            supported_formats: config.supported_formats.clone(),
            frames_decoded: AtomicU64::new(0),
            bytes_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Decode `data:image/<fmt>;base64,<payload>`.
    ///
    /// Width and height stay unset; the orchestrator resolves them.
    pub fn decode_data_url(&self, input: &str) -> Result<FrameRecord, FrameError> {
        let result = self.parse_data_url(input);
        self.finish(result)
    }

    /// Decode a raw buffer. Magic bytes take precedence over the declared
    /// format, which is only used when the content is not recognised.
    pub fn decode_binary(
        &self,
        data: Vec<u8>,
        metadata: Option<FrameMetadata>,
    ) -> Result<FrameRecord, FrameError> {
        let result = self.parse_binary(data, metadata.unwrap_or_default());
        self.finish(result)
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn parse_data_url(&self, input: &str) -> Result<FrameRecord, FrameError> {
        let rest = input
            .strip_prefix(DATA_URL_PREFIX)
            .ok_or(FrameError::InvalidDataUrl)?;
        let (format_name, payload) = rest
            .split_once(BASE64_MARKER)
            .ok_or(FrameError::InvalidDataUrl)?;
        if format_name.is_empty() || payload.is_empty() {
            return Err(FrameError::InvalidDataUrl);
        }

        let format = FrameFormat::from_name(format_name)
            .filter(|f| self.supported_formats.contains(f))
            .ok_or_else(|| FrameError::UnsupportedFormat(format_name.to_string()))?;

        // Reject obviously oversized payloads before allocating for them
        let estimated = payload.len() / 4 * 3;
        if estimated > self.max_frame_size + 2 {
            return Err(FrameError::FrameTooLarge {
                size: estimated,
                max: self.max_frame_size,
            });
        }

        let data = BASE64
            .decode(payload.trim_end())
            .map_err(|e| FrameError::InvalidEncoding(e.to_string()))?;
        self.check_size(data.len())?;

        Ok(FrameRecord {
            size: data.len(),
            data,
            format,
            width: None,
            height: None,
            timestamp: Utc::now(),
            cache_hit: false,
        })
    }

    fn parse_binary(&self, data: Vec<u8>, metadata: FrameMetadata) -> Result<FrameRecord, FrameError> {
        self.check_size(data.len())?;

        let format = match FrameFormat::sniff(&data) {
            FrameFormat::Unknown => metadata
                .format
                .as_deref()
                .and_then(FrameFormat::from_name)
                .unwrap_or(FrameFormat::Unknown),
            sniffed => sniffed,
        };

        let timestamp = metadata
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(FrameRecord {
            size: data.len(),
            data,
            format,
            width: metadata.width,
            height: metadata.height,
            timestamp,
            cache_hit: false,
        })
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn finish(&self, result: Result<FrameRecord, FrameError>) -> Result<FrameRecord, FrameError> {
        match &result {
            Ok(frame) => {
                self.frames_decoded.fetch_add(1, Ordering::Relaxed);
                self.bytes_decoded.fetch_add(frame.size as u64, Ordering::Relaxed);
                debug!("Decoded {} frame of {} bytes", frame.format, frame.size);
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Frame decode failed: {}", e);
            }
        }
        result
    }
}
