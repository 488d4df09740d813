/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Codec engine boundary.
//!
//! The compression math lives behind [`CodecEngine`]. The pipeline only needs
//! to size frames, decode one frame at a time and query the output geometry.
//! [`ReferenceEngine`] understands the frame sub-header and renders silence,
//! which is enough to drive the pipeline in tests and replay tooling.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::{ChannelMode, CodecVersion, ProtocolGeneration};
use crate::{FatalError, LhdcError, Result};

/// Size of the per-frame sub-header understood by [`ReferenceEngine`].
pub const SUB_HEADER_LEN: usize = 4;

const SUB_HEADER_MAGIC: u32 = 0x4c00_0000;
const SUB_HEADER_MAGIC_MASK: u32 = 0xff00_0000;
const SUB_HEADER_SPLIT_MASK: u32 = 0x0060_0000;
const SUB_HEADER_LEN_MASK: u32 = 0x1fff;

/// Engine initialization parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineParams {
    pub version: CodecVersion,
    pub sample_rate: u32,
    pub bits_per_sample: u8,
    pub channels: u8,
    pub lossless: bool,
}

/// Boundary information for the frame starting at a given offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Length in bytes; for dual-mono frames the length of one channel's frame
    pub frame_len: usize,
    /// Both channels are coded separately in one combined frame
    pub is_split: bool,
    pub is_left: bool,
}

/// Build the 4-byte little-endian frame sub-header.
pub fn encode_sub_header(frame_len: usize, is_split: bool, is_left: bool) -> [u8; SUB_HEADER_LEN] {
    let mut hdr = SUB_HEADER_MAGIC | ((frame_len as u32 & SUB_HEADER_LEN_MASK) << 8);
    if is_split {
        hdr |= SUB_HEADER_SPLIT_MASK;
    }
    if !is_left {
        hdr |= 0x1;
    }
    hdr.to_le_bytes()
}

/// Parse the 4-byte frame sub-header. Returns `None` when fewer than four bytes remain.
pub fn parse_sub_header(data: &[u8]) -> Option<(u32, FrameInfo)> {
    let bytes: [u8; SUB_HEADER_LEN] = data.get(..SUB_HEADER_LEN)?.try_into().ok()?;
    let hdr = u32::from_le_bytes(bytes);
    let info = FrameInfo {
        frame_len: ((hdr >> 8) & SUB_HEADER_LEN_MASK) as usize,
        is_split: hdr & SUB_HEADER_SPLIT_MASK == SUB_HEADER_SPLIT_MASK,
        is_left: hdr & 0xf == 0,
    };
    Some((hdr, info))
}

/// Capability interface to the opaque decode engine.
pub trait CodecEngine: Send {
    /// Working memory the engine needs for `version`.
    fn required_memory(&self, version: CodecVersion, params: &EngineParams) -> usize;

    fn init(&mut self, params: &EngineParams) -> Result<()>;

    /// License table installation. Verification is not performed by this crate.
    fn install_license(&mut self, _table: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Decode one frame into `out`, returning the PCM bytes written.
    fn decode_frame(&mut self, out: &mut [u8], input: &[u8]) -> Result<usize>;

    /// Locate the frame starting at `data[0]`, or `None` if no frame can be read.
    fn fetch_frame_info(&self, data: &[u8]) -> Option<FrameInfo>;

    /// Samples per channel produced by one decode call.
    fn samples_per_frame(&self) -> u32;

    fn select_channel(&mut self, mode: ChannelMode) -> Result<()>;

    /// Invalidate all internal state. Safe to call more than once.
    fn destroy(&mut self);
}

/// Engine handle shared between the feeder and the offload decoder context.
pub type SharedEngine = Arc<Mutex<Box<dyn CodecEngine>>>;

pub fn shared_engine(engine: Box<dyn CodecEngine>) -> SharedEngine {
    Arc::new(Mutex::new(engine))
}

/// Lock the engine. A poisoned lock means a decode panicked mid-frame.
pub fn lock_engine(engine: &SharedEngine) -> Result<MutexGuard<'_, Box<dyn CodecEngine>>> {
    engine
        .lock()
        .map_err(|_| FatalError::Engine("engine lock poisoned".into()).into())
}

/// Engine that parses frame sub-headers and outputs silence.
#[derive(Debug)]
pub struct ReferenceEngine {
    params: Option<EngineParams>,
    memory: Vec<u8>,
    channel_mode: ChannelMode,
    samples_per_frame: u32,
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceEngine {
    pub const DEFAULT_SAMPLES_PER_FRAME: u32 = 256;

    pub fn new() -> Self {
        Self::with_samples_per_frame(Self::DEFAULT_SAMPLES_PER_FRAME)
    }

    pub fn with_samples_per_frame(samples_per_frame: u32) -> Self {
        Self {
            params: None,
            memory: Vec::new(),
            channel_mode: ChannelMode::Stereo,
            samples_per_frame,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.params.is_some()
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.channel_mode
    }

    fn frame_bytes(params: &EngineParams, samples_per_frame: u32) -> usize {
        let container = if params.bits_per_sample == 16 { 2 } else { 4 };
        samples_per_frame as usize * container * params.channels as usize
    }
}

impl CodecEngine for ReferenceEngine {
    fn required_memory(&self, version: CodecVersion, params: &EngineParams) -> usize {
        let base = match version {
            CodecVersion::V3 => 0x6000,
            CodecVersion::V4 | CodecVersion::Llac => 0x8000,
            CodecVersion::V5 => 0xa000,
        };
        base + params.channels as usize * 0x1000
    }

    fn init(&mut self, params: &EngineParams) -> Result<()> {
        if self.samples_per_frame == 0 {
            return Err(LhdcError::InvalidConfig("engine frame size is zero".into()));
        }
        let size = self.required_memory(params.version, params);
        self.memory = vec![0; size];
        self.params = Some(params.clone());
        log::debug!(
            "reference engine init: version {} rate {} bits {} channels {} ({size} bytes)",
            params.version.code(),
            params.sample_rate,
            params.bits_per_sample,
            params.channels
        );
        Ok(())
    }

    fn decode_frame(&mut self, out: &mut [u8], input: &[u8]) -> Result<usize> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| FatalError::Engine("decode before init".into()))?;
        if input.is_empty() {
            return Err(LhdcError::InputNotEnough);
        }
        let frame_bytes = Self::frame_bytes(params, self.samples_per_frame);
        let available = out.len();
        let out = out.get_mut(..frame_bytes).ok_or_else(|| {
            LhdcError::InvalidArgument(format!(
                "output buffer of {available} bytes cannot hold {frame_bytes}"
            ))
        })?;
        out.fill(0);
        Ok(frame_bytes)
    }

    fn fetch_frame_info(&self, data: &[u8]) -> Option<FrameInfo> {
        let (hdr, info) = parse_sub_header(data)?;
        let generation = self
            .params
            .as_ref()
            .map(|p| p.version.generation())
            .unwrap_or(ProtocolGeneration::A);
        if generation == ProtocolGeneration::B && hdr & SUB_HEADER_MAGIC_MASK != SUB_HEADER_MAGIC {
            log::trace!("frame sub-header {hdr:#010x} has no sync word");
            return None;
        }
        match generation {
            ProtocolGeneration::A => Some(FrameInfo {
                is_split: false,
                ..info
            }),
            ProtocolGeneration::B => Some(info),
        }
    }

    fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    fn select_channel(&mut self, mode: ChannelMode) -> Result<()> {
        if mode == ChannelMode::LeftRightMerge {
            return Err(LhdcError::UnsupportedChannel);
        }
        self.channel_mode = mode;
        Ok(())
    }

    fn destroy(&mut self) {
        self.params = None;
        self.memory = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_params(version: CodecVersion) -> EngineParams {
        EngineParams {
            version,
            sample_rate: 48_000,
            bits_per_sample: 24,
            channels: 2,
            lossless: false,
        }
    }

    #[test]
    fn test_sub_header_fields() {
        let hdr = encode_sub_header(0x123, true, false);
        let (raw, info) = parse_sub_header(&hdr).unwrap();
        assert_eq!(raw & 0xff00_0000, 0x4c00_0000);
        assert_eq!(info.frame_len, 0x123);
        assert!(info.is_split);
        assert!(!info.is_left);

        let (_, info) = parse_sub_header(&encode_sub_header(40, false, true)).unwrap();
        assert_eq!(info.frame_len, 40);
        assert!(!info.is_split);
        assert!(info.is_left);

        assert!(parse_sub_header(&[0x4c, 0x00]).is_none());
    }

    #[test]
    fn test_decode_requires_init() {
        let mut engine = ReferenceEngine::new();
        let mut out = vec![0u8; 2048];
        let err = engine.decode_frame(&mut out, &[1, 2, 3, 4]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_outputs_silence_of_frame_size() {
        let mut engine = ReferenceEngine::new();
        engine.init(&create_test_params(CodecVersion::V3)).unwrap();
        let mut out = vec![0xaau8; 4096];
        let produced = engine.decode_frame(&mut out, &[1, 2, 3, 4]).unwrap();
        assert_eq!(produced, 256 * 4 * 2);
        assert!(out[..produced].iter().all(|&b| b == 0));
        assert!(out[produced..].iter().all(|&b| b == 0xaa));

        let mut small = vec![0u8; 16];
        assert!(matches!(
            engine.decode_frame(&mut small, &[1]),
            Err(LhdcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_generation_b_requires_sync_word() {
        let mut engine = ReferenceEngine::new();
        engine.init(&create_test_params(CodecVersion::V5)).unwrap();
        assert!(engine.fetch_frame_info(&[0, 0x10, 0, 0]).is_none());
        let info = engine
            .fetch_frame_info(&encode_sub_header(64, true, true))
            .unwrap();
        assert!(info.is_split);
    }

    #[test]
    fn test_generation_a_ignores_split_flag() {
        let mut engine = ReferenceEngine::new();
        engine.init(&create_test_params(CodecVersion::V4)).unwrap();
        let info = engine
            .fetch_frame_info(&encode_sub_header(64, true, true))
            .unwrap();
        assert_eq!(info.frame_len, 64);
        assert!(!info.is_split);
    }

    #[test]
    fn test_select_channel_and_destroy() {
        let mut engine = ReferenceEngine::new();
        engine.init(&create_test_params(CodecVersion::Llac)).unwrap();
        assert_eq!(
            engine.select_channel(ChannelMode::LeftRightMerge),
            Err(LhdcError::UnsupportedChannel)
        );
        engine.select_channel(ChannelMode::Right).unwrap();
        assert_eq!(engine.channel_mode(), ChannelMode::Right);
        engine.destroy();
        engine.destroy();
        assert!(!engine.is_initialized());
    }
}
