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

//! Stream configuration consumed from the capability negotiation layer.

use serde::{Deserialize, Serialize};

use crate::{LhdcError, Result};

/// Extension flag advertising LLAC support.
pub const EXT_FLAG_LLAC: u32 = 0x04;
/// Extension flag advertising LHDC V4 support.
pub const EXT_FLAG_V4: u32 = 0x40;

/// Default MTU limiter for generation A streams.
pub const GEN_A_MTU_LIMITER: usize = 70;
/// Default MTU limiter for generation B streams.
pub const GEN_B_MTU_LIMITER: usize = 120;

/// Read buffer sizes used to pre-size the frame pool.
pub const GEN_A_READBUF_SIZE: usize = 652;
pub const GEN_B_READBUF_SIZE: usize = 626;
pub const GEN_B_READBUF_SIZE_MONO: usize = 314;

const SUPPORTED_SAMPLE_RATES: [u32; 4] = [44_100, 48_000, 96_000, 192_000];

/// Wire protocol generation of the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolGeneration {
    /// V3 / V4 / LLAC packets, frame count in bits [5:2]
    A,
    /// V5 packets, frame count in bits [7:2] and latency class in bits [1:0]
    B,
}

/// Codec engine variant selected once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecVersion {
    V3,
    V4,
    Llac,
    V5,
}

impl CodecVersion {
    /// Numeric version code as reported by the engine.
    pub fn code(self) -> u16 {
        match self {
            CodecVersion::V3 => 300,
            CodecVersion::V4 => 400,
            CodecVersion::Llac => 500,
            CodecVersion::V5 => 550,
        }
    }

    pub fn generation(self) -> ProtocolGeneration {
        match self {
            CodecVersion::V5 => ProtocolGeneration::B,
            _ => ProtocolGeneration::A,
        }
    }
}

/// Pick the engine variant from the negotiated extension flags.
pub fn select_version(generation: ProtocolGeneration, ext_flags: u32, sample_rate: u32) -> CodecVersion {
    if generation == ProtocolGeneration::B {
        return CodecVersion::V5;
    }
    let llac = ext_flags & EXT_FLAG_LLAC != 0;
    let v4 = ext_flags & EXT_FLAG_V4 != 0;
    match (llac, v4) {
        (true, true) if sample_rate <= 48_000 => CodecVersion::Llac,
        (true, true) => CodecVersion::V4,
        (true, false) => CodecVersion::Llac,
        (false, true) => CodecVersion::V4,
        (false, false) => CodecVersion::V3,
    }
}

/// Which channel(s) the sink renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelMode {
    #[default]
    Stereo,
    Left,
    Right,
    /// Downmix of both channels; the engine has no support for it
    LeftRightMerge,
}

impl ChannelMode {
    pub fn is_split(self) -> bool {
        matches!(self, ChannelMode::Left | ChannelMode::Right)
    }
}

/// Co-processor offload settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Depth of the platform's output DMA buffer in samples (both halves)
    pub dma_buffer_samples: u32,
    /// Multiplier applied to the per-DMA-half frame count for the input ring
    pub input_ring_factor: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            dma_buffer_samples: 1024,
            input_ring_factor: 8,
        }
    }
}

impl OffloadConfig {
    /// Frames needed to cover half of the DMA buffer, rounded up.
    pub fn frames_per_dma_half(&self, samples_per_frame: u32) -> usize {
        let half = self.dma_buffer_samples / 2;
        half.div_ceil(samples_per_frame.max(1)) as usize
    }
}

/// How decoded PCM is produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecodePath {
    /// Decode synchronously in the output callback
    #[default]
    Direct,
    /// Hand frames to a decoder thread through bounded rings
    Offload(OffloadConfig),
}

/// Configuration for one A2DP LHDC stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub generation: ProtocolGeneration,
    /// Negotiated extension flags (`EXT_FLAG_*`)
    pub ext_flags: u32,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output bit depth (24-bit samples are carried in 32-bit containers)
    pub bits_per_sample: u8,
    /// Output channel count
    pub channels: u8,
    pub channel_mode: ChannelMode,
    /// Overrides the generation's default MTU limiter
    pub mtu_limiter: Option<usize>,
    /// Lossless coding negotiated (generation B only)
    pub lossless: bool,
    /// Insert/drop frames to follow an external drift measurement
    pub drift_correction: bool,
    /// Queue length kept by `discard_packets`
    pub discard_target_frames: usize,
    pub decode_path: DecodePath,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            generation: ProtocolGeneration::A,
            ext_flags: 0,
            sample_rate: 48_000,
            bits_per_sample: 24,
            channels: 2,
            channel_mode: ChannelMode::Stereo,
            mtu_limiter: None,
            lossless: false,
            drift_correction: false,
            discard_target_frames: 0,
            decode_path: DecodePath::Direct,
        }
    }
}

impl StreamConfig {
    /// Check the configuration against what the receive pipeline supports.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(LhdcError::InvalidSampleRate(self.sample_rate));
        }
        if !matches!(self.bits_per_sample, 16 | 24 | 32) {
            return Err(LhdcError::InvalidBitDepth(self.bits_per_sample));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(LhdcError::InvalidChannelCount(self.channels));
        }
        if self.channel_mode == ChannelMode::LeftRightMerge {
            return Err(LhdcError::UnsupportedChannel);
        }
        if self.generation == ProtocolGeneration::B
            && self.channels == 1
            && !self.channel_mode.is_split()
        {
            return Err(LhdcError::InvalidConfig(
                "mono output requires a left or right channel selection".into(),
            ));
        }
        if self.lossless && self.generation == ProtocolGeneration::A {
            return Err(LhdcError::InvalidConfig(
                "lossless coding needs a generation B stream".into(),
            ));
        }
        if self.mtu_limiter == Some(0) {
            return Err(LhdcError::InvalidConfig("MTU limiter must be non-zero".into()));
        }
        if let DecodePath::Offload(offload) = &self.decode_path {
            if offload.dma_buffer_samples == 0 || offload.input_ring_factor == 0 {
                return Err(LhdcError::InvalidConfig(
                    "offload ring geometry must be non-zero".into(),
                ));
            }
            if self.drift_correction {
                return Err(LhdcError::InvalidConfig(
                    "drift correction is only available on the direct decode path".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn version(&self) -> CodecVersion {
        select_version(self.generation, self.ext_flags, self.sample_rate)
    }

    /// Maximum number of frames allowed in the pending queue
    pub fn mtu_limit(&self) -> usize {
        self.mtu_limiter.unwrap_or(match self.generation {
            ProtocolGeneration::A => GEN_A_MTU_LIMITER,
            ProtocolGeneration::B => GEN_B_MTU_LIMITER,
        })
    }

    /// Bytes occupied by one sample of one channel in the PCM output.
    pub fn container_bytes(&self) -> usize {
        match self.bits_per_sample {
            16 => 2,
            _ => 4,
        }
    }

    /// PCM bytes produced by decoding one frame.
    pub fn frame_bytes(&self, samples_per_frame: u32) -> usize {
        samples_per_frame as usize * self.container_bytes() * self.channels as usize
    }

    /// Size of the buffers the frame pool pre-allocates.
    pub fn read_buffer_size(&self) -> usize {
        match (self.generation, self.channels) {
            (ProtocolGeneration::A, _) => GEN_A_READBUF_SIZE,
            (ProtocolGeneration::B, 1) => GEN_B_READBUF_SIZE_MONO,
            (ProtocolGeneration::B, _) => GEN_B_READBUF_SIZE,
        }
    }
}
