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

use thiserror::Error;

/// Result type for LHDC sink operations
pub type Result<T> = std::result::Result<T, LhdcError>;

/// Contract violations between the reassembler, the queue and the codec engine.
///
/// None of these can be repaired locally. The owning session stops accepting
/// data-path calls until it has been reinitialized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("parsed frame length is zero at payload offset {offset}")]
    ZeroLengthFrame { offset: usize },

    #[error("frame of {frame_len} bytes at offset {offset} overruns payload of {payload_len} bytes")]
    FrameOverrun {
        frame_len: usize,
        offset: usize,
        payload_len: usize,
    },

    #[error("decoder produced {produced} PCM bytes, expected {expected}")]
    PcmLengthMismatch { produced: usize, expected: usize },

    #[error("engine step produced {produced} bytes, frame size is {frame_bytes}")]
    EngineOutput { produced: usize, frame_bytes: usize },

    #[error("malformed offload envelope: {0}")]
    MalformedEnvelope(String),

    #[error("accumulated {accumulated} bytes is not a multiple of frame size {frame_bytes}")]
    DecodeStepMisaligned {
        accumulated: usize,
        frame_bytes: usize,
    },

    #[error("dual-mono frame received without a left/right channel selection")]
    CombinedStereoUnsupported,

    #[error("codec engine failure: {0}")]
    Engine(String),
}

/// Errors that can occur in LHDC sink operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LhdcError {
    #[error("Cache underflow: no frame queued for this tick")]
    CacheUnderflow,

    #[error("MTU limiter reached ({limit} frames queued)")]
    MtuLimit { limit: usize },

    #[error("Sync target not found in pending frames")]
    SyncMismatch,

    #[error("Packet does not hold enough data for the declared frames")]
    InputNotEnough,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid bit depth: {0}")]
    InvalidBitDepth(u8),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported channel selection")]
    UnsupportedChannel,

    #[error("Session must be reinitialized before use")]
    InvalidState,

    #[error("Fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl LhdcError {
    /// True when the stream has to be torn down and configured again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LhdcError::Fatal(_))
    }
}
