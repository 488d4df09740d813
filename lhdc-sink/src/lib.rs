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

//! # LHDC sink
//!
//! Receive side of an A2DP LHDC audio stream. Transport packets are split into
//! codec frames, held in an MTU-bounded queue, optionally resynchronized or
//! drift-corrected, and decoded to PCM either inline or on a dedicated
//! offload thread.

pub mod config;
pub mod decoder;
pub mod drift;
pub mod engine;
pub mod error;
pub mod frame;
pub mod last_frame;
pub mod offload;
pub mod packet;
pub mod queue;
pub mod reassembler;
pub mod session;
pub mod statistics;
pub mod sync;

pub use config::{
    ChannelMode, CodecVersion, DecodePath, OffloadConfig, ProtocolGeneration, StreamConfig,
};
pub use engine::{CodecEngine, ReferenceEngine};
pub use error::{FatalError, LhdcError, Result};
pub use last_frame::{LastFrameInfo, LastFramePublisher};
pub use packet::MediaHeader;
pub use session::LhdcSession;
pub use statistics::ReceiveStatistics;
pub use sync::{SyncMask, SyncTarget};
