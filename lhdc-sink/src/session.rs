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

//! Per-stream receive session tying the pipeline stages together.

use crate::config::{ChannelMode, CodecVersion, DecodePath, StreamConfig};
use crate::decoder::DirectDecoder;
use crate::drift::DriftCorrector;
use crate::engine::{lock_engine, shared_engine, CodecEngine, EngineParams, SharedEngine};
use crate::frame::FramePool;
use crate::last_frame::{LastFrameInfo, LastFramePublisher};
use crate::offload::{OffloadDecoder, OffloadLayout, OffloadState, TickOutput};
use crate::packet::{MediaHeader, PacketHeader};
use crate::queue::PendingFrameQueue;
use crate::reassembler::{PacketOutcome, PacketSummary, Reassembler, SequenceTracking};
use crate::statistics::{ReceiveStatistics, StatisticsCalculator};
use crate::sync::{FrameSynchronizer, HeadFrameInfo, SyncMask, SyncTarget};
use crate::{LhdcError, Result};

enum DecodeDriver {
    Direct(DirectDecoder),
    Offload(OffloadDecoder),
}

impl DecodeDriver {
    fn tick_bytes(&self) -> usize {
        match self {
            DecodeDriver::Direct(decoder) => decoder.frame_bytes(),
            DecodeDriver::Offload(decoder) => decoder.tick_bytes(),
        }
    }
}

/// Receive pipeline for one A2DP LHDC stream.
///
/// Packets go in through [`store_packet`](Self::store_packet), PCM comes out of
/// [`decode_frame`](Self::decode_frame). A fatal error poisons the session:
/// data-path calls return [`LhdcError::InvalidState`] until [`reinit`](Self::reinit).
pub struct LhdcSession {
    config: StreamConfig,
    version: CodecVersion,
    engine: SharedEngine,
    samples_per_frame: u32,
    reassembler: Reassembler,
    queue: PendingFrameQueue,
    pool: FramePool,
    synchronizer: FrameSynchronizer,
    drift: Option<DriftCorrector>,
    driver: DecodeDriver,
    last_frame: LastFramePublisher,
    stats: StatisticsCalculator,
    poisoned: bool,
    closed: bool,
    /// False once `destroy` has run and no `init` has succeeded since
    engine_live: bool,
}

impl LhdcSession {
    pub fn new(config: StreamConfig, mut engine: Box<dyn CodecEngine>) -> Result<Self> {
        let (version, samples_per_frame) = configure_engine(&config, engine.as_mut())?;
        let engine = shared_engine(engine);
        let driver = create_driver(&config, &engine, samples_per_frame)?;

        let mtu_limit = config.mtu_limit();
        let mut pool = FramePool::new(mtu_limit);
        pool.prefill(mtu_limit, config.read_buffer_size());
        let last_frame = LastFramePublisher::new();
        last_frame.reset(samples_per_frame, config.channel_mode);

        log::info!(
            "lhdc session: version {} rate {} bits {} channels {} mode {:?}, {} samples per frame, mtu limit {mtu_limit}",
            version.code(),
            config.sample_rate,
            config.bits_per_sample,
            config.channels,
            config.channel_mode,
            samples_per_frame
        );

        Ok(Self {
            version,
            samples_per_frame,
            reassembler: Reassembler::new(config.generation, config.channel_mode),
            queue: PendingFrameQueue::new(mtu_limit),
            pool,
            synchronizer: FrameSynchronizer::new(samples_per_frame),
            drift: config.drift_correction.then(DriftCorrector::new),
            driver,
            engine,
            last_frame,
            stats: StatisticsCalculator::new(),
            poisoned: false,
            closed: false,
            engine_live: true,
            config,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn version(&self) -> CodecVersion {
        self.version
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    /// Bytes `decode_frame` expects in its output buffer.
    pub fn tick_bytes(&self) -> usize {
        self.driver.tick_bytes()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// State of the offload path, `None` on the direct path.
    pub fn offload_state(&self) -> Option<OffloadState> {
        match &self.driver {
            DecodeDriver::Direct(_) => None,
            DecodeDriver::Offload(decoder) => Some(decoder.state()),
        }
    }

    /// Handle to the last-frame record, for telemetry readers.
    pub fn last_frame(&self) -> LastFramePublisher {
        self.last_frame.clone()
    }

    pub fn last_frame_info(&self) -> LastFrameInfo {
        self.last_frame.snapshot()
    }

    pub fn statistics(&self) -> &ReceiveStatistics {
        self.stats.statistics()
    }

    /// Reassemble one transport packet into the pending queue.
    pub fn store_packet(&mut self, media: &MediaHeader, packet: &[u8]) -> Result<PacketOutcome> {
        self.ensure_usable()?;
        let result = self.store_packet_inner(media, packet);
        self.track(result)
    }

    fn store_packet_inner(&mut self, media: &MediaHeader, packet: &[u8]) -> Result<PacketOutcome> {
        // short and zero-frame packets are ignored before they reach the statistics
        let carries_frames = PacketHeader::parse(self.config.generation, packet)
            .is_some_and(|header| header.frame_count > 0);
        if carries_frames {
            self.stats.packet_received(packet.len());
        }
        let owed_before = self.drift.as_ref().map_or(0, DriftCorrector::owed);
        let len_before = self.queue.len();

        let result = {
            let engine = lock_engine(&self.engine)?;
            self.reassembler.ingest(
                media,
                packet,
                SequenceTracking::Update,
                &**engine,
                &mut self.queue,
                &mut self.pool,
                self.drift.as_mut(),
            )
        };

        let owed_after = self.drift.as_ref().map_or(0, DriftCorrector::owed);
        let (inserted, dropped) = if owed_after < owed_before {
            ((owed_before - owed_after) as usize, 0)
        } else {
            (0, (owed_after - owed_before) as usize)
        };
        for _ in 0..inserted {
            self.stats.drift_filler_inserted();
        }
        if dropped > 0 {
            self.stats.frames_discarded(dropped as u64);
        }

        match &result {
            Ok(outcome) => {
                self.stats.frames_queued(outcome.frames_queued as u64);
                self.stats.packets_lost(outcome.lost_packets as u64);
            }
            Err(err) => {
                let appended = (self.queue.len() + dropped).saturating_sub(len_before + inserted);
                self.stats.frames_queued(appended as u64);
                if matches!(err, LhdcError::MtuLimit { .. }) {
                    self.stats.mtu_rejection();
                }
            }
        }
        result
    }

    /// Check a packet without queueing it or advancing the sequence tracking.
    pub fn validate_packet(&mut self, packet: &[u8]) -> Result<PacketSummary> {
        self.ensure_usable()?;
        let engine = lock_engine(&self.engine)?;
        self.reassembler.validate(packet, &**engine)
    }

    /// Reset the last-frame record to the packet about to be stored.
    pub fn preparse_packet(&mut self, media: &MediaHeader) -> Result<()> {
        self.ensure_usable()?;
        self.last_frame.preparse(media, self.samples_per_frame);
        Ok(())
    }

    /// Fill `out` with the next tick of PCM. `out` must be [`tick_bytes`](Self::tick_bytes) long.
    pub fn decode_frame(&mut self, out: &mut [u8]) -> Result<usize> {
        self.ensure_usable()?;
        let result = self.decode_inner(out);
        if matches!(result, Err(LhdcError::CacheUnderflow)) {
            self.stats.cache_underflow();
        }
        self.track(result)
    }

    fn decode_inner(&mut self, out: &mut [u8]) -> Result<usize> {
        match &mut self.driver {
            DecodeDriver::Direct(decoder) => {
                let mut engine = lock_engine(&self.engine)?;
                let bytes = decoder.decode(
                    out,
                    &mut **engine,
                    &mut self.queue,
                    &mut self.pool,
                    &self.last_frame,
                )?;
                self.stats.frame_decoded(1);
                Ok(bytes)
            }
            DecodeDriver::Offload(decoder) => {
                match decoder.decode(out, &mut self.queue, &self.last_frame)? {
                    TickOutput::Pcm { bytes, frames } => {
                        self.stats.frame_decoded(frames as u64);
                        Ok(bytes)
                    }
                    TickOutput::Silence { bytes } => {
                        self.stats.silent_tick();
                        Ok(bytes)
                    }
                }
            }
        }
    }

    /// Drop head frames until the head matches `target` under `mask`.
    pub fn synchronize(&mut self, target: &SyncTarget, mask: SyncMask) -> Result<usize> {
        self.ensure_usable()?;
        let result = self.synchronize_inner(target, mask);
        self.track(result)
    }

    fn synchronize_inner(&mut self, target: &SyncTarget, mask: SyncMask) -> Result<usize> {
        self.reset_offload()?;
        self.reassembler.reset();
        let before = self.queue.len();
        let result = self
            .synchronizer
            .synchronize(&mut self.queue, &mut self.pool, target, mask);
        self.after_discard(before);
        result
    }

    /// Drop head frames until at most `keep` remain.
    pub fn trim_to(&mut self, keep: usize) -> Result<usize> {
        self.ensure_usable()?;
        let before = self.queue.len();
        let dropped = self
            .synchronizer
            .trim_to(&mut self.queue, &mut self.pool, keep);
        self.after_discard(before);
        Ok(dropped)
    }

    /// Reset offload tracking and trim the queue to the configured target.
    pub fn discard_packets(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        let result = self.reset_offload();
        self.track(result)?;
        self.trim_to(self.config.discard_target_frames)
    }

    pub fn queued_samples(&self) -> u64 {
        self.synchronizer.queued_samples(&self.queue)
    }

    /// Drop whole frames worth `samples` samples from the head.
    pub fn discard_samples(&mut self, samples: u32) -> Result<usize> {
        self.ensure_usable()?;
        let before = self.queue.len();
        let result = self
            .synchronizer
            .discard_samples(&mut self.queue, &mut self.pool, samples);
        self.after_discard(before);
        result
    }

    pub fn head_frame_info(&self) -> HeadFrameInfo {
        self.synchronizer.head_frame_info(&self.queue)
    }

    /// Hand a drift measurement (in frames) to the corrector.
    ///
    /// Positive values insert filler frames, negative values drop frames.
    /// Returns `false` while an earlier measurement is still being applied.
    pub fn seed_drift(&mut self, frames: i32) -> Result<bool> {
        self.ensure_usable()?;
        match self.drift.as_mut() {
            Some(corrector) => Ok(corrector.seed(frames)),
            None => Err(LhdcError::InvalidState),
        }
    }

    pub fn drift_owed(&self) -> i32 {
        self.drift.as_ref().map_or(0, DriftCorrector::owed)
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) -> Result<()> {
        self.ensure_usable()?;
        if mode == ChannelMode::LeftRightMerge {
            return Err(LhdcError::UnsupportedChannel);
        }
        let result = lock_engine(&self.engine).and_then(|mut engine| engine.select_channel(mode));
        self.track(result)?;

        self.config.channel_mode = mode;
        self.reassembler.set_channel_mode(mode);
        match &mut self.driver {
            DecodeDriver::Direct(decoder) => decoder.set_channel_mode(mode),
            DecodeDriver::Offload(decoder) => decoder.set_channel_mode(mode),
        }
        self.last_frame.update(|info| info.channel_mode = mode);
        log::info!("channel mode set to {mode:?}");
        Ok(())
    }

    /// Reconfigure for a new stream, clearing a poisoned session.
    pub fn reinit(&mut self, config: StreamConfig) -> Result<()> {
        if self.closed {
            return Err(LhdcError::InvalidState);
        }
        config.validate()?;
        if let DecodeDriver::Offload(decoder) = &mut self.driver {
            decoder.shutdown();
        }
        self.clear_queue();

        let configured = self.reconfigure_engine(&config).and_then(|(version, spf)| {
            let driver = create_driver(&config, &self.engine, spf)?;
            Ok((version, spf, driver))
        });
        let (version, samples_per_frame, driver) = match configured {
            Ok(configured) => configured,
            Err(err) => {
                log::error!("lhdc session unusable after failed reinit: {err}");
                self.poisoned = true;
                return Err(err);
            }
        };
        self.driver = driver;

        let mtu_limit = config.mtu_limit();
        self.queue = PendingFrameQueue::new(mtu_limit);
        self.pool = FramePool::new(mtu_limit);
        self.pool.prefill(mtu_limit, config.read_buffer_size());
        self.reassembler = Reassembler::new(config.generation, config.channel_mode);
        self.synchronizer = FrameSynchronizer::new(samples_per_frame);
        self.drift = config.drift_correction.then(DriftCorrector::new);
        self.last_frame.reset(samples_per_frame, config.channel_mode);
        self.stats.reset();
        self.version = version;
        self.samples_per_frame = samples_per_frame;
        self.poisoned = false;
        log::info!(
            "lhdc session reconfigured: version {} rate {}",
            version.code(),
            config.sample_rate
        );
        self.config = config;
        Ok(())
    }

    /// Tear the session down. The engine is destroyed exactly once.
    pub fn deinit(&mut self) {
        if self.closed {
            return;
        }
        if let DecodeDriver::Offload(decoder) = &mut self.driver {
            decoder.shutdown();
        }
        self.clear_queue();
        self.reassembler.reset();
        if self.engine_live {
            match lock_engine(&self.engine) {
                Ok(mut engine) => engine.destroy(),
                Err(err) => log::warn!("engine not destroyed: {err}"),
            }
            self.engine_live = false;
        }
        self.closed = true;
        log::info!("lhdc session closed");
    }

    fn reconfigure_engine(&mut self, config: &StreamConfig) -> Result<(CodecVersion, u32)> {
        let mut engine = lock_engine(&self.engine)?;
        if self.engine_live {
            engine.destroy();
            self.engine_live = false;
        }
        let configured = configure_engine(config, &mut **engine)?;
        self.engine_live = true;
        Ok(configured)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed || self.poisoned {
            return Err(LhdcError::InvalidState);
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                log::error!("lhdc session poisoned: {err}");
                self.poisoned = true;
            }
        }
        result
    }

    fn reset_offload(&mut self) -> Result<()> {
        match &mut self.driver {
            DecodeDriver::Direct(_) => Ok(()),
            DecodeDriver::Offload(decoder) => decoder.reset_frames(),
        }
    }

    fn after_discard(&mut self, before: usize) {
        let dropped = before.saturating_sub(self.queue.len());
        if dropped > 0 {
            self.stats.frames_discarded(dropped as u64);
        }
        let undecoded = self.queue.len() as u32;
        self.last_frame
            .update(|info| info.undecoded_frames = undecoded);
    }

    fn clear_queue(&mut self) {
        for frame in self.queue.drain() {
            self.pool.recycle(frame);
        }
    }
}

impl Drop for LhdcSession {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Initialize `engine` for `config`. Returns the selected version and samples per frame.
fn configure_engine(
    config: &StreamConfig,
    engine: &mut dyn CodecEngine,
) -> Result<(CodecVersion, u32)> {
    config.validate()?;
    let version = config.version();
    let params = EngineParams {
        version,
        sample_rate: config.sample_rate,
        bits_per_sample: config.bits_per_sample,
        channels: config.channels,
        lossless: config.lossless,
    };
    log::debug!(
        "engine needs {} bytes for version {}",
        engine.required_memory(version, &params),
        version.code()
    );
    engine.init(&params)?;
    engine.select_channel(config.channel_mode)?;
    let samples_per_frame = engine.samples_per_frame();
    if samples_per_frame == 0 {
        return Err(LhdcError::InvalidConfig(
            "engine reports zero samples per frame".into(),
        ));
    }
    Ok((version, samples_per_frame))
}

fn create_driver(
    config: &StreamConfig,
    engine: &SharedEngine,
    samples_per_frame: u32,
) -> Result<DecodeDriver> {
    Ok(match &config.decode_path {
        DecodePath::Direct => DecodeDriver::Direct(DirectDecoder::new(config, samples_per_frame)),
        DecodePath::Offload(offload) => {
            let layout = OffloadLayout::for_stream(config, offload, samples_per_frame);
            DecodeDriver::Offload(OffloadDecoder::spawn(layout, engine.clone())?)
        }
    })
}
