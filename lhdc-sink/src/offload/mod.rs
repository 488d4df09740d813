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

//! Co-processor offload decode path.
//!
//! The feeder runs in the caller's output tick. It moves queued frames into a
//! bounded input ring and claims finished PCM from an output ring. The decoder
//! side runs on its own thread, woken through an `mpsc` control channel, and
//! fills one output envelope per tick's worth of frames. Envelopes move by
//! value through the rings, so neither side can touch one the other owns.

mod messages;
mod ring;
mod state;

pub use messages::{InEnvelope, InFrameInfo, OutEnvelope, WorkerMessage};
pub use ring::{RingGeometry, SharedState};
pub use state::{OffloadEvent, OffloadState};

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ring::{envelope_rings, FeederEnds, WorkerEnds};

use crate::config::{ChannelMode, OffloadConfig, StreamConfig};
use crate::engine::SharedEngine;
use crate::last_frame::LastFramePublisher;
use crate::queue::PendingFrameQueue;
use crate::{FatalError, LhdcError, Result};

/// Minimum number of output envelopes (double buffering)
const MIN_OUTPUT_ENVELOPES: usize = 2;

/// Everything both sides need to agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadLayout {
    pub ring: RingGeometry,
    /// PCM bytes of one decoded frame
    pub frame_bytes: usize,
    pub samples_per_frame: u32,
    pub channel_mode: ChannelMode,
}

impl OffloadLayout {
    /// Size the rings from the platform's DMA depth.
    pub fn for_stream(config: &StreamConfig, offload: &OffloadConfig, samples_per_frame: u32) -> Self {
        let frames = offload.frames_per_dma_half(samples_per_frame).max(1);
        let frame_bytes = config.frame_bytes(samples_per_frame);
        Self {
            ring: RingGeometry {
                input_capacity: frames * offload.input_ring_factor,
                output_envelopes: frames.max(MIN_OUTPUT_ENVELOPES),
                tick_bytes: frames * frame_bytes,
            },
            frame_bytes,
            samples_per_frame,
            channel_mode: config.channel_mode,
        }
    }

    fn validate(&self) -> Result<()> {
        let ring = &self.ring;
        if self.frame_bytes == 0
            || ring.input_capacity == 0
            || ring.output_envelopes == 0
            || ring.tick_bytes == 0
        {
            return Err(LhdcError::InvalidConfig(format!(
                "offload layout has an empty dimension: {self:?}"
            )));
        }
        if ring.tick_bytes % self.frame_bytes != 0 {
            return Err(LhdcError::InvalidConfig(format!(
                "tick of {} bytes is not a whole number of {}-byte frames",
                ring.tick_bytes, self.frame_bytes
            )));
        }
        Ok(())
    }
}

/// PCM delivered by one feeder tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutput {
    /// Decoded PCM from `frames` frames
    Pcm { bytes: usize, frames: u32 },
    /// The decoder had nothing ready yet; the buffer was zeroed
    Silence { bytes: usize },
}

impl TickOutput {
    pub fn bytes(&self) -> usize {
        match *self {
            TickOutput::Pcm { bytes, .. } | TickOutput::Silence { bytes } => bytes,
        }
    }
}

/// Build a connected feeder/decoder pair without starting a thread.
///
/// Useful when the decoder side is driven by an external scheduler.
pub fn offload_pair(
    layout: OffloadLayout,
    engine: SharedEngine,
) -> Result<(OffloadFeeder, OffloadWorker)> {
    layout.validate()?;
    let (feeder_ends, worker_ends) = envelope_rings(layout.ring);
    let shared = Arc::new(SharedState::default());
    log::debug!(
        "offload rings: {} input, {} output envelopes of {} bytes",
        layout.ring.input_capacity,
        layout.ring.output_envelopes,
        layout.ring.tick_bytes
    );

    let feeder = OffloadFeeder {
        ends: feeder_ends,
        shared: shared.clone(),
        layout,
        state: OffloadState::Uninit.on_event(OffloadEvent::Configured),
        submitted: 0,
        reset_requested: false,
        kick: None,
    };
    let worker = OffloadWorker {
        ends: worker_ends,
        shared,
        engine,
        scratch: vec![0; layout.frame_bytes],
        layout,
        working: None,
    };
    Ok((feeder, worker))
}

/// Caller-side half of the offload path
pub struct OffloadFeeder {
    ends: FeederEnds,
    shared: Arc<SharedState>,
    layout: OffloadLayout,
    state: OffloadState,
    /// Input envelopes pushed since configuration
    submitted: u64,
    reset_requested: bool,
    kick: Option<Sender<WorkerMessage>>,
}

impl OffloadFeeder {
    pub fn state(&self) -> OffloadState {
        self.state
    }

    pub fn layout(&self) -> &OffloadLayout {
        &self.layout
    }

    /// Channel mode stamped on frames submitted from now on.
    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.layout.channel_mode = mode;
    }

    /// Input envelopes submitted but not yet taken by the decoder
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.shared.consumed())
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Ask for the rings to be rebuilt on the next tick.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// Invalidate everything submitted so far.
    ///
    /// Frames already in the input ring and PCM already in the output ring
    /// belong to the old epoch and are dropped by whichever side meets them.
    pub fn reset_frames(&mut self) -> Result<()> {
        let epoch = self.shared.bump_epoch();
        while let Some(env) = self.ends.output.pop() {
            self.release(env)?;
        }
        self.reset_requested = false;
        log::debug!(
            "offload reset to epoch {epoch}, {} stale inputs in flight",
            self.in_flight()
        );
        Ok(())
    }

    /// Produce one tick of PCM into `out`.
    pub fn decode(
        &mut self,
        out: &mut [u8],
        queue: &mut PendingFrameQueue,
        last_frame: &LastFramePublisher,
    ) -> Result<TickOutput> {
        if out.len() != self.layout.ring.tick_bytes {
            return Err(LhdcError::InvalidArgument(format!(
                "output buffer is {} bytes, offload tick is {}",
                out.len(),
                self.layout.ring.tick_bytes
            )));
        }
        if let Some(fatal) = self.shared.take_fatal() {
            log::warn!("offload decoder failed: {fatal}");
            self.reset_requested = true;
            return Err(fatal.into());
        }
        if self.reset_requested {
            self.reset_frames()?;
        }
        if self.state == OffloadState::UnderflowRecovery && !queue.is_empty() {
            self.state = self.state.on_event(OffloadEvent::FramesAvailable);
            log::debug!("offload leaving underflow recovery, {} frames queued", queue.len());
        }

        self.feed(queue);
        self.kick()?;

        let mut claimed = self.claim()?;
        if claimed.is_none() {
            if self.in_flight() > 0 || self.shared.is_busy() {
                log::trace!("offload output not ready, {} in flight", self.in_flight());
                out.fill(0);
                return Ok(TickOutput::Silence { bytes: out.len() });
            }
            // the decoder is idle, so anything it published is visible now
            claimed = self.claim()?;
        }
        let Some(env) = claimed else {
            log::debug!(
                "offload cache underflow: queue {}, in flight 0",
                queue.len()
            );
            self.reset_requested = true;
            self.state = self.state.on_event(OffloadEvent::InputStarved);
            last_frame.set_undecoded(0);
            return Err(LhdcError::CacheUnderflow);
        };

        if env.pcm.is_empty() {
            out.fill(0);
            self.release(env)?;
            return Ok(TickOutput::Silence { bytes: out.len() });
        }
        if env.pcm.len() != out.len() {
            let produced = env.pcm.len();
            self.release(env)?;
            self.reset_requested = true;
            return Err(FatalError::PcmLengthMismatch {
                produced,
                expected: out.len(),
            }
            .into());
        }

        out.copy_from_slice(&env.pcm);
        if let Some(info) = env.info {
            let undecoded = queue.len() as u64 + self.submitted.saturating_sub(env.frame_idx);
            last_frame.frames_decoded(
                &info.identity,
                env.decoded_frames as u64,
                undecoded.min(u32::MAX as u64) as u32,
                env.frame_samples,
                info.channel_mode,
            );
        }
        let frames = env.decoded_frames;
        self.release(env)?;
        self.state = self.state.on_event(OffloadEvent::OutputDelivered);
        Ok(TickOutput::Pcm {
            bytes: out.len(),
            frames,
        })
    }

    /// Move queued frames into the input ring until it is full.
    fn feed(&mut self, queue: &mut PendingFrameQueue) -> usize {
        let epoch = self.shared.epoch();
        let mut fed = 0;
        while !self.ends.input.is_full() {
            let Some(frame) = queue.pop_front() else {
                break;
            };
            let env = InEnvelope {
                epoch,
                info: InFrameInfo {
                    identity: frame.identity,
                    channel_mode: self.layout.channel_mode,
                },
                frame,
            };
            if let Err(env) = self.ends.input.push(env) {
                if queue.prepend(env.frame).is_err() {
                    log::warn!("offload input rejected a frame and the queue refilled meanwhile");
                }
                break;
            }
            self.submitted += 1;
            fed += 1;
        }
        if fed > 0 {
            log::trace!("fed {fed} frames, {} left queued", queue.len());
        }
        fed
    }

    /// Pop the next output envelope of the current epoch, recycling stale ones.
    fn claim(&mut self) -> Result<Option<OutEnvelope>> {
        let epoch = self.shared.epoch();
        loop {
            match self.ends.output.pop() {
                Some(env) if env.epoch != epoch => self.release(env)?,
                other => return Ok(other),
            }
        }
    }

    fn kick(&self) -> Result<()> {
        if let Some(control) = &self.kick {
            control
                .send(WorkerMessage::Process)
                .map_err(|_| FatalError::Engine("offload decoder thread is gone".into()))?;
        }
        Ok(())
    }

    fn release(&mut self, mut env: OutEnvelope) -> Result<()> {
        env.recycle(self.shared.epoch());
        self.ends
            .free
            .push(env)
            .map_err(|_| FatalError::MalformedEnvelope("free ring overflow".into()).into())
    }
}

/// Outcome of one decoder-side step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// A full output envelope was published
    Produced,
    /// Input ran out; the partially filled envelope is kept for next time
    InputStarved,
    /// No free output envelope; the feeder has not consumed output yet
    OutputBusy,
    /// A fatal error is latched; nothing is processed until the feeder sees it
    Halted,
}

/// Decoder-side half of the offload path
pub struct OffloadWorker {
    ends: WorkerEnds,
    shared: Arc<SharedState>,
    engine: SharedEngine,
    layout: OffloadLayout,
    working: Option<OutEnvelope>,
    scratch: Vec<u8>,
}

impl OffloadWorker {
    pub fn step(&mut self) -> WorkerStatus {
        if self.shared.has_fatal() {
            return WorkerStatus::Halted;
        }
        self.shared.set_busy(true);
        let result = self.fill_envelope();
        self.shared.set_busy(false);
        match result {
            Ok(status) => status,
            Err(err) => {
                log::warn!("offload decode failed: {err}");
                self.shared.latch_fatal(err);
                WorkerStatus::Halted
            }
        }
    }

    /// Step until no further envelope can be completed. Returns envelopes produced.
    pub fn process(&mut self) -> usize {
        let mut produced = 0;
        while self.step() == WorkerStatus::Produced {
            produced += 1;
        }
        produced
    }

    /// Thread body: process on every kick until told to shut down.
    pub fn run(mut self, control: Receiver<WorkerMessage>, ack: Sender<()>) {
        log::debug!("offload decoder started");
        while let Ok(message) = control.recv() {
            match message {
                WorkerMessage::Process => {
                    self.process();
                }
                WorkerMessage::Shutdown => break,
            }
        }
        if ack.send(()).is_err() {
            log::debug!("feeder went away before shutdown was acknowledged");
        }
        log::debug!("offload decoder stopped");
    }

    fn fill_envelope(&mut self) -> std::result::Result<WorkerStatus, FatalError> {
        let epoch = self.shared.epoch();
        let frame_bytes = self.layout.frame_bytes;
        let mut env = match self.working.take() {
            Some(env) => env,
            None => match self.ends.free.pop() {
                Some(env) => env,
                None => return Ok(WorkerStatus::OutputBusy),
            },
        };
        if env.epoch != epoch {
            env.recycle(epoch);
        }
        if env.capacity() != self.layout.ring.tick_bytes {
            return Err(FatalError::MalformedEnvelope(format!(
                "output envelope holds {} bytes, tick is {}",
                env.capacity(),
                self.layout.ring.tick_bytes
            )));
        }

        while !env.is_full() {
            let Some(input) = self.ends.input.pop() else {
                self.working = Some(env);
                return Ok(WorkerStatus::InputStarved);
            };
            let frame_idx = self.shared.mark_consumed();
            if input.epoch != epoch {
                log::trace!(
                    "dropping stale frame seq {} from epoch {}",
                    input.info.identity.sequence_number,
                    input.epoch
                );
                continue;
            }
            if input.frame.is_empty() {
                return Err(FatalError::MalformedEnvelope("empty input frame".into()));
            }

            let produced = {
                let mut engine = self
                    .engine
                    .lock()
                    .map_err(|_| FatalError::Engine("engine lock poisoned".into()))?;
                engine
                    .decode_frame(&mut self.scratch, &input.frame.data)
                    .map_err(|err| match err {
                        LhdcError::Fatal(fatal) => fatal,
                        other => FatalError::Engine(other.to_string()),
                    })?
            };
            if produced != frame_bytes {
                return Err(FatalError::EngineOutput {
                    produced,
                    frame_bytes,
                });
            }

            env.pcm.extend_from_slice(&self.scratch[..produced]);
            env.info = Some(input.info);
            env.decoded_frames += 1;
            env.frame_samples = self.layout.samples_per_frame;
            env.frame_idx = frame_idx;
        }

        if env.pcm.len() % frame_bytes != 0 {
            return Err(FatalError::DecodeStepMisaligned {
                accumulated: env.pcm.len(),
                frame_bytes,
            });
        }
        if let Err(env) = self.ends.output.push(env) {
            self.working = Some(env);
            return Err(FatalError::MalformedEnvelope("output ring overflow".into()));
        }
        Ok(WorkerStatus::Produced)
    }
}

/// Offload path with its decoder running on a dedicated thread
pub struct OffloadDecoder {
    feeder: OffloadFeeder,
    control: Sender<WorkerMessage>,
    ack: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl OffloadDecoder {
    pub fn spawn(layout: OffloadLayout, engine: SharedEngine) -> Result<Self> {
        let (mut feeder, worker) = offload_pair(layout, engine)?;
        let (control_tx, control_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        feeder.kick = Some(control_tx.clone());

        let handle = thread::Builder::new()
            .name("lhdc-offload".into())
            .spawn(move || worker.run(control_rx, ack_tx))
            .map_err(|e| LhdcError::InvalidConfig(format!("cannot start offload decoder: {e}")))?;

        Ok(Self {
            feeder,
            control: control_tx,
            ack: ack_rx,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> OffloadState {
        self.feeder.state()
    }

    pub fn tick_bytes(&self) -> usize {
        self.feeder.layout().ring.tick_bytes
    }

    pub fn in_flight(&self) -> u64 {
        self.feeder.in_flight()
    }

    pub fn reset_requested(&self) -> bool {
        self.feeder.reset_requested()
    }

    pub fn reset_frames(&mut self) -> Result<()> {
        self.feeder.reset_frames()
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.feeder.set_channel_mode(mode);
    }

    pub fn decode(
        &mut self,
        out: &mut [u8],
        queue: &mut PendingFrameQueue,
        last_frame: &LastFramePublisher,
    ) -> Result<TickOutput> {
        if !self.feeder.state.is_active() {
            return Err(LhdcError::InvalidState);
        }
        self.feeder.decode(out, queue, last_frame)
    }

    /// Stop the decoder thread and wait until it no longer touches the rings.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.feeder.kick = None;
        if self.control.send(WorkerMessage::Shutdown).is_ok() && self.ack.recv().is_err() {
            log::warn!("offload decoder exited without acknowledging shutdown");
        }
        if handle.join().is_err() {
            log::warn!("offload decoder thread panicked");
        }
        self.feeder.state = self.feeder.state.on_event(OffloadEvent::Shutdown);
        log::debug!("offload decoder torn down");
    }
}

impl Drop for OffloadDecoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
