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

//! Bounded single-producer/single-consumer rings shared by the feeder and the
//! decoder context, plus the few counters both sides observe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use super::messages::{InEnvelope, OutEnvelope};
use crate::FatalError;

/// Sizes of the rings and envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Input envelopes the feeder may have in flight
    pub input_capacity: usize,
    /// Output envelopes in circulation
    pub output_envelopes: usize,
    /// PCM bytes per output envelope (one output tick)
    pub tick_bytes: usize,
}

/// Counters and error latch visible to both contexts
#[derive(Debug, Default)]
pub struct SharedState {
    epoch: AtomicU64,
    consumed: AtomicU64,
    busy: AtomicBool,
    fatal: Mutex<Option<FatalError>>,
}

impl SharedState {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start a new reset generation; envelopes tagged earlier are stale.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Input envelopes taken off the ring by the decoder, stale ones included
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_consumed(&self) -> u64 {
        self.consumed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True while the decoder side is inside a step and may still publish output.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub(crate) fn latch_fatal(&self, err: FatalError) {
        let mut slot = match self.fatal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<FatalError> {
        match self.fatal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub(crate) fn has_fatal(&self) -> bool {
        match self.fatal.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

/// Ring ends owned by the feeder context
pub struct FeederEnds {
    pub input: HeapProducer<InEnvelope>,
    pub output: HeapConsumer<OutEnvelope>,
    pub free: HeapProducer<OutEnvelope>,
}

/// Ring ends owned by the decoder context
pub struct WorkerEnds {
    pub input: HeapConsumer<InEnvelope>,
    pub output: HeapProducer<OutEnvelope>,
    pub free: HeapConsumer<OutEnvelope>,
}

/// Allocate the rings and seed the free ring with empty output envelopes.
pub fn envelope_rings(geometry: RingGeometry) -> (FeederEnds, WorkerEnds) {
    let (input_tx, input_rx) = HeapRb::<InEnvelope>::new(geometry.input_capacity).split();
    let (output_tx, output_rx) = HeapRb::<OutEnvelope>::new(geometry.output_envelopes).split();
    let (mut free_tx, free_rx) = HeapRb::<OutEnvelope>::new(geometry.output_envelopes).split();

    for _ in 0..geometry.output_envelopes {
        if free_tx.push(OutEnvelope::new(geometry.tick_bytes)).is_err() {
            break;
        }
    }

    (
        FeederEnds {
            input: input_tx,
            output: output_rx,
            free: free_tx,
        },
        WorkerEnds {
            input: input_rx,
            output: output_tx,
            free: free_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_ring_is_seeded() {
        let geometry = RingGeometry {
            input_capacity: 16,
            output_envelopes: 3,
            tick_bytes: 64,
        };
        let (feeder, mut worker) = envelope_rings(geometry);
        assert!(feeder.free.is_full());
        assert_eq!(worker.free.len(), 3);
        let env = worker.free.pop().unwrap();
        assert_eq!(env.capacity(), 64);
        assert!(worker.input.is_empty());
        assert!(feeder.output.is_empty());
    }

    #[test]
    fn test_epoch_and_fatal_latch() {
        let shared = SharedState::default();
        assert_eq!(shared.epoch(), 0);
        assert_eq!(shared.bump_epoch(), 1);
        assert_eq!(shared.mark_consumed(), 1);
        assert_eq!(shared.consumed(), 1);

        shared.latch_fatal(FatalError::CombinedStereoUnsupported);
        shared.latch_fatal(FatalError::Engine("second".into()));
        assert!(shared.has_fatal());
        assert_eq!(
            shared.take_fatal(),
            Some(FatalError::CombinedStereoUnsupported)
        );
        assert!(shared.take_fatal().is_none());
    }
}
