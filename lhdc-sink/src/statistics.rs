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

/// Q14 fixed-point ratio helpers.
///
/// Rates are stored as `ratio × 2¹⁴` so they serialize as small integers and
/// compare identically on every platform.
pub mod q14 {
    /// Q14 scale factor: 2^14 = 16384
    pub const SCALE: f64 = 16384.0;

    /// Convert Q14 integer to floating point ratio
    ///
    /// # Examples
    /// ```rust
    /// # use lhdc_sink::statistics::q14;
    /// assert_eq!(q14::to_float(8192), 0.5);
    /// ```
    #[inline]
    pub fn to_float(q14_value: u16) -> f64 {
        q14_value as f64 / SCALE
    }

    /// Convert floating point ratio to Q14 integer, clamped to [0.0, 1.0]
    ///
    /// # Examples
    /// ```rust
    /// # use lhdc_sink::statistics::q14;
    /// assert_eq!(q14::from_float(0.25), 4096);
    /// assert_eq!(q14::from_float(2.0), 16384);
    /// ```
    #[inline]
    pub fn from_float(ratio: f64) -> u16 {
        ((ratio * SCALE).min(SCALE).max(0.0)) as u16
    }
}

use serde::{Deserialize, Serialize};
use web_time::{Duration, Instant};

/// Length of the bitrate measurement window
pub const BITRATE_WINDOW: Duration = Duration::from_millis(1000);

/// Receive-side statistics for one stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveStatistics {
    /// Transport packets handed to the reassembler
    pub packets_received: u64,
    /// Packets the continuity check found missing
    pub packets_lost: u64,
    /// Fraction of packets lost (Q14 format)
    pub loss_rate: u16,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Bitrate over the last complete window, in kbit/s
    pub bitrate_kbps: u32,
    /// Frames appended to the pending queue
    pub frames_queued: u64,
    /// Packets cut short by the MTU limiter
    pub mtu_rejections: u64,
    /// Frames decoded into PCM
    pub frames_decoded: u64,
    /// Output ticks that found no frame
    pub cache_underflows: u64,
    /// Output ticks filled with silence while the offload decoder caught up
    pub silent_ticks: u64,
    /// Frames dropped by synchronization, trimming or drift correction
    pub frames_discarded: u64,
    /// Filler frames inserted by drift correction
    pub drift_fillers_inserted: u64,
}

/// Statistics calculator and tracker
#[derive(Debug)]
pub struct StatisticsCalculator {
    stats: ReceiveStatistics,
    window_start: Option<Instant>,
    window_bytes: u64,
}

impl Default for StatisticsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCalculator {
    pub fn new() -> Self {
        Self {
            stats: ReceiveStatistics::default(),
            window_start: None,
            window_bytes: 0,
        }
    }

    /// Record a transport packet's payload size.
    pub fn packet_received(&mut self, payload_bytes: usize) {
        self.packet_received_at(payload_bytes, Instant::now());
    }

    /// Record a transport packet's payload size observed at `now`.
    pub fn packet_received_at(&mut self, payload_bytes: usize, now: Instant) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += payload_bytes as u64;
        self.window_bytes += payload_bytes as u64;

        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= BITRATE_WINDOW {
            let elapsed_ms = elapsed.as_millis().max(1) as f64;
            self.stats.bitrate_kbps = (self.window_bytes as f64 * 8.0 / elapsed_ms) as u32;
            log::debug!(
                "received {} bytes in {elapsed_ms} ms: {} kbps",
                self.window_bytes,
                self.stats.bitrate_kbps
            );
            self.window_start = Some(now);
            self.window_bytes = 0;
        }
        self.update_loss_rate();
    }

    /// Record packets missing from the on-wire sequence.
    pub fn packets_lost(&mut self, count: u64) {
        self.stats.packets_lost += count;
        self.update_loss_rate();
    }

    pub fn frames_queued(&mut self, count: u64) {
        self.stats.frames_queued += count;
    }

    pub fn mtu_rejection(&mut self) {
        self.stats.mtu_rejections += 1;
    }

    pub fn frame_decoded(&mut self, count: u64) {
        self.stats.frames_decoded += count;
    }

    pub fn cache_underflow(&mut self) {
        self.stats.cache_underflows += 1;
    }

    pub fn silent_tick(&mut self) {
        self.stats.silent_ticks += 1;
    }

    pub fn frames_discarded(&mut self, count: u64) {
        self.stats.frames_discarded += count;
    }

    pub fn drift_filler_inserted(&mut self) {
        self.stats.drift_fillers_inserted += 1;
    }

    pub fn statistics(&self) -> &ReceiveStatistics {
        &self.stats
    }

    /// Reset all counters (e.g. on stream reconfiguration)
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn update_loss_rate(&mut self) {
        let expected = self.stats.packets_received + self.stats.packets_lost;
        if expected > 0 {
            self.stats.loss_rate =
                q14::from_float(self.stats.packets_lost as f64 / expected as f64);
        }
    }
}
