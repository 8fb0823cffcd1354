//! Device to host timestamp reconciliation.
//!
//! Device counters wrap at 2^16, 2^24 or 2^32 microseconds depending on the
//! timestamp mode and drift against the host clock. The reconciler unwraps them
//! into a host timeline that never decreases, using one of the policies in
//! [`ClockMode`].
//!
//! Only a single wrap between two consecutive events can be detected. If the
//! device counter wraps more than once between two events the elapsed time is
//! underestimated; the true wrap count cannot be recovered from the stream.

use crate::types::{ClockMode, RawEvent, TimestampMode};
use tracing::debug;

/// Time elapsed on the device from `t1` to `t2`, assuming at most one wrap.
#[inline]
pub fn timestamp_delta(t1: u64, t2: u64, wrap: u64) -> u64 {
    if t2 >= t1 {
        t2 - t1
    } else {
        (wrap + t2).saturating_sub(t1)
    }
}

/// Sum of device deltas from `last_device` across the batch.
fn sum_deltas(events: &[RawEvent], mut last_device: u64, wrap: u64) -> u64 {
    let mut sum = 0u64;
    for event in events {
        let t = event.device_timestamp as u64;
        sum += timestamp_delta(last_device, t, wrap);
        last_device = t;
    }
    sum
}

/// Counters for the reconciler's self-healing paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Device counter wraps detected
    pub wraps: u64,
    /// Anchored batches without any device time progress
    pub degenerate_batches: u64,
}

/// Per-source reconciliation state.
#[derive(Debug)]
pub struct TimestampReconciler {
    mode: ClockMode,
    wrap_limit: u64,
    // None until the first event of the session
    last_device: Option<u64>,
    last_host: u64,
    stats: ReconcileStats,
}

impl TimestampReconciler {
    /// Creates a reconciler for the device's timestamp width.
    pub fn new(mode: ClockMode, timestamps: TimestampMode) -> Self {
        Self {
            mode,
            wrap_limit: timestamps.wrap_limit(),
            last_device: None,
            last_host: 0,
            stats: ReconcileStats::default(),
        }
    }

    /// The active policy.
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Device time of the last reconciled event, if any.
    pub fn last_device_time(&self) -> Option<u64> {
        self.last_device
    }

    /// Host time assigned to the last reconciled event.
    pub fn last_host_time(&self) -> u64 {
        self.last_host
    }

    /// Counters accumulated since creation.
    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Forgets the session so that the next event seeds the timeline again.
    pub fn reset(&mut self) {
        self.last_device = None;
        self.last_host = 0;
    }

    /// Assigns host timestamps to a batch of raw events.
    ///
    /// `host_now` is the host clock sample (microseconds since the stream
    /// started) taken when the batch was read. It is only used by
    /// [`ClockMode::SystemTime`]; without it that policy falls back to
    /// incremental accumulation.
    pub fn reconcile(&mut self, events: &[RawEvent], host_now: Option<u64>) -> Vec<u64> {
        let mut host = Vec::with_capacity(events.len());
        let Some(first) = events.first() else {
            return host;
        };

        // The first event of a session defines the origin of the host timeline
        let (last_device, last_host) = match self.last_device {
            Some(t) => (t, self.last_host),
            None => (first.device_timestamp as u64, 0),
        };

        match (self.mode, host_now) {
            (ClockMode::Raw, _) => {
                host.extend(events.iter().map(|e| e.device_timestamp as u64));
            }
            (ClockMode::SystemTime, Some(now)) => {
                self.reconcile_anchored(events, last_device, last_host, now, &mut host);
            }
            (ClockMode::Incremental, _) | (ClockMode::SystemTime, None) => {
                self.reconcile_incremental(events, last_device, last_host, &mut host);
            }
        }

        if let (Some(last_event), Some(&last_time)) = (events.last(), host.last()) {
            self.last_device = Some(last_event.device_timestamp as u64);
            self.last_host = last_time;
        }
        host
    }

    fn reconcile_incremental(
        &mut self,
        events: &[RawEvent],
        mut last_device: u64,
        mut last_host: u64,
        host: &mut Vec<u64>,
    ) {
        for event in events {
            let t = event.device_timestamp as u64;
            if t < last_device {
                self.stats.wraps += 1;
                debug!(from = last_device, to = t, "device timestamp wrapped");
            }
            last_host += timestamp_delta(last_device, t, self.wrap_limit);
            last_device = t;
            host.push(last_host);
        }
    }

    /// Spreads the host time elapsed since the last batch over the batch.
    ///
    /// The last event lands exactly on `now`. Earlier events are placed by
    /// walking backwards and apportioning each device delta scaled by
    /// host/device elapsed time, carrying the integer remainder so that the
    /// apportioned deltas never exceed the host budget.
    fn reconcile_anchored(
        &mut self,
        events: &[RawEvent],
        last_device: u64,
        last_host: u64,
        now: u64,
        host: &mut Vec<u64>,
    ) {
        let now = now.max(last_host);
        let wrap = self.wrap_limit;
        if (events[0].device_timestamp as u64) < last_device {
            self.stats.wraps += 1;
        }
        let sum_device = sum_deltas(events, last_device, wrap);
        let sum_host = now - last_host;

        host.resize(events.len(), now);
        if sum_device == 0 {
            self.stats.degenerate_batches += 1;
            debug!(
                events = events.len(),
                "no device time progress in batch, using host clock sample"
            );
            return;
        }

        let mut remainder: u128 = 0;
        let mut current = now;
        for i in (0..events.len() - 1).rev() {
            let t = events[i].device_timestamp as u64;
            let next = events[i + 1].device_timestamp as u64;
            if next < t {
                self.stats.wraps += 1;
            }
            let scaled =
                remainder + timestamp_delta(t, next, wrap) as u128 * sum_host as u128;
            remainder = scaled % sum_device as u128;
            // Bounded by sum_host since the partial device sums never exceed sum_device
            current -= (scaled / sum_device as u128) as u64;
            host[i] = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(timestamps: &[u32]) -> Vec<RawEvent> {
        timestamps
            .iter()
            .map(|&t| RawEvent::new(t, 0, 0, false))
            .collect()
    }

    #[test]
    fn test_timestamp_delta() {
        assert_eq!(timestamp_delta(10, 25, 1 << 16), 15);
        assert_eq!(timestamp_delta(65_530, 4, 1 << 16), 10);
        assert_eq!(timestamp_delta(7, 7, 1 << 16), 0);
    }

    #[test]
    fn test_incremental_seeds_at_zero() {
        let mut rec = TimestampReconciler::new(ClockMode::Incremental, TimestampMode::Bits24);
        let host = rec.reconcile(&raw(&[1000, 1010, 1035]), None);
        assert_eq!(host, vec![0, 10, 35]);
        assert_eq!(rec.last_device_time(), Some(1035));
        assert_eq!(rec.last_host_time(), 35);
    }

    #[test]
    fn test_incremental_unwraps_across_batches() {
        let mut rec = TimestampReconciler::new(ClockMode::Incremental, TimestampMode::Bits16);
        rec.reconcile(&raw(&[65_000, 65_500]), None);
        let host = rec.reconcile(&raw(&[100, 200]), None);
        // 65_500 -> 100 crosses the 16 bit wrap: 36 + 100
        assert_eq!(host, vec![636, 736]);
        assert_eq!(rec.stats().wraps, 1);
    }

    #[test]
    fn test_raw_mode_passes_through() {
        let mut rec = TimestampReconciler::new(ClockMode::Raw, TimestampMode::Bits24);
        let host = rec.reconcile(&raw(&[500, 20, 30]), Some(99));
        assert_eq!(host, vec![500, 20, 30]);
    }

    #[test]
    fn test_anchored_last_event_lands_on_clock() {
        let mut rec = TimestampReconciler::new(ClockMode::SystemTime, TimestampMode::Bits24);
        // first batch: seeded at device 100 / host 0
        let host = rec.reconcile(&raw(&[100, 110, 130, 140]), Some(80));
        assert_eq!(host.last(), Some(&80));
        // device deltas 10, 20, 10 scaled by 80/40
        assert_eq!(host, vec![0, 20, 60, 80]);
    }

    #[test]
    fn test_anchored_unwraps_16_bit_counter() {
        let mut rec = TimestampReconciler::new(ClockMode::SystemTime, TimestampMode::Bits16);
        // wrap inside the batch: deltas 100 and 56 over 1000us
        let host = rec.reconcile(&raw(&[65_400, 65_500, 20]), Some(1000));
        assert_eq!(host, vec![0, 642, 1000]);

        let host = rec.reconcile(&raw(&[33_000, 65_500]), Some(1500));
        assert_eq!(host, vec![1252, 1500]);

        // wrap between batches: 65_500 -> 100 is 136us, not a step back
        let host = rec.reconcile(&raw(&[100, 300]), Some(2000));
        assert_eq!(host, vec![1703, 2000]);
        assert_eq!(rec.stats().wraps, 2);
        assert_eq!(rec.stats().degenerate_batches, 0);
    }

    #[test]
    fn test_anchored_integer_apportionment() {
        let mut rec = TimestampReconciler::new(ClockMode::SystemTime, TimestampMode::Bits24);
        rec.reconcile(&raw(&[0]), Some(0));
        let host = rec.reconcile(&raw(&[1, 2, 3]), Some(10));
        // 10us of host time over 3us of device time, remainders carried backwards
        assert_eq!(host.last(), Some(&10));
        assert!(host.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(host, vec![4, 7, 10]);
    }

    #[test]
    fn test_anchored_degenerate_batch() {
        let mut rec = TimestampReconciler::new(ClockMode::SystemTime, TimestampMode::Bits24);
        rec.reconcile(&raw(&[50]), Some(5));
        let host = rec.reconcile(&raw(&[50, 50, 50]), Some(42));
        assert_eq!(host, vec![42, 42, 42]);
        assert_eq!(rec.stats().degenerate_batches, 2);
    }

    #[test]
    fn test_anchored_without_clock_falls_back() {
        let mut rec = TimestampReconciler::new(ClockMode::SystemTime, TimestampMode::Bits24);
        let host = rec.reconcile(&raw(&[5, 9]), None);
        assert_eq!(host, vec![0, 4]);
    }

    #[test]
    fn test_reset_reseeds() {
        let mut rec = TimestampReconciler::new(ClockMode::Incremental, TimestampMode::Bits24);
        rec.reconcile(&raw(&[10, 20]), None);
        rec.reset();
        assert_eq!(rec.reconcile(&raw(&[5000]), None), vec![0]);
    }
}
