//! Delay Scheduler
//!
//! The anti-fingerprinting engine. Captured non-motion events are appended
//! to a FIFO with a release time drawn uniformly at random, bounded so that
//! release order always matches admission order and no event waits longer
//! than `max_delay_ms`. Draining re-emits events whose release time has
//! arrived, decorrelating the output timing from the physical keystroke
//! timing an observer could fingerprint.
//!
//! Pointer motion is deliberately absent from the packet type: motion
//! latency would degrade usability and motion timing is not the channel of
//! interest, so motion mutates the cursor immediately and is never queued.

use std::collections::VecDeque;

use crate::entropy::{EntropySource, Result};

/// Physical origin of a scroll event, forwarded so the compositor can keep
/// its kinetic-scroll heuristics intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollSource {
    /// Detented mouse wheel
    Wheel,
    /// Touchpad two-finger scroll
    Finger,
    /// Continuous device (trackpoint, wheel without detents)
    Continuous,
}

impl ScrollSource {
    /// Wire value of the matching wl_pointer/zwlr axis source.
    pub fn to_raw(self) -> u32 {
        match self {
            ScrollSource::Wheel => 0,
            ScrollSource::Finger => 1,
            ScrollSource::Continuous => 2,
        }
    }
}

/// Payload of one delayable event. Raw codes and values are preserved
/// verbatim for re-emission.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    /// Pointer button transition, evdev button code
    Button {
        /// evdev code (BTN_LEFT = 272, ...)
        button: u32,
        /// true on press, false on release
        pressed: bool,
    },

    /// Scroll motion on one or both axes
    Scroll {
        /// Physical source of the scroll
        source: ScrollSource,
        /// Horizontal axis value, if the event carried that axis
        horizontal: Option<f64>,
        /// Vertical axis value, if the event carried that axis
        vertical: Option<f64>,
    },

    /// Keyboard key transition, evdev keycode
    Key {
        /// evdev keycode (KEY_A = 30, ...)
        key: u32,
        /// true on press, false on release
        pressed: bool,
    },
}

/// One admitted event, stamped with its release time.
#[derive(Debug, Clone)]
pub struct InputPacket {
    /// Event payload, re-emitted verbatim at release
    pub payload: PacketPayload,
    /// Monotonic millisecond timestamp at which this packet may be emitted
    pub release_ms: u64,
}

/// FIFO of delayed packets with monotonically non-decreasing release times.
pub struct DelayScheduler {
    queue: VecDeque<InputPacket>,
    prev_release_ms: u64,
    max_delay_ms: u64,
}

impl DelayScheduler {
    /// Create a scheduler with the given delay bound.
    pub fn new(max_delay_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            prev_release_ms: 0,
            max_delay_ms,
        }
    }

    /// Admit a packet at monotonic time `now_ms`, drawing its release time.
    ///
    /// The lower bound of the draw is `prev_release - now` clamped to
    /// `[0, max_delay_ms]`: the first term forbids reordering past the most
    /// recently admitted packet, the cap keeps the interval non-empty.
    /// Returns the release time assigned to the packet.
    pub fn admit(
        &mut self,
        payload: PacketPayload,
        now_ms: u64,
        entropy: &mut EntropySource,
    ) -> Result<u64> {
        let lower = self
            .prev_release_ms
            .saturating_sub(now_ms)
            .min(self.max_delay_ms);
        let delay = entropy.uniform_in_closed_interval(lower, self.max_delay_ms)?;
        let release_ms = now_ms + delay;

        self.queue.push_back(InputPacket {
            payload,
            release_ms,
        });
        self.prev_release_ms = release_ms;
        Ok(release_ms)
    }

    /// Release time of the head packet, or `None` when the queue is empty.
    pub fn next_release(&self) -> Option<u64> {
        self.queue.front().map(|packet| packet.release_ms)
    }

    /// Remove every packet whose release time has arrived, in queue order,
    /// handing each to `emit`. Equal release times preserve admit order.
    pub fn drain_ready<F: FnMut(InputPacket)>(&mut self, now_ms: u64, mut emit: F) {
        while let Some(head) = self.queue.front() {
            if head.release_ms > now_ms {
                break;
            }
            let packet = self.queue.pop_front().expect("head checked above");
            emit(packet);
        }
    }

    /// Number of packets waiting for release.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when no packet is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: u32, pressed: bool) -> PacketPayload {
        PacketPayload::Key { key: code, pressed }
    }

    #[test]
    fn test_release_times_are_monotone() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        let mut previous = 0;
        for tick in 0..500 {
            let release = scheduler.admit(key(30, tick % 2 == 0), tick, &mut entropy).unwrap();
            assert!(release >= previous, "release {release} precedes {previous}");
            previous = release;
        }
    }

    #[test]
    fn test_release_times_are_bounded() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        // Widely spaced admissions: the lower clamp is zero, so the delay
        // must fall in [0, max] relative to admission time.
        for step in 0..200 {
            let now = step * 1_000;
            let release = scheduler.admit(key(30, true), now, &mut entropy).unwrap();
            assert!(release >= now);
            assert!(release <= now + 100);
        }
    }

    #[test]
    fn test_burst_admissions_stay_bounded() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        // All admitted at the same instant: ordering still holds and no
        // packet may exceed now + max even when prev_release pins the lower
        // bound near the cap.
        let mut previous = 0;
        for _ in 0..200 {
            let release = scheduler.admit(key(48, true), 5, &mut entropy).unwrap();
            assert!(release >= previous);
            assert!(release <= 105);
            previous = release;
        }
    }

    #[test]
    fn test_drain_preserves_admit_order() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        for code in 0..50 {
            scheduler.admit(key(code, true), 0, &mut entropy).unwrap();
        }

        let mut drained = Vec::new();
        scheduler.drain_ready(1_000, |packet| drained.push(packet));
        assert_eq!(drained.len(), 50);
        for (index, packet) in drained.iter().enumerate() {
            match packet.payload {
                PacketPayload::Key { key, .. } => assert_eq!(key, index as u32),
                _ => panic!("unexpected payload"),
            }
        }
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_drain_stops_at_unreleased_head() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        scheduler.admit(key(30, true), 0, &mut entropy).unwrap();
        scheduler.admit(key(30, false), 0, &mut entropy).unwrap();

        let mut drained = Vec::new();
        scheduler.drain_ready(0, |p| drained.push(p));
        // Only packets that happened to draw a zero delay may appear.
        for packet in &drained {
            assert_eq!(packet.release_ms, 0);
        }

        drained.clear();
        scheduler.drain_ready(200, |p| drained.push(p));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_keystroke_press_release_pair() {
        // A press admitted at t=0 and its release at t=5 must drain in
        // order, each within [admit, admit + max].
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);

        let press = scheduler.admit(key(30, true), 0, &mut entropy).unwrap();
        let release = scheduler.admit(key(30, false), 5, &mut entropy).unwrap();
        assert!(press <= release);
        assert!(press <= 100);
        assert!(release <= 105);

        let mut drained = Vec::new();
        scheduler.drain_ready(200, |packet| drained.push(packet));
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0].payload,
            PacketPayload::Key { key: 30, pressed: true }
        ));
        assert!(matches!(
            drained[1].payload,
            PacketPayload::Key { key: 30, pressed: false }
        ));
    }

    #[test]
    fn test_next_release_tracks_head() {
        let mut entropy = EntropySource::open().unwrap();
        let mut scheduler = DelayScheduler::new(100);
        assert_eq!(scheduler.next_release(), None);

        let first = scheduler.admit(key(30, true), 0, &mut entropy).unwrap();
        scheduler.admit(key(30, false), 0, &mut entropy).unwrap();
        assert_eq!(scheduler.next_release(), Some(first));
    }
}
