//! Single-slot mailbox between the compositor callback and synchronous capture calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::FrameTiming;

struct Slot<T> {
    value: Option<T>,
    generation: u64,
}

/// Holds only the newest published value.
///
/// The lock covers a swap or a clone and nothing else, so a slow consumer never stalls the
/// producer. Replaced values are dropped after the lock is released.
pub struct LatestFrame<T> {
    slot: Mutex<Slot<T>>,
    fresh: AtomicBool,
}

impl<T> Default for LatestFrame<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestFrame<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                generation: 0,
            }),
            fresh: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the held value and mark it fresh. Returns the new generation.
    pub fn publish(&self, value: T) -> u64 {
        let (previous, generation) = {
            let mut slot = self.lock();
            slot.generation += 1;
            let previous = slot.value.replace(value);
            self.fresh.store(true, Ordering::Release);
            (previous, slot.generation)
        };
        drop(previous);
        generation
    }

    /// Whether a value arrived since the last [`take_latest`](Self::take_latest).
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    pub fn has_value(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Poll for a fresh value for at most `timing.wait`. Returns whether one was seen.
    pub fn wait_fresh(&self, timing: FrameTiming) -> bool {
        let deadline = Instant::now() + timing.wait;
        loop {
            if self.is_fresh() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(timing.poll.min(deadline - now));
        }
    }

    /// Drop the held value, if any.
    pub fn clear(&self) {
        let previous = {
            let mut slot = self.lock();
            self.fresh.store(false, Ordering::Release);
            slot.value.take()
        };
        drop(previous);
    }
}

impl<T: Clone> LatestFrame<T> {
    /// A reference to the newest value and its generation; clears the fresh flag.
    ///
    /// The value stays in the slot, so later calls return it again until a newer one arrives.
    pub fn take_latest(&self) -> Option<(T, u64)> {
        let slot = self.lock();
        let value = slot.value.clone()?;
        self.fresh.store(false, Ordering::Release);
        Some((value, slot.generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn timing(wait_ms: u64) -> FrameTiming {
        FrameTiming {
            wait: Duration::from_millis(wait_ms),
            poll: Duration::from_millis(2),
        }
    }

    #[test]
    fn empty_mailbox_yields_nothing() {
        let mailbox = LatestFrame::<u32>::new();
        assert!(!mailbox.is_fresh());
        assert!(mailbox.take_latest().is_none());
    }

    #[test]
    fn newer_value_replaces_older() {
        let mailbox = LatestFrame::new();
        mailbox.publish("first");
        mailbox.publish("second");
        assert_eq!(mailbox.take_latest(), Some(("second", 2)));
    }

    #[test]
    fn take_clears_fresh_but_keeps_value() {
        let mailbox = LatestFrame::new();
        mailbox.publish(7);
        assert!(mailbox.is_fresh());
        assert_eq!(mailbox.take_latest(), Some((7, 1)));
        assert!(!mailbox.is_fresh());
        assert_eq!(mailbox.take_latest(), Some((7, 1)));
    }

    #[test]
    fn consecutive_takes_differ_when_a_frame_arrives_between() {
        let mailbox = LatestFrame::new();
        mailbox.publish(Arc::new([0u8; 4]));
        let (first, first_gen) = mailbox.take_latest().unwrap();
        mailbox.publish(Arc::new([1u8; 4]));
        let (second, second_gen) = mailbox.take_latest().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second_gen > first_gen);
    }

    #[test]
    fn replaced_value_is_released() {
        let mailbox = LatestFrame::new();
        let first = Arc::new(1);
        mailbox.publish(first.clone());
        assert_eq!(Arc::strong_count(&first), 2);
        mailbox.publish(Arc::new(2));
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn wait_is_bounded_without_producer() {
        let mailbox = LatestFrame::<u8>::new();
        let started = Instant::now();
        assert!(!mailbox.wait_fresh(timing(30)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn wait_returns_when_producer_publishes() {
        let mailbox = Arc::new(LatestFrame::new());
        let producer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                mailbox.publish(42u32);
            })
        };
        assert!(mailbox.wait_fresh(timing(2000)));
        producer.join().unwrap();
        assert_eq!(mailbox.take_latest(), Some((42, 1)));
    }

    #[test]
    fn clear_drops_value() {
        let mailbox = LatestFrame::new();
        mailbox.publish(1);
        mailbox.clear();
        assert!(!mailbox.has_value());
        assert!(!mailbox.is_fresh());
        mailbox.clear();
    }
}
