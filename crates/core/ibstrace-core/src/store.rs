//! Pre-allocated, append-only sample storage.
//!
//! The collector appends from interrupt context without taking any lock:
//! a slot is claimed by a compare-and-swap on the collected counter that
//! refuses to move past capacity, then the record is stored word by word
//! into the claimed slot. Capacity is a hard ceiling, so samples arriving
//! while the buffer is full are counted as dropped and discarded.
//!
//! Reads and resets happen under the coordinator lock, and only while no
//! trigger is in flight, so they never race an append.

use crate::loom_compat::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use crate::sample::{SAMPLE_SIZE, SAMPLE_WORDS, Sample};

/// One record slot. Each word is atomic so a claimed slot can be filled
/// from interrupt context without `unsafe`.
struct Slot([AtomicU64; SAMPLE_WORDS]);

impl Slot {
    fn new() -> Self {
        Self(core::array::from_fn(|_| AtomicU64::new(0)))
    }

    fn store(&self, sample: &Sample) {
        for (word, value) in self.0.iter().zip(sample.to_words()) {
            word.store(value, Ordering::Release);
        }
    }

    fn load(&self) -> Sample {
        Sample::from_words(core::array::from_fn(|i| self.0[i].load(Ordering::Acquire)))
    }

    fn zero(&self) {
        for word in &self.0 {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Fixed-capacity sample buffer with a saturating collected counter.
pub struct SampleBuffer {
    slots: Box<[Slot]>,
    collected: AtomicUsize,
    dropped: AtomicU64,
}

impl SampleBuffer {
    /// Allocates a zeroed buffer with room for `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            collected: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Maximum number of records.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of records collected since the last drain.
    pub fn sample_count(&self) -> usize {
        self.collected.load(Ordering::Acquire)
    }

    /// Number of records discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Base address of the slot array, for diagnostics.
    pub fn base_addr(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Appends `sample` at index = prior counter value.
    ///
    /// Returns `false` and leaves the counter untouched if the buffer is
    /// full. Never blocks and never allocates.
    pub fn append_sample(&self, sample: &Sample) -> bool {
        let capacity = self.slots.len();
        let mut index = self.collected.load(Ordering::Relaxed);
        loop {
            if index >= capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            match self.collected.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => index = actual,
            }
        }
        self.slots[index].store(sample);
        true
    }

    /// Reads the record at `index`, if it has been collected.
    pub fn get(&self, index: usize) -> Option<Sample> {
        (index < self.sample_count()).then(|| self.slots[index].load())
    }

    /// Copies out up to `limit` bytes worth of complete records without
    /// consuming them.
    pub fn snapshot(&self, limit: usize) -> Vec<u8> {
        let count = self.sample_count().min(limit / SAMPLE_SIZE);
        let mut out = Vec::with_capacity(count * SAMPLE_SIZE);
        for slot in &self.slots[..count] {
            out.extend_from_slice(&slot.load().to_bytes());
        }
        out
    }

    /// Zeroes every collected slot and resets the counter to zero.
    pub fn clear(&self) {
        let count = self.sample_count();
        for slot in &self.slots[..count] {
            slot.zero();
        }
        self.collected.store(0, Ordering::Release);
    }

    /// Returns up to `limit` bytes of complete records and consumes the
    /// whole buffer.
    ///
    /// A limit below one record returns nothing and leaves the buffer intact.
    pub fn drain_samples(&self, limit: usize) -> Vec<u8> {
        let out = self.snapshot(limit);
        if !out.is_empty() {
            self.clear();
        }
        out
    }

    /// Returns `true` if every slot reads as zero.
    pub fn is_zeroed(&self) -> bool {
        self.slots.iter().all(|slot| slot.load() == Sample::default())
    }
}

impl core::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("capacity", &self.capacity())
            .field("collected", &self.sample_count())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

/// Dispatch variant for the current trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Mode {
    /// Plain measurement; the program gets only the scratch page.
    #[default]
    Measure = 0,
    /// The program also gets a pointer argument and a target offset, and
    /// branch targets are latched into each record.
    Precise = 1,
}

/// The mode flag, written under the coordinator lock and read by the
/// collector from interrupt context.
#[derive(Debug, Default)]
pub struct ModeFlag(AtomicU8);

impl ModeFlag {
    /// Current mode.
    pub fn get(&self) -> Mode {
        match self.0.load(Ordering::Acquire) {
            1 => Mode::Precise,
            _ => Mode::Measure,
        }
    }

    /// Selects the mode for the next trigger.
    pub fn set(&self, mode: Mode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn sample(rip: u64) -> Sample {
        Sample { rip, ctl: 1 << 18, ..Sample::default() }
    }

    #[test]
    fn mode_flag_defaults_to_measure() {
        let flag = ModeFlag::default();
        assert_eq!(flag.get(), Mode::Measure);
        flag.set(Mode::Precise);
        assert_eq!(flag.get(), Mode::Precise);
    }

    #[test]
    fn appends_in_index_order() {
        let buf = SampleBuffer::new(8);
        for rip in 0..5 {
            assert!(buf.append_sample(&sample(rip)));
        }
        assert_eq!(buf.sample_count(), 5);
        assert_eq!(buf.get(3), Some(sample(3)));
        assert_eq!(buf.get(5), None);
    }

    #[test]
    fn ceiling_is_idempotent() {
        let buf = SampleBuffer::new(4);
        for rip in 0..4 {
            assert!(buf.append_sample(&sample(rip)));
        }
        for rip in 100..110 {
            assert!(!buf.append_sample(&sample(rip)));
        }
        assert_eq!(buf.sample_count(), 4);
        assert_eq!(buf.dropped(), 10);
        for rip in 0..4 {
            assert_eq!(buf.get(usize::try_from(rip).unwrap()), Some(sample(rip)));
        }
    }

    #[test]
    fn drain_consumes_exactly_once_and_zeroes() {
        let buf = SampleBuffer::new(4);
        buf.append_sample(&sample(0x10));
        buf.append_sample(&sample(0x20));

        let first = buf.drain_samples(usize::MAX);
        assert_eq!(Sample::parse_all(&first), vec![sample(0x10), sample(0x20)]);
        assert_eq!(buf.sample_count(), 0);
        assert!(buf.is_zeroed());

        assert!(buf.drain_samples(usize::MAX).is_empty());
    }

    #[test]
    fn drain_returns_only_complete_records() {
        let buf = SampleBuffer::new(4);
        for rip in 0..3 {
            buf.append_sample(&sample(rip));
        }
        let out = buf.drain_samples(SAMPLE_SIZE * 2 - 1);
        assert_eq!(out.len(), SAMPLE_SIZE);
        assert_eq!(buf.sample_count(), 0);
    }

    #[test]
    fn zero_limit_returns_nothing() {
        let buf = SampleBuffer::new(2);
        buf.append_sample(&sample(1));
        assert!(buf.snapshot(0).is_empty());
        assert_eq!(buf.sample_count(), 1);
    }

    #[test]
    fn drain_below_one_record_keeps_everything() {
        let buf = SampleBuffer::new(4);
        buf.append_sample(&sample(0x10));
        buf.append_sample(&sample(0x20));

        assert!(buf.drain_samples(0).is_empty());
        assert!(buf.drain_samples(SAMPLE_SIZE - 1).is_empty());
        assert_eq!(buf.sample_count(), 2);
        assert_eq!(buf.get(1), Some(sample(0x20)));

        let out = buf.drain_samples(SAMPLE_SIZE);
        assert_eq!(Sample::parse_all(&out), vec![sample(0x10)]);
        assert_eq!(buf.sample_count(), 0);
    }

    #[test]
    fn mode_flag_round_trips_both_modes() {
        let flag = ModeFlag::default();
        flag.set(Mode::Precise);
        assert_eq!(flag.get(), Mode::Precise);
        flag.set(Mode::Measure);
        assert_eq!(flag.get(), Mode::Measure);
    }

    #[test]
    fn concurrent_appends_never_exceed_capacity() {
        use std::sync::Arc;

        let buf = Arc::new(SampleBuffer::new(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        buf.append_sample(&sample(t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.sample_count(), 64);
        assert_eq!(buf.dropped(), 200 - 64);
        for i in 0..64 {
            assert_ne!(buf.get(i).unwrap().ctl, 0);
        }
    }
}
