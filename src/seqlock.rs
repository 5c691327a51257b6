//! A single-writer, many-reader sequence lock. A reader
//! never blocks a writer and a writer never blocks a reader; instead, a
//! reader detects that it raced a write and retries. One `AtomicU64`
//! counter carries the whole protocol: odd means "a write is in
//! progress", even means "stable at this sequence".

use std::sync::atomic::{AtomicU64, Ordering};

pub struct SequenceLock {
    sequence: AtomicU64,
}

impl Default for SequenceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceLock {
    pub fn new() -> Self {
        SequenceLock { sequence: AtomicU64::new(0) }
    }

    /// Marks the start of a write: bumps the counter to the next odd
    /// value. Must be paired with `end_write`.
    pub fn begin_write(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Marks the end of a write: bumps the counter again, landing back
    /// on an even value.
    pub fn end_write(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// Snapshots the current sequence for a read attempt.
    pub fn begin_read(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn is_write_locked(&self) -> bool {
        self.begin_read() % 2 == 1
    }

    /// A read started at `start` is valid only if the sequence hasn't
    /// changed since — no write began, finished, or is in progress.
    pub fn is_read_valid(&self, start: u64) -> bool {
        start % 2 == 0 && self.sequence.load(Ordering::Acquire) == start
    }

    /// Runs `read` in a retry loop: spins until a full read completes
    /// with no writer interference. `read` must be idempotent and free
    /// of externally visible side effects, since it may run more than
    /// once.
    pub fn read<T>(&self, mut read: impl FnMut() -> T) -> T {
        loop {
            let start = self.begin_read();
            if start % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = read();
            if self.is_read_valid(start) {
                return value;
            }
        }
    }

    /// Runs `write` under the lock, bumping the sequence before and
    /// after so concurrent readers can detect the race.
    pub fn write<T>(&self, write: impl FnOnce() -> T) -> T {
        self.begin_write();
        let value = write();
        self.end_write();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fresh_lock_starts_stable_at_zero() {
        let lock = SequenceLock::new();
        assert!(!lock.is_write_locked());
        assert_eq!(lock.begin_read(), 0);
    }

    #[test]
    fn write_brackets_an_odd_sequence() {
        let lock = SequenceLock::new();
        let during = lock.begin_write();
        assert_eq!(during % 2, 1);
        assert!(lock.is_write_locked());
        lock.end_write();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn read_started_during_a_write_is_invalid() {
        let lock = SequenceLock::new();
        let start = lock.begin_read();
        lock.begin_write();
        assert!(!lock.is_read_valid(start));
        lock.end_write();
    }

    #[test]
    fn concurrent_writes_eventually_produce_valid_reads() {
        let lock = Arc::new(SequenceLock::new());
        let value = Arc::new(AtomicU64::new(0));

        let writer_lock = Arc::clone(&lock);
        let writer_value = Arc::clone(&value);
        let writer = thread::spawn(move || {
            for i in 1..=100u64 {
                writer_lock.write(|| writer_value.store(i, Ordering::Relaxed));
            }
        });

        let reader_lock = Arc::clone(&lock);
        let reader_value = Arc::clone(&value);
        let observed = reader_lock.read(|| reader_value.load(Ordering::Relaxed));
        writer.join().unwrap();
        assert!(observed <= 100);
    }
}
