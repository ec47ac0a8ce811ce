//! Cell ring buffer with per-cell locking for producer/consumer handoff
//!
//! A fixed ring of fixed-size cells, each guarded by its own mutex and
//! condition variable, plus a monotonically advancing write/read cursor
//! pair. Per-cell locks let the writer fill cell k+1 while the reader still
//! holds cell k, so a latency-sensitive audio callback never blocks on an
//! unrelated cell.
//!
//! Intended for one writer thread and one reader thread per ring. Cells are
//! handed out as RAII guards that release the lock and advance the cursor on
//! every exit path.
//!
//! When the writer catches up to a cell the reader has not consumed, the
//! oldest unread cell is dropped instead of blocking the producer: a live
//! audio monitor favors freshness over completeness.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Slot<T> {
    data: Mutex<Box<[T]>>,
    ready: Condvar,
}

/// Fixed ring of individually lockable cells
pub struct RingBuffer<T> {
    slots: Vec<Slot<T>>,
    /// Total cells written; cell index is this modulo the ring size
    write_pos: AtomicU64,
    /// Total cells consumed (or dropped on overflow)
    read_pos: AtomicU64,
    cell_len: usize,
}

impl<T: Clone + Default> RingBuffer<T> {
    /// Create a ring of `cell_count` cells, each `cell_len` elements long
    pub fn new(cell_count: usize, cell_len: usize) -> Self {
        assert!(cell_count > 0, "ring must have at least one cell");
        assert!(cell_len > 0, "cells must not be empty");
        let slots = (0..cell_count)
            .map(|_| Slot {
                data: Mutex::new(vec![T::default(); cell_len].into_boxed_slice()),
                ready: Condvar::new(),
            })
            .collect();
        Self {
            slots,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            cell_len,
        }
    }

    /// Number of cells in the ring
    pub fn cell_count(&self) -> usize {
        self.slots.len()
    }

    /// Elements per cell
    pub fn cell_len(&self) -> usize {
        self.cell_len
    }

    /// Cells written but not yet consumed
    pub fn pending(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.saturating_sub(r) as usize
    }

    /// Lock the cell at the write cursor for filling.
    ///
    /// Does not block on ring fullness: if every cell holds unread data, the
    /// oldest unread cell is dropped so the producer can proceed. Only
    /// blocks on the cell's own lock, held at most briefly by the reader of
    /// that same cell.
    pub fn lock_cell_to_write(&self) -> WriteCell<'_, T> {
        let seq = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        if seq.saturating_sub(read) >= self.slots.len() as u64 {
            // Lossy overflow: force-advance the reader past the oldest
            // unread cell. A failed exchange means the reader advanced
            // itself in the meantime.
            if self
                .read_pos
                .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                tracing::trace!(dropped_cell = read, "ring overflow, dropped oldest unread cell");
            }
        }
        let slot = &self.slots[(seq % self.slots.len() as u64) as usize];
        let guard = lock_slot(&slot.data);
        WriteCell {
            ring: self,
            slot,
            seq,
            guard,
        }
    }

    /// Lock the cell at the read cursor, blocking until it has been written.
    pub fn lock_cell_to_read(&self) -> ReadCell<'_, T> {
        let seq = self.read_pos.load(Ordering::Relaxed);
        let slot = &self.slots[(seq % self.slots.len() as u64) as usize];
        let mut guard = lock_slot(&slot.data);
        while self.write_pos.load(Ordering::Acquire) <= seq {
            guard = slot
                .ready
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
        ReadCell {
            ring: self,
            seq,
            guard,
        }
    }

    /// Like [`Self::lock_cell_to_read`] but gives up after `timeout`.
    pub fn lock_cell_to_read_timeout(&self, timeout: Duration) -> Option<ReadCell<'_, T>> {
        let deadline = Instant::now() + timeout;
        let seq = self.read_pos.load(Ordering::Relaxed);
        let slot = &self.slots[(seq % self.slots.len() as u64) as usize];
        let mut guard = lock_slot(&slot.data);
        while self.write_pos.load(Ordering::Acquire) <= seq {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _timed_out) = slot
                .ready
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
        Some(ReadCell {
            ring: self,
            seq,
            guard,
        })
    }
}

fn lock_slot<'a, T>(mutex: &'a Mutex<Box<[T]>>) -> MutexGuard<'a, Box<[T]>> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive view of a cell being filled; publishing happens on drop.
pub struct WriteCell<'a, T> {
    ring: &'a RingBuffer<T>,
    slot: &'a Slot<T>,
    seq: u64,
    guard: MutexGuard<'a, Box<[T]>>,
}

impl<T> WriteCell<'_, T> {
    /// Ring index of this cell
    pub fn index(&self) -> usize {
        (self.seq % self.ring.slots.len() as u64) as usize
    }
}

impl<T> Deref for WriteCell<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.guard
    }
}

impl<T> DerefMut for WriteCell<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.guard
    }
}

impl<T> Drop for WriteCell<'_, T> {
    fn drop(&mut self) {
        // Publish while still holding the cell lock so a reader waiting on
        // this cell's condvar cannot miss the wakeup; the lock itself is
        // released when the guard field drops right after this body.
        self.ring.write_pos.store(self.seq + 1, Ordering::Release);
        self.slot.ready.notify_one();
    }
}

/// Shared view of a written cell; the read cursor advances on drop.
pub struct ReadCell<'a, T> {
    ring: &'a RingBuffer<T>,
    seq: u64,
    guard: MutexGuard<'a, Box<[T]>>,
}

impl<T> ReadCell<'_, T> {
    /// Ring index of this cell
    pub fn index(&self) -> usize {
        (self.seq % self.ring.slots.len() as u64) as usize
    }
}

impl<T> Deref for ReadCell<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.guard
    }
}

impl<T> Drop for ReadCell<'_, T> {
    fn drop(&mut self) {
        // A failed exchange means the writer lapped us and already dropped
        // this cell; do not advance twice.
        let _ = self.ring.read_pos.compare_exchange(
            self.seq,
            self.seq + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}
