// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fixed-capacity circular byte buffer for raw PTY output.
//!
//! The buffer is addressed by the global stream offset: the byte written
//! at offset `n` always lives in slot `n % capacity`, so no separate write
//! position is tracked. `total_written` counts every byte ever pushed,
//! which lets consumers request replay from a global offset even after
//! older data has been overwritten.

/// Smallest allowed scrollback capacity.
pub const MIN_CAPACITY: usize = 64 * 1024;
/// Largest allowed scrollback capacity.
pub const MAX_CAPACITY: usize = 64 * 1024 * 1024;
/// Capacity used when none is requested.
pub const DEFAULT_CAPACITY: usize = 10 * 1024 * 1024;

/// Clamp a requested capacity into the supported range.
pub fn clamp_capacity(requested: usize) -> usize {
    requested.clamp(MIN_CAPACITY, MAX_CAPACITY)
}

#[derive(Debug)]
pub struct Scrollback {
    buf: Vec<u8>,
    capacity: usize,
    total_written: u64,
}

impl Scrollback {
    /// Create a scrollback with the given capacity.
    ///
    /// Callers clamp user-supplied capacities via [`clamp_capacity`] first;
    /// the constructor takes the value as-is so tests can use tiny rings.
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0u8; capacity], capacity, total_written: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held; at most `capacity`.
    pub fn count(&self) -> usize {
        self.total_written.min(self.capacity as u64) as usize
    }

    /// Total bytes ever written through this buffer. Never decreases.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Ring slot of a global stream offset.
    fn slot(&self, offset: u64) -> usize {
        (offset % self.capacity as u64) as usize
    }

    /// Append data, overwriting the oldest bytes when full.
    pub fn write(&mut self, data: &[u8]) {
        // Anything beyond one full capacity would be overwritten later in
        // this same call; the cursor accounts for those bytes but they are
        // never copied.
        let skipped = data.len().saturating_sub(self.capacity);
        let tail = &data[skipped..];

        let at = self.slot(self.total_written + skipped as u64);
        let head = tail.len().min(self.capacity - at);
        self.buf[at..at + head].copy_from_slice(&tail[..head]);
        self.buf[..tail.len() - head].copy_from_slice(&tail[head..]);

        self.total_written += data.len() as u64;
    }

    /// Copy the held tail of the stream into `dst`.
    ///
    /// Returns the number of bytes copied, or `-count()` if `dst` is too
    /// small, in which case the caller grows the buffer and retries.
    /// No partial snapshot is ever emitted.
    pub fn snapshot_into(&self, dst: &mut [u8]) -> isize {
        let count = self.count();
        if dst.len() < count {
            return -(count as isize);
        }
        let oldest = self.total_written - count as u64;
        self.copy_range(oldest, &mut dst[..count]);
        count as isize
    }

    /// Copy bytes written after `cursor` into `scratch`, up to its length.
    ///
    /// Returns `(copied, ok)`. `ok` is `false` iff the requested range has
    /// already been overwritten. `(0, true)` means the reader has caught up.
    pub fn try_copy_since(&self, cursor: u64, scratch: &mut [u8]) -> (usize, bool) {
        let oldest = self.total_written - self.count() as u64;
        if cursor < oldest {
            return (0, false);
        }
        if cursor >= self.total_written {
            return (0, true);
        }
        let available = (self.total_written - cursor) as usize;
        let copied = available.min(scratch.len());
        self.copy_range(cursor, &mut scratch[..copied]);
        (copied, true)
    }

    /// Copy `dst.len()` bytes starting at the given global offset.
    ///
    /// Caller guarantees the range is still resident.
    fn copy_range(&self, offset: u64, dst: &mut [u8]) {
        let at = self.slot(offset);
        let total = dst.len();
        let head = total.min(self.capacity - at);
        dst[..head].copy_from_slice(&self.buf[at..at + head]);
        dst[head..].copy_from_slice(&self.buf[..total - head]);
    }
}

#[cfg(test)]
#[path = "scrollback_tests.rs"]
mod tests;
