//! Fixed-capacity circular sample buffer.
//!
//! Foundation for all audio movement inside one thread: the pre-speech
//! buffer and any bounded sample staging use this. Overflow overwrites the
//! oldest samples (sliding window) rather than failing; upstream capture
//! rate is bounded, so a full buffer only ever means "keep the newest".
//! Cross-thread movement uses channels instead (see `pipeline`).

use crate::error::{VoiceError, VoiceResult};

/// Circular f32 sample queue with head/count cursors.
///
/// Invariant: `0 <= len() <= capacity()`. Single-writer/single-reader
/// discipline; not internally synchronized.
pub struct RingBuffer {
    data: Vec<f32>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            data: vec![0.0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append samples, overwriting the oldest buffered samples if the ring
    /// would exceed capacity. Never fails, never blocks.
    pub fn write(&mut self, samples: &[f32]) {
        let cap = self.data.len();
        // Only the last `cap` samples of an oversized write can survive.
        let samples = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };

        let mut tail = (self.head + self.len) % cap;
        for &s in samples {
            self.data[tail] = s;
            tail = (tail + 1) % cap;
        }

        let overwritten = (self.len + samples.len()).saturating_sub(cap);
        if overwritten > 0 {
            self.head = (self.head + overwritten) % cap;
            self.len = cap;
        } else {
            self.len += samples.len();
        }
    }

    /// Remove and return the oldest `n` samples in order.
    ///
    /// Fails with `BufferUnderrun` if fewer than `n` samples are buffered;
    /// the ring is left untouched in that case.
    pub fn read(&mut self, n: usize) -> VoiceResult<Vec<f32>> {
        if n > self.len {
            return Err(VoiceError::BufferUnderrun {
                requested: n,
                available: self.len,
            });
        }
        let cap = self.data.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.data[(self.head + i) % cap]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        Ok(out)
    }

    /// Copy out all buffered samples oldest-first without consuming them.
    pub fn peek_all(&self) -> Vec<f32> {
        let cap = self.data.len();
        (0..self.len)
            .map(|i| self.data[(self.head + i) % cap])
            .collect()
    }

    /// Remove and return all buffered samples oldest-first.
    pub fn drain_all(&mut self) -> Vec<f32> {
        let out = self.peek_all();
        self.head = 0;
        self.len = 0;
        out
    }

    /// Discard all buffered samples.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
