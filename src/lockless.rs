//! Single-writer state cell that readers never wait on
//!
//! The value is stored as a run of atomic words guarded by a sequence
//! counter. The writer makes the sequence odd, stores the words, then makes it
//! even again; a reader copies the words and retries if the sequence moved or
//! was odd while it copied. Readers therefore see either the previous or the
//! next complete value, never a mix of the two, and there is no mutex.
//!
//! Only one thread may call [`Lockless::set_state`] for a given cell.

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use bytemuck::Pod;

const WORD_BYTES: usize = std::mem::size_of::<u64>();

pub struct Lockless<T: Pod> {
    sequence: AtomicU64,
    words: Box<[AtomicU64]>,
    _value: PhantomData<T>,
}

impl<T: Pod> Lockless<T> {
    pub fn new(value: T) -> Self {
        let word_count = std::mem::size_of::<T>().div_ceil(WORD_BYTES).max(1);
        let words = (0..word_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let cell = Self {
            sequence: AtomicU64::new(0),
            words,
            _value: PhantomData,
        };
        cell.set_state(value);
        cell
    }

    /// Publishes a new value. Single writer only.
    pub fn set_state(&self, value: T) {
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        let bytes = bytemuck::bytes_of(&value);
        for (word, chunk) in self.words.iter().zip(bytes.chunks(WORD_BYTES)) {
            let mut packed = [0u8; WORD_BYTES];
            packed[..chunk.len()].copy_from_slice(chunk);
            word.store(u64::from_ne_bytes(packed), Ordering::Relaxed);
        }

        self.sequence.store(sequence.wrapping_add(2), Ordering::Release);
    }

    /// Returns the last fully written value.
    pub fn state(&self) -> T {
        let mut value: T = bytemuck::Zeroable::zeroed();
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let bytes = bytemuck::bytes_of_mut(&mut value);
            for (word, chunk) in self.words.iter().zip(bytes.chunks_mut(WORD_BYTES)) {
                let packed = word.load(Ordering::Relaxed).to_ne_bytes();
                chunk.copy_from_slice(&packed[..chunk.len()]);
            }

            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for Lockless<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lockless").field(&self.state()).finish()
    }
}
