//! Deterministic Random Source
//!
//! The engine never reads wall-clock entropy. Randomness enters as a
//! deterministic stream keyed by a seed plus an opaque, serializable
//! cursor. A stream is registered as an ordinary input whose value changes
//! only through explicit stream-advance operations the engine executes
//! itself during a transaction, so replaying the same assignment sequence
//! reproduces the same draws.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A deterministic value stream: `seed` fixes the sequence, `cursor` is
/// the position in it. Both serialize, so a stream can be checkpointed and
/// resumed exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    seed: u64,
    cursor: u64,
}

impl DeterministicRng {
    /// Start a stream at the beginning.
    pub fn new(seed: u64) -> Self {
        Self { seed, cursor: 0 }
    }

    /// Resume a stream at a checkpointed cursor.
    pub fn resume(seed: u64, cursor: u64) -> Self {
        Self { seed, cursor }
    }

    /// The current cursor, for checkpointing.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Draw the next raw value and advance the cursor.
    pub fn next_u64(&mut self) -> u64 {
        // splitmix64 over seed + position: stateless per position, so the
        // cursor alone encodes the resume point.
        let mut z = self
            .seed
            .wrapping_add(self.cursor.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.cursor += 1;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Draw the next value as a float in `[0, 1)`.
    pub fn next_float(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Draw the next value in engine form.
    pub fn next_value(&mut self) -> Value {
        Value::Float(self.next_float())
    }
}
