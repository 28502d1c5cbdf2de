//! Traffic-analysis padding.
//!
//! Session packets are padded to a multiple of 64 bytes plus a small
//! random extra, never exceeding the MTU budget. Handshake envelopes
//! carry 0..=99 random trailing bytes. Padding is filled with random
//! bytes, not zeros.

use rand::{Rng, RngCore};

/// Quantum the session plaintext is rounded up to.
pub const PAD_QUANTUM: usize = 64;

/// Maximum random extra on top of the rounded length.
pub const PAD_JITTER: usize = 64;

/// Handshake envelopes carry up to this many random trailing bytes.
pub const MAX_ENVELOPE_PADDING: usize = 100;

/// Padded length for a session plaintext of `len` bytes within `budget`
/// (the MTU minus the unpadded framing overhead). Rounds up to the next
/// multiple of [`PAD_QUANTUM`], then adds a uniformly random extra in
/// `[0, min(PAD_JITTER, budget - rounded))`.
pub fn padded_len(len: usize, budget: usize, rng: &mut impl Rng) -> usize {
    debug_assert!(len <= budget);
    let rounded = len.div_ceil(PAD_QUANTUM) * PAD_QUANTUM;
    let rounded = rounded.min(budget);
    let headroom = (budget - rounded).min(PAD_JITTER);
    let extra = if headroom > 0 {
        rng.gen_range(0..headroom)
    } else {
        0
    };
    rounded + extra
}

/// Random envelope padding length in `[0, MAX_ENVELOPE_PADDING)`.
pub fn envelope_padding_len(rng: &mut impl Rng) -> usize {
    rng.gen_range(0..MAX_ENVELOPE_PADDING)
}

/// Extend `out` with `n` random bytes.
pub fn fill_random(out: &mut Vec<u8>, n: usize, rng: &mut impl RngCore) {
    let start = out.len();
    out.resize(start + n, 0);
    rng.fill_bytes(&mut out[start..]);
}
