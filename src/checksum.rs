//! Block payload checksum.
//!
//! Every block header records a Fletcher-32 sum of the block's on-disk bytes
//! (after compression and encryption).  The sum is computed byte-wise with
//! end-around carry folding, so it is order-sensitive and does not depend on
//! how the input is split across [`Fletcher32::update`] calls.

/// Bytes accumulated between two folds.  Keeps both sums inside `u32`.
const FOLD_INTERVAL: usize = 360;

/// Streaming Fletcher-32 state.
#[derive(Debug, Clone, Copy)]
pub struct Fletcher32 {
    sum1: u32,
    sum2: u32,
}

impl Default for Fletcher32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Fletcher32 {
    pub fn new() -> Self {
        Self { sum1: 0xffff, sum2: 0xffff }
    }

    pub fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(FOLD_INTERVAL) {
            for &b in chunk {
                self.sum1 += b as u32;
                self.sum2 += self.sum1;
            }
            self.sum1 = fold(self.sum1);
            self.sum2 = fold(self.sum2);
        }
    }

    pub fn finalize(self) -> u32 {
        let sum1 = fold(fold(self.sum1));
        let sum2 = fold(fold(self.sum2));
        (sum2 << 16) | sum1
    }
}

#[inline]
fn fold(v: u32) -> u32 {
    (v & 0xffff) + (v >> 16)
}

/// One-shot Fletcher-32 of `data`.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut hasher = Fletcher32::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_input() {
        assert_eq!(fletcher32(&[]), 0xffff_ffff);
    }

    #[test]
    fn order_sensitive() {
        assert_ne!(fletcher32(b"ab"), fletcher32(b"ba"));
    }

    #[test]
    fn large_uniform_buffer_does_not_overflow() {
        let data = vec![0xffu8; 8 * 1024 * 1024];
        let whole = fletcher32(&data);
        let mut h = Fletcher32::new();
        for part in data.chunks(4099) {
            h.update(part);
        }
        assert_eq!(h.finalize(), whole);
    }

    proptest! {
        #[test]
        fn split_point_does_not_matter(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
        ) {
            let split = split.min(data.len());
            let mut h = Fletcher32::new();
            h.update(&data[..split]);
            h.update(&data[split..]);
            prop_assert_eq!(h.finalize(), fletcher32(&data));
        }

        #[test]
        fn single_byte_mutation_is_detected(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            idx in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let original = fletcher32(&data);
            let mut corrupted = data.clone();
            let i = idx.index(corrupted.len());
            corrupted[i] = corrupted[i].wrapping_add(delta);
            prop_assert_ne!(fletcher32(&corrupted), original);
        }
    }
}
