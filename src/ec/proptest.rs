//! Property-Based Tests for Fragment Coding
//!
//! 1. **Fault Tolerance**: any `parity` lost frags can be rebuilt
//! 2. **Determinism**: rebuilt frags are byte-identical to the originals

#![cfg(test)]

use proptest::prelude::*;

use super::encoder::FragCoder;

fn layout_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=6, 1usize..=3)
}

fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..2000)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Losing up to `parity` frags never loses data.
    #[test]
    fn prop_rebuild_within_parity(
        (k, m) in layout_strategy(),
        data in data_strategy(),
        seed in any::<u64>(),
    ) {
        let coder = FragCoder::new(k, m)?;
        let encoded = coder.encode(&data)?;

        let mut frags: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        let total = frags.len();
        for i in 0..m {
            let victim = (seed as usize).wrapping_add(i * 7919) % total;
            frags[victim] = None;
        }

        coder.reconstruct(&mut frags)?;
        for (rebuilt, original) in frags.iter().zip(encoded.iter()) {
            prop_assert_eq!(rebuilt.as_ref(), Some(original));
        }
        prop_assert_eq!(coder.join(&frags, data.len())?, data);
    }

    /// Frags always have the same size and cover the chunk.
    #[test]
    fn prop_frags_cover_chunk((k, m) in layout_strategy(), data in data_strategy()) {
        let coder = FragCoder::new(k, m)?;
        let encoded = coder.encode(&data)?;
        prop_assert_eq!(encoded.len(), k + m);
        let frag_size = encoded[0].len();
        prop_assert!(encoded.iter().all(|f| f.len() == frag_size));
        prop_assert!(frag_size * k >= data.len());
    }
}
