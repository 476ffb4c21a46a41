//! Model-based property tests: [`MassMap`] against `BTreeMap`.
//!
//! Key strategies are biased toward what actually stresses the trie:
//! tiny alphabets and long shared prefixes, so runs routinely cross
//! slice boundaries, create layer chains, and split nodes.

use std::collections::BTreeMap;

use massmap::{MassMap, PutResult};
use proptest::prelude::*;

/// Keys over a two-symbol alphabet plus a zero byte: maximal prefix
/// sharing, layer chains, and same-slice/different-length pairs.
fn clustered_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(0u8)], 0..36)
}

/// Arbitrary short byte keys.
fn arbitrary_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..24)
}

/// Insert every key into both the map and the model, checking the
/// per-call result, then verify full agreement and the invariant walk.
fn run_against_model(keys: Vec<Vec<u8>>) -> Result<(), TestCaseError> {
    let map: MassMap<u64> = MassMap::new();
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for (i, key) in keys.iter().enumerate() {
        let expected: PutResult = if model.contains_key(key) {
            PutResult::AlreadyPresent
        } else {
            PutResult::Inserted
        };

        prop_assert_eq!(map.put(key, i as u64), expected, "put #{} {:?}", i, key);
        model.entry(key.clone()).or_insert(i as u64);
    }

    let guard = map.guard();
    for (key, want) in &model {
        let got = map.get_with_guard(key, &guard);
        prop_assert_eq!(got.as_deref(), Some(want), "lost key {:?}", key);
    }

    // Probes derived from stored keys must agree with the model on
    // misses too.
    for key in keys.iter().take(64) {
        let mut probe: Vec<u8> = key.clone();
        probe.push(b'!');
        let got = map.get_with_guard(&probe, &guard);
        prop_assert_eq!(got.as_deref(), model.get(&probe), "phantom entry for {:?}", probe);
    }
    drop(guard);

    prop_assert_eq!(map.len(), model.len());
    prop_assert_eq!(map.check_invariants(), model.len());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn clustered_keys_match_model(
        keys in proptest::collection::vec(clustered_key(), 1..250)
    ) {
        run_against_model(keys)?;
    }

    #[test]
    fn arbitrary_keys_match_model(
        keys in proptest::collection::vec(arbitrary_key(), 1..250)
    ) {
        run_against_model(keys)?;
    }

    #[test]
    fn dense_u64_keys_match_model(
        seeds in proptest::collection::vec(any::<u16>(), 1..400)
    ) {
        // Fixed-width keys with heavy low-byte variation: lots of
        // splits, no layers.
        let keys: Vec<Vec<u8>> = seeds
            .into_iter()
            .map(|s| u64::from(s).to_be_bytes().to_vec())
            .collect();
        run_against_model(keys)?;
    }

    #[test]
    fn get_never_fabricates(
        stored in proptest::collection::vec(clustered_key(), 1..100),
        probes in proptest::collection::vec(clustered_key(), 1..100)
    ) {
        let map: MassMap<u64> = MassMap::new();
        let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for (i, key) in stored.iter().enumerate() {
            map.put(key, i as u64);
            model.entry(key.clone()).or_insert(i as u64);
        }

        for probe in &probes {
            let got = map.get(probe);
            prop_assert_eq!(got.as_deref(), model.get(probe), "probe {:?}", probe);
        }
    }
}
