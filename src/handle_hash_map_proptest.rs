#![cfg(test)]

// Property tests for HandleHashMap kept inside the crate so they can reach
// crate-private handle accessors.

use crate::handle_hash_map::{Handle, HandleHashMap};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations so shrinking moves toward earlier keys and
// shorter op lists.
#[derive(Clone, Debug)]
enum OpI {
    Put(usize, i32),
    Remove(usize),
    Find(usize),
    Contains(String),
    // Keep entries whose value is divisible by the modulus.
    Retain(i32),
    Reserve(usize),
    Iterate,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            4 => (idx.clone(), -50i32..50).prop_map(|(i, v)| OpI::Put(i, v)),
            2 => idx.clone().prop_map(OpI::Remove),
            2 => idx.clone().prop_map(OpI::Find),
            1 => prop_oneof![contains_pool, "[a-z]{0,5}"].prop_map(OpI::Contains),
            1 => (1i32..4).prop_map(OpI::Retain),
            1 => (0usize..40).prop_map(OpI::Reserve),
            1 => Just(OpI::Iterate),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// State-machine equivalence against std::collections::HashMap:
// - `put` overwrites in place; the handle of a live key never changes.
// - `find`/`contains_key` parity with the model, including borrowed lookup.
// - `remove(handle)` returns the owned pair and invalidates the handle.
// - `retain` removes exactly the rejected entries and reports the count.
// - `try_reserve` never changes contents, lands exactly on the size
//   `heap_size_after_reserve` projected, and `heap_size` never shrinks.
// - Stale handles never resolve; `len`/`is_empty` parity after every op.
fn run_scenario<S>(
    mut sut: HandleHashMap<Key, i32, S>,
    pool: &[String],
    ops: Vec<OpI>,
) -> Result<(), TestCaseError>
where
    S: BuildHasher + Clone + Default,
{
    let mut model: HashMap<Key, i32> = HashMap::new();
    let mut live: HashMap<Key, Handle> = HashMap::new();
    let mut stale: Vec<Handle> = Vec::new();

    for op in ops {
        let size_before = sut.heap_size();
        match op {
            OpI::Put(i, v) => {
                let k = key_from(pool, i);
                let (h, old) = sut.put(k.clone(), v);
                prop_assert_eq!(old, model.insert(k.clone(), v));
                if let Some(&prev) = live.get(&k) {
                    prop_assert_eq!(prev, h, "overwrite must keep the handle");
                }
                live.insert(k, h);
            }
            OpI::Remove(i) => {
                let k = key_from(pool, i);
                if let Some(h) = live.remove(&k) {
                    let (kk, vv) = sut.remove(h).expect("handle valid for removal");
                    prop_assert!(kk == k);
                    prop_assert_eq!(Some(vv), model.remove(&kk));
                    stale.push(h);
                } else {
                    prop_assert!(sut.find(&k).is_none());
                }
            }
            OpI::Find(i) => {
                let k = key_from(pool, i);
                let found = sut.find(&k);
                prop_assert_eq!(found, live.get(&k).copied());
                if let Some(h) = found {
                    prop_assert_eq!(h.value(&sut), model.get(&k));
                    prop_assert_eq!(h.key(&sut), Some(&k));
                }
            }
            OpI::Contains(s) => {
                let has = sut.contains_key(s.as_str());
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(has, has_model);
            }
            OpI::Retain(m) => {
                let before = model.len();
                model.retain(|_, v| *v % m == 0);
                let removed = sut.retain(|_, v| *v % m == 0);
                prop_assert_eq!(removed, before - model.len());
                let dropped: Vec<Key> = live
                    .keys()
                    .filter(|k| !model.contains_key(*k))
                    .cloned()
                    .collect();
                for k in dropped {
                    if let Some(h) = live.remove(&k) {
                        stale.push(h);
                    }
                }
            }
            OpI::Reserve(n) => {
                let projected = sut.heap_size_after_reserve(n);
                sut.try_reserve(n).expect("small reservations succeed");
                prop_assert!(sut.capacity() >= sut.len() + n);
                prop_assert_eq!(projected, Some(sut.heap_size()));
                prop_assert_eq!(sut.heap_size_after_reserve(0), Some(sut.heap_size()));
            }
            OpI::Iterate => {
                let s_keys: BTreeSet<_> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
                for (h, k, v) in sut.iter() {
                    prop_assert_eq!(Some(&h), live.get(k));
                    prop_assert_eq!(Some(v), model.get(k));
                }
            }
        }

        for &h in &stale {
            prop_assert!(h.value(&sut).is_none());
        }
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        prop_assert!(sut.heap_size() >= size_before);
        prop_assert!(sut.capacity() >= sut.len());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(HandleHashMap::new(), &pool, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(HandleHashMap::with_hasher(ConstBuildHasher), &pool, ops)?;
    }
}
