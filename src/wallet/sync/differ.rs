//! Snapshot diffing.
//!
//! Compares two UTXO snapshots of the same wallet and reports which outputs appeared and which
//! were spent. Identity is `(txid, output_index, value)`, so an output that only changed its
//! confirmation height is neither added nor consumed.

use crate::indexer::RawUtxo;
use crate::wallet::{AddressHandle, UtxoIdentity, UtxoSnapshot};

use std::collections::HashSet;

/// Outputs that appeared and disappeared between two snapshots.
///
/// Only addresses with at least one changed output have an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoDelta {
    pub added: UtxoSnapshot,
    pub consumed: UtxoSnapshot,
}

impl UtxoDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.consumed.is_empty()
    }
}

/// Result of comparing snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDiff {
    Delta(UtxoDelta),
    /// One of the snapshots is missing, an incremental update is impossible.
    NoSnapshot,
}

/// Compute the delta from `previous` to `current`.
pub fn diff_snapshots(
    previous: Option<&UtxoSnapshot>,
    current: Option<&UtxoSnapshot>,
) -> SnapshotDiff {
    let (Some(previous), Some(current)) = (previous, current) else {
        return SnapshotDiff::NoSnapshot;
    };

    let mut delta = UtxoDelta::default();

    for (address, current_utxos) in current {
        let previous_utxos = previous.get(address).unwrap_or_default();
        push_missing(&mut delta.added, address, current_utxos, previous_utxos);
    }

    for (address, previous_utxos) in previous {
        let current_utxos = current.get(address).unwrap_or_default();
        push_missing(&mut delta.consumed, address, previous_utxos, current_utxos);
    }

    SnapshotDiff::Delta(delta)
}

/// Append to `target[address]` every item of `from` whose identity is absent in `against`.
fn push_missing(
    target: &mut UtxoSnapshot,
    address: &AddressHandle,
    from: &[RawUtxo],
    against: &[RawUtxo],
) {
    let known: HashSet<_> = against.iter().map(UtxoIdentity::identity).collect();
    let missing: Vec<RawUtxo> = from
        .iter()
        .filter(|utxo| !known.contains(&utxo.identity()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        target.entry_mut(address).extend(missing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(path: &str, byte: u8) -> AddressHandle {
        AddressHandle::new(format!("ecash:{}", path), hex::encode([byte; 20]), path).unwrap()
    }

    fn utxo(txid: &str, vout: u32, value: u64, height: Option<u32>) -> RawUtxo {
        RawUtxo {
            txid: txid.to_string(),
            output_index: vout,
            value,
            confirmation_height: height,
        }
    }

    fn snapshot(entries: Vec<(AddressHandle, Vec<RawUtxo>)>) -> UtxoSnapshot {
        entries.into_iter().collect()
    }

    fn delta(diff: SnapshotDiff) -> UtxoDelta {
        match diff {
            SnapshotDiff::Delta(delta) => delta,
            SnapshotDiff::NoSnapshot => panic!("expected a delta"),
        }
    }

    #[test]
    fn missing_snapshot_is_signalled() {
        let current = snapshot(vec![(handle("1899", 1), vec![utxo("a", 0, 1, None)])]);
        assert_eq!(diff_snapshots(None, Some(&current)), SnapshotDiff::NoSnapshot);
        assert_eq!(diff_snapshots(Some(&current), None), SnapshotDiff::NoSnapshot);
    }

    #[test]
    fn replaced_output_is_added_and_consumed() {
        let address = handle("1899", 1);
        let previous = snapshot(vec![(address.clone(), vec![utxo("A", 0, 1000, None)])]);
        let current = snapshot(vec![(address.clone(), vec![utxo("B", 1, 2000, None)])]);

        let delta = delta(diff_snapshots(Some(&previous), Some(&current)));
        assert_eq!(delta.added.get(&address).unwrap(), &[utxo("B", 1, 2000, None)]);
        assert_eq!(delta.consumed.get(&address).unwrap(), &[utxo("A", 0, 1000, None)]);
    }

    #[test]
    fn confirmation_is_not_a_change() {
        let address = handle("1899", 1);
        let previous = snapshot(vec![(address.clone(), vec![utxo("A", 0, 1000, None)])]);
        let current = snapshot(vec![(address, vec![utxo("A", 0, 1000, Some(812_345))])]);

        let delta = delta(diff_snapshots(Some(&previous), Some(&current)));
        assert!(delta.is_empty());
    }

    #[test]
    fn new_and_vanished_addresses() {
        let kept = handle("1899", 1);
        let fresh = handle("145", 2);
        let gone = handle("245", 3);
        let previous = snapshot(vec![
            (kept.clone(), vec![utxo("A", 0, 1000, None)]),
            (gone.clone(), vec![utxo("C", 2, 700, None)]),
        ]);
        let current = snapshot(vec![
            (kept.clone(), vec![utxo("A", 0, 1000, None)]),
            (fresh.clone(), vec![utxo("D", 0, 546, None), utxo("E", 1, 600, None)]),
        ]);

        let delta = delta(diff_snapshots(Some(&previous), Some(&current)));
        assert_eq!(delta.added.get(&fresh).map(<[RawUtxo]>::len), Some(2));
        assert_eq!(delta.consumed.get(&gone).map(<[RawUtxo]>::len), Some(1));
        assert!(!delta.added.contains_address(&kept));
        assert!(!delta.consumed.contains_address(&kept));
    }

    #[test]
    fn diff_is_reversible_per_address() {
        let address = handle("1899", 1);
        let previous = snapshot(vec![(
            address.clone(),
            vec![utxo("A", 0, 1000, None), utxo("B", 0, 2500, None), utxo("C", 3, 546, None)],
        )]);
        let current = snapshot(vec![(
            address.clone(),
            vec![utxo("B", 0, 2500, Some(10)), utxo("C", 3, 546, None), utxo("D", 1, 900, None)],
        )]);

        let delta = delta(diff_snapshots(Some(&previous), Some(&current)));
        let consumed: HashSet<_> = delta
            .consumed
            .get(&address)
            .unwrap_or_default()
            .iter()
            .map(UtxoIdentity::identity)
            .collect();

        let mut rebuilt: Vec<_> = previous
            .get(&address)
            .unwrap()
            .iter()
            .filter(|u| !consumed.contains(&u.identity()))
            .chain(delta.added.get(&address).unwrap_or_default())
            .map(UtxoIdentity::identity)
            .collect();
        rebuilt.sort();

        let mut expected: Vec<_> = current
            .get(&address)
            .unwrap()
            .iter()
            .map(UtxoIdentity::identity)
            .collect();
        expected.sort();

        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn diffing_is_deterministic() {
        let address = handle("1899", 1);
        let previous = snapshot(vec![(address.clone(), vec![utxo("A", 0, 1000, None)])]);
        let current = snapshot(vec![(address, vec![utxo("B", 1, 2000, None)])]);
        assert_eq!(
            diff_snapshots(Some(&previous), Some(&current)),
            diff_snapshots(Some(&previous), Some(&current))
        );
    }
}
