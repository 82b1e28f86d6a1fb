//! Per-transaction dedup memory.
//!
//! # Responsibility
//! - Remember which transient neurons were reconciled to a canonical neuron.
//! - Remember items already written in the current outer transaction so later
//!   merges sharing this value find them without a store round trip.
//!
//! # Invariants
//! - Grows monotonically; nothing is ever removed.
//! - Committed entries are persistent-flagged clones.
//! - At most one committed neuron matches a `(tag, target set)` signature.

use crate::model::network::{Network, NetworkItem};
use crate::model::neuron::{Neuron, NeuronId};
use crate::model::terminal::Terminal;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type TransactionDataResult<T> = Result<T, TransactionDataError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDataError {
    /// The same item id was recorded as committed twice.
    DuplicateCommit(Uuid),
    /// A replacement was already recorded for this original id.
    DuplicateReplacement(NeuronId),
    /// More than one committed neuron shares the same signature.
    RedundantNeurons {
        tag: Option<String>,
        neuron_ids: Vec<NeuronId>,
    },
    /// A committed match owns a different number of terminals than targets.
    TerminalCountMismatch {
        neuron_id: NeuronId,
        expected: usize,
        actual: usize,
    },
}

impl Display for TransactionDataError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateCommit(id) => write!(f, "item {id} already recorded as committed"),
            Self::DuplicateReplacement(id) => {
                write!(f, "neuron {id} already recorded as replaced")
            }
            Self::RedundantNeurons { tag, neuron_ids } => write!(
                f,
                "redundant committed neurons for tag {tag:?}: {}",
                join_ids(neuron_ids)
            ),
            Self::TerminalCountMismatch {
                neuron_id,
                expected,
                actual,
            } => write!(
                f,
                "committed neuron {neuron_id} should own {expected} terminals, found {actual}"
            ),
        }
    }
}

impl Error for TransactionDataError {}

pub(crate) fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Dedup memory scoped to one outer transaction.
///
/// Create one per transaction, or hand the same value to several merge/save
/// calls that run inside that transaction.
#[derive(Debug, Clone, Default)]
pub struct NetworkTransactionData {
    replaced: BTreeMap<NeuronId, Neuron>,
    committed: Network,
}

impl NetworkTransactionData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a persistent-flagged clone of `item` as written.
    ///
    /// # Errors
    /// - `DuplicateCommit` when the id was already recorded.
    pub fn record_committed(&mut self, item: &NetworkItem) -> TransactionDataResult<()> {
        let id = item.id();
        if self.committed.contains(id) {
            return Err(TransactionDataError::DuplicateCommit(id));
        }
        self.committed.add_or_replace(item.clone_as_persistent());
        Ok(())
    }

    /// Records that `original_id` was reconciled to `canonical`.
    ///
    /// # Errors
    /// - `DuplicateReplacement` when `original_id` was already recorded.
    pub fn record_replacement(
        &mut self,
        original_id: NeuronId,
        canonical: Neuron,
    ) -> TransactionDataResult<()> {
        if self.replaced.contains_key(&original_id) {
            return Err(TransactionDataError::DuplicateReplacement(original_id));
        }
        self.replaced.insert(original_id, canonical);
        Ok(())
    }

    pub fn is_replaced(&self, id: NeuronId) -> bool {
        self.replaced.contains_key(&id)
    }

    /// Returns the canonical id for `id`, or `id` itself when not replaced.
    pub fn resolve(&self, id: NeuronId) -> NeuronId {
        self.replaced
            .get(&id)
            .map(|canonical| canonical.id)
            .unwrap_or(id)
    }

    pub fn replacement_of(&self, id: NeuronId) -> Option<&Neuron> {
        self.replaced.get(&id)
    }

    pub fn replaced_count(&self) -> usize {
        self.replaced.len()
    }

    pub fn is_committed(&self, id: Uuid) -> bool {
        self.committed.contains(id)
    }

    pub fn committed_neurons(&self) -> impl Iterator<Item = &Neuron> + '_ {
        self.committed.items::<Neuron>()
    }

    pub fn committed_terminals(&self) -> impl Iterator<Item = &Terminal> + '_ {
        self.committed.items::<Terminal>()
    }

    /// Finds the committed neuron with exactly `tag` whose committed terminals
    /// target exactly `target_ids`.
    ///
    /// Returns the neuron with its terminals, or `None` when nothing matches.
    ///
    /// # Errors
    /// - `RedundantNeurons` when more than one committed neuron matches.
    /// - `TerminalCountMismatch` when the match owns more terminals than
    ///   `target_ids` holds (parallel terminals to the same target).
    pub fn find_equivalent(
        &self,
        tag: Option<&str>,
        target_ids: &BTreeSet<NeuronId>,
    ) -> TransactionDataResult<Option<Network>> {
        let matches: Vec<&Neuron> = self
            .committed
            .items::<Neuron>()
            .filter(|neuron| neuron.tag.as_deref() == tag)
            .filter(|neuron| &self.committed.postsynaptic_ids(neuron.id) == target_ids)
            .collect();

        let neuron = match matches.as_slice() {
            [] => return Ok(None),
            [single] => *single,
            _ => {
                return Err(TransactionDataError::RedundantNeurons {
                    tag: tag.map(str::to_string),
                    neuron_ids: matches.iter().map(|neuron| neuron.id).collect(),
                })
            }
        };

        let terminals = self.committed.outgoing_edges(neuron.id);
        if terminals.len() != target_ids.len() {
            return Err(TransactionDataError::TerminalCountMismatch {
                neuron_id: neuron.id,
                expected: target_ids.len(),
                actual: terminals.len(),
            });
        }

        let mut found = Network::new();
        found.add_or_replace(neuron.clone());
        found.add_or_replace_all(terminals.into_iter().cloned());
        Ok(Some(found))
    }
}

#[cfg(test)]
mod tests {
    use super::{NetworkTransactionData, TransactionDataError};
    use crate::model::network::NetworkItem;
    use crate::model::neuron::Neuron;
    use crate::model::terminal::Terminal;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn commit(data: &mut NetworkTransactionData, item: impl Into<NetworkItem>) {
        data.record_committed(&item.into()).unwrap();
    }

    #[test]
    fn record_committed_stores_persistent_clone_once() {
        let mut data = NetworkTransactionData::new();
        let neuron = Neuron::new_transient().with_tag("x");
        let item = NetworkItem::from(neuron.clone());

        data.record_committed(&item).unwrap();
        let stored: Vec<_> = data.committed_neurons().collect();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].is_transient);
        assert!(neuron.is_transient);

        assert_eq!(
            data.record_committed(&item),
            Err(TransactionDataError::DuplicateCommit(neuron.id))
        );
    }

    #[test]
    fn replacement_resolves_and_rejects_second_record() {
        let mut data = NetworkTransactionData::new();
        let original = Uuid::new_v4();
        let canonical = Neuron::persistent(Uuid::new_v4());
        let untouched = Uuid::new_v4();

        data.record_replacement(original, canonical.clone()).unwrap();
        assert!(data.is_replaced(original));
        assert!(!data.is_replaced(untouched));
        assert_eq!(data.resolve(original), canonical.id);
        assert_eq!(data.resolve(untouched), untouched);
        assert_eq!(data.replacement_of(original), Some(&canonical));

        assert_eq!(
            data.record_replacement(original, canonical),
            Err(TransactionDataError::DuplicateReplacement(original))
        );
    }

    #[test]
    fn find_equivalent_requires_exact_tag_and_target_set() {
        let mut data = NetworkTransactionData::new();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let a = Neuron::new_transient().with_tag("x");
        commit(&mut data, a.clone());
        commit(&mut data, Terminal::new_transient(a.id, b));
        commit(&mut data, Terminal::new_transient(a.id, c));

        let found = data
            .find_equivalent(Some("x"), &BTreeSet::from([b, c]))
            .unwrap()
            .unwrap();
        assert!(found.try_get::<Neuron>(a.id).is_some());
        assert_eq!(found.outgoing_edges(a.id).len(), 2);

        assert!(data
            .find_equivalent(Some("x"), &BTreeSet::from([b]))
            .unwrap()
            .is_none());
        assert!(data
            .find_equivalent(Some("y"), &BTreeSet::from([b, c]))
            .unwrap()
            .is_none());
        assert!(data
            .find_equivalent(None, &BTreeSet::from([b, c]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn find_equivalent_matches_untagged_leaf() {
        let mut data = NetworkTransactionData::new();
        let leaf = Neuron::new_transient();
        commit(&mut data, leaf.clone());

        let found = data.find_equivalent(None, &BTreeSet::new()).unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(leaf.id));
    }

    #[test]
    fn find_equivalent_fails_fast_on_redundant_commits() {
        let mut data = NetworkTransactionData::new();
        let b = Uuid::new_v4();
        for _ in 0..2 {
            let a = Neuron::new_transient().with_tag("x");
            commit(&mut data, Terminal::new_transient(a.id, b));
            commit(&mut data, a);
        }

        let err = data
            .find_equivalent(Some("x"), &BTreeSet::from([b]))
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionDataError::RedundantNeurons { ref neuron_ids, .. } if neuron_ids.len() == 2
        ));
    }

    #[test]
    fn find_equivalent_fails_on_parallel_terminals() {
        let mut data = NetworkTransactionData::new();
        let b = Uuid::new_v4();
        let a = Neuron::new_transient().with_tag("x");
        commit(&mut data, a.clone());
        commit(&mut data, Terminal::new_transient(a.id, b));
        commit(&mut data, Terminal::new_transient(a.id, b));

        assert_eq!(
            data.find_equivalent(Some("x"), &BTreeSet::from([b])),
            Err(TransactionDataError::TerminalCountMismatch {
                neuron_id: a.id,
                expected: 1,
                actual: 2,
            })
        );
    }
}
