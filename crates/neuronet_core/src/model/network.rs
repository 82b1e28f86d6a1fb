//! In-memory network container.
//!
//! # Responsibility
//! - Hold neurons and terminals addressed by id.
//! - Answer adjacency queries (terminals, dendrites, neighbors) in place.
//!
//! # Invariants
//! - No two items share an id; `add_or_replace` overwrites.
//! - Terminal indexes always mirror the terminals currently held.
//! - Referential integrity of terminal endpoints is the caller's concern.

use super::neuron::{Neuron, NeuronId};
use super::terminal::{Terminal, TerminalId};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One entry of a [`Network`].
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkItem {
    Neuron(Neuron),
    Terminal(Terminal),
}

impl NetworkItem {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Neuron(neuron) => neuron.id,
            Self::Terminal(terminal) => terminal.id,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Neuron(neuron) => neuron.is_transient,
            Self::Terminal(terminal) => terminal.is_transient,
        }
    }

    /// Returns a copy flagged as persistent.
    pub fn clone_as_persistent(&self) -> Self {
        match self {
            Self::Neuron(neuron) => Self::Neuron(neuron.clone_as_persistent()),
            Self::Terminal(terminal) => Self::Terminal(terminal.clone_as_persistent()),
        }
    }
}

impl From<Neuron> for NetworkItem {
    fn from(value: Neuron) -> Self {
        Self::Neuron(value)
    }
}

impl From<Terminal> for NetworkItem {
    fn from(value: Terminal) -> Self {
        Self::Terminal(value)
    }
}

/// Typed view over [`NetworkItem`] variants, used by `Network::items`.
pub trait NetworkItemKind {
    fn from_item(item: &NetworkItem) -> Option<&Self>;
}

impl NetworkItemKind for Neuron {
    fn from_item(item: &NetworkItem) -> Option<&Self> {
        match item {
            NetworkItem::Neuron(neuron) => Some(neuron),
            NetworkItem::Terminal(_) => None,
        }
    }
}

impl NetworkItemKind for Terminal {
    fn from_item(item: &NetworkItem) -> Option<&Self> {
        match item {
            NetworkItem::Terminal(terminal) => Some(terminal),
            NetworkItem::Neuron(_) => None,
        }
    }
}

/// Mutable graph of neurons and terminals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Network {
    items: BTreeMap<Uuid, NetworkItem>,
    by_presynaptic: BTreeMap<NeuronId, BTreeSet<TerminalId>>,
    by_postsynaptic: BTreeMap<NeuronId, BTreeSet<TerminalId>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.items.contains_key(&id)
    }

    /// Inserts `item`, replacing any entry with the same id.
    ///
    /// Returns the replaced entry, if any.
    pub fn add_or_replace(&mut self, item: impl Into<NetworkItem>) -> Option<NetworkItem> {
        let item = item.into();
        let id = item.id();
        let previous = self.items.remove(&id);
        if let Some(NetworkItem::Terminal(old)) = &previous {
            self.unindex(old);
        }
        if let NetworkItem::Terminal(terminal) = &item {
            self.index(terminal);
        }
        self.items.insert(id, item);
        previous
    }

    pub fn add_or_replace_all<I, T>(&mut self, items: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<NetworkItem>,
    {
        for item in items {
            self.add_or_replace(item);
        }
    }

    /// Removes the entry with `id`, returning it when present.
    pub fn remove(&mut self, id: Uuid) -> Option<NetworkItem> {
        let removed = self.items.remove(&id);
        if let Some(NetworkItem::Terminal(terminal)) = &removed {
            self.unindex(terminal);
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<&NetworkItem> {
        self.items.get(&id)
    }

    /// Returns the entry with `id` when it exists and has kind `T`.
    pub fn try_get<T: NetworkItemKind>(&self, id: Uuid) -> Option<&T> {
        self.items.get(&id).and_then(T::from_item)
    }

    /// Iterates all entries of kind `T` in ascending id order.
    pub fn items<'a, T: NetworkItemKind + 'a>(&'a self) -> impl Iterator<Item = &'a T> + 'a {
        self.items.values().filter_map(T::from_item)
    }

    pub fn all_items(&self) -> impl Iterator<Item = &NetworkItem> + '_ {
        self.items.values()
    }

    /// Iterates entries that are not yet durably committed.
    pub fn transient_items(&self) -> impl Iterator<Item = &NetworkItem> + '_ {
        self.items.values().filter(|item| item.is_transient())
    }

    /// Terminals whose presynaptic neuron is `neuron_id`.
    pub fn outgoing_edges(&self, neuron_id: NeuronId) -> Vec<&Terminal> {
        self.indexed_terminals(self.by_presynaptic.get(&neuron_id))
    }

    /// Terminals whose postsynaptic neuron is `neuron_id` (its dendrites).
    pub fn incoming_edges(&self, neuron_id: NeuronId) -> Vec<&Terminal> {
        self.indexed_terminals(self.by_postsynaptic.get(&neuron_id))
    }

    /// Distinct ids targeted by the terminals of `neuron_id`, whether or not
    /// those neurons are held by this network.
    pub fn postsynaptic_ids(&self, neuron_id: NeuronId) -> BTreeSet<NeuronId> {
        self.outgoing_edges(neuron_id)
            .into_iter()
            .map(|terminal| terminal.postsynaptic_id)
            .collect()
    }

    /// Neurons targeted by the terminals of `neuron_id`.
    ///
    /// Targets missing from the network are skipped; see `postsynaptic_ids`.
    pub fn outgoing_neighbors(&self, neuron_id: NeuronId) -> Vec<&Neuron> {
        self.postsynaptic_ids(neuron_id)
            .into_iter()
            .filter_map(|id| self.try_get::<Neuron>(id))
            .collect()
    }

    /// Neurons with a terminal targeting `neuron_id`.
    pub fn incoming_neighbors(&self, neuron_id: NeuronId) -> Vec<&Neuron> {
        self.incoming_edges(neuron_id)
            .into_iter()
            .map(|terminal| terminal.presynaptic_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.try_get::<Neuron>(id))
            .collect()
    }

    fn indexed_terminals(&self, ids: Option<&BTreeSet<TerminalId>>) -> Vec<&Terminal> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.try_get::<Terminal>(*id))
            .collect()
    }

    fn index(&mut self, terminal: &Terminal) {
        self.by_presynaptic
            .entry(terminal.presynaptic_id)
            .or_default()
            .insert(terminal.id);
        self.by_postsynaptic
            .entry(terminal.postsynaptic_id)
            .or_default()
            .insert(terminal.id);
    }

    fn unindex(&mut self, terminal: &Terminal) {
        remove_index_entry(&mut self.by_presynaptic, terminal.presynaptic_id, terminal.id);
        remove_index_entry(&mut self.by_postsynaptic, terminal.postsynaptic_id, terminal.id);
    }
}

fn remove_index_entry(
    index: &mut BTreeMap<NeuronId, BTreeSet<TerminalId>>,
    neuron_id: NeuronId,
    terminal_id: TerminalId,
) {
    if let Some(ids) = index.get_mut(&neuron_id) {
        ids.remove(&terminal_id);
        if ids.is_empty() {
            index.remove(&neuron_id);
        }
    }
}

impl<T: Into<NetworkItem>> FromIterator<T> for Network {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut network = Network::new();
        network.add_or_replace_all(iter);
        network
    }
}
