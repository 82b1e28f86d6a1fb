//! Uniquification: interning transient neurons against known structure.
//!
//! # Responsibility
//! - Replace each transient neuron with a structurally identical canonical
//!   neuron (same tag, same postsynaptic id set) when one is already known.
//! - Drop transient terminals duplicating a persistent terminal.
//!
//! # Invariants
//! - Neurons are processed leaves first, in waves; a neuron is finalized only
//!   after every transient postsynaptic neuron is finalized.
//! - Non-transient neurons are never rewritten.
//! - A wave that finalizes nothing fails with `Stalled` instead of spinning.
//!
//! Equivalents are looked up in order: caller cache, dedup memory, store.

use crate::model::network::Network;
use crate::model::neuron::{Neuron, NeuronId};
use crate::model::terminal::{Terminal, TerminalId};
use crate::repo::query_repo::NetworkQueryRepository;
use crate::repo::RepoError;
use crate::service::transaction_data::{join_ids, NetworkTransactionData, TransactionDataError};
use log::{debug, error, info, trace};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

pub type UniquifyResult<T> = Result<T, UniquifyError>;

#[derive(Debug)]
pub enum UniquifyError {
    /// A referenced neuron is missing from the network.
    GraphCorruption(Uuid),
    /// The lookup returned more than one candidate for one signature.
    RedundantNeurons {
        tag: Option<String>,
        neuron_ids: Vec<NeuronId>,
    },
    /// The candidate owns a different number of terminals than targets.
    TerminalCountMismatch {
        neuron_id: NeuronId,
        expected: usize,
        actual: usize,
    },
    /// The candidate's terminals target a different id set.
    PostsynapticMismatch { neuron_id: NeuronId },
    /// Transient neurons that can never be finalized (cyclic input).
    Stalled { pending: Vec<NeuronId> },
    TransactionData(TransactionDataError),
    Repo(RepoError),
}

impl Display for UniquifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GraphCorruption(id) => write!(f, "neuron {id} must exist in network"),
            Self::RedundantNeurons { tag, neuron_ids } => write!(
                f,
                "redundant neurons for tag {tag:?}: {}",
                join_ids(neuron_ids)
            ),
            Self::TerminalCountMismatch {
                neuron_id,
                expected,
                actual,
            } => write!(
                f,
                "identical match {neuron_id} should have {expected} terminals, found {actual}"
            ),
            Self::PostsynapticMismatch { neuron_id } => write!(
                f,
                "identical match {neuron_id} targets a different postsynaptic set"
            ),
            Self::Stalled { pending } => write!(
                f,
                "uniquify made no progress; cyclic transient neurons: {}",
                join_ids(pending)
            ),
            Self::TransactionData(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for UniquifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TransactionData(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransactionDataError> for UniquifyError {
    fn from(value: TransactionDataError) -> Self {
        Self::TransactionData(value)
    }
}

impl From<RepoError> for UniquifyError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Structural identity of a neuron: tag plus sorted postsynaptic ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeuronSignature {
    pub tag: Option<String>,
    pub postsynaptic_ids: Vec<NeuronId>,
}

impl NeuronSignature {
    pub fn new(tag: Option<&str>, postsynaptic_ids: &BTreeSet<NeuronId>) -> Self {
        Self {
            tag: tag.map(str::to_string),
            postsynaptic_ids: postsynaptic_ids.iter().copied().collect(),
        }
    }
}

/// Cross-call cache of non-empty store lookups, keyed by signature.
pub type SignatureCache = HashMap<NeuronSignature, Network>;

/// Counters describing one `uniquify` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniquifyReport {
    pub waves: usize,
    /// Transient neurons replaced by a canonical neuron.
    pub replaced: usize,
    /// Terminals removed as redundant.
    pub removed_terminals: usize,
}

/// Rewrites a network in place against already known structure.
pub struct UniquifyService<Q: NetworkQueryRepository> {
    query: Q,
}

impl<Q: NetworkQueryRepository> UniquifyService<Q> {
    pub fn new(query: Q) -> Self {
        Self { query }
    }

    /// Deduplicates transient neurons, then transient terminals, of `network`.
    ///
    /// On error the network and `transaction_data` may be partially rewritten
    /// and must be discarded together with the outer transaction.
    pub fn uniquify(
        &self,
        network: &mut Network,
        transaction_data: &mut NetworkTransactionData,
        cache: Option<&mut SignatureCache>,
    ) -> UniquifyResult<UniquifyReport> {
        let started_at = Instant::now();
        info!(
            "event=uniquify module=service status=start items={}",
            network.len()
        );

        let mut report = UniquifyReport::default();
        let result = self
            .uniquify_neurons(network, transaction_data, cache, &mut report)
            .and_then(|()| self.uniquify_terminals(network, &mut report));

        match result {
            Ok(()) => {
                info!(
                    "event=uniquify module=service status=ok waves={} replaced={} removed_terminals={} duration_ms={}",
                    report.waves,
                    report.replaced,
                    report.removed_terminals,
                    started_at.elapsed().as_millis()
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    "event=uniquify module=service status=error waves={} duration_ms={} error={}",
                    report.waves,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn uniquify_neurons(
        &self,
        network: &mut Network,
        transaction_data: &mut NetworkTransactionData,
        mut cache: Option<&mut SignatureCache>,
        report: &mut UniquifyReport,
    ) -> UniquifyResult<()> {
        let mut current: Vec<NeuronId> = network
            .items::<Neuron>()
            .filter(|neuron| neuron.is_transient)
            .filter(|neuron| {
                network
                    .outgoing_neighbors(neuron.id)
                    .iter()
                    .all(|post| !post.is_transient)
            })
            .map(|neuron| neuron.id)
            .collect();
        let mut processed: HashSet<NeuronId> = HashSet::new();

        while !current.is_empty() {
            report.waves += 1;
            debug!(
                "event=uniquify_wave module=service wave={} size={}",
                report.waves,
                current.len()
            );

            let mut next = Wavefront::default();
            let mut progressed = false;
            for &neuron_id in &current {
                if transaction_data.is_replaced(neuron_id) {
                    trace!("uniquify neuron={neuron_id} outcome=skipped_replaced");
                    progressed = true;
                    continue;
                }

                let neuron = network
                    .try_get::<Neuron>(neuron_id)
                    .cloned()
                    .ok_or(UniquifyError::GraphCorruption(neuron_id))?;
                let targets = network.postsynaptic_ids(neuron_id);
                if has_unfinalized_target(network, &targets, &processed)? {
                    trace!("uniquify neuron={neuron_id} outcome=deferred");
                    next.push(neuron_id);
                    continue;
                }
                progressed = true;
                if processed.contains(&neuron_id) {
                    trace!("uniquify neuron={neuron_id} outcome=skipped_processed");
                    continue;
                }

                let final_id = if neuron.is_transient {
                    match self.find_canonical(
                        &neuron,
                        &targets,
                        transaction_data,
                        cache.as_deref_mut(),
                    )? {
                        Some(canonical) => {
                            let canonical_id = canonical.id;
                            report.removed_terminals +=
                                replace_neuron(network, neuron_id, canonical, transaction_data)?;
                            report.replaced += 1;
                            debug!(
                                "event=uniquify_replace module=service neuron={neuron_id} canonical={canonical_id}"
                            );
                            canonical_id
                        }
                        None => {
                            trace!("uniquify neuron={neuron_id} outcome=kept");
                            neuron_id
                        }
                    }
                } else {
                    neuron_id
                };

                processed.insert(final_id);
                for presynaptic in network.incoming_neighbors(final_id) {
                    next.push(presynaptic.id);
                }
            }

            if !progressed {
                return Err(UniquifyError::Stalled { pending: current });
            }
            current = next.ids;
        }

        let unreached: Vec<NeuronId> = network
            .items::<Neuron>()
            .filter(|neuron| neuron.is_transient && !processed.contains(&neuron.id))
            .filter(|neuron| !transaction_data.is_replaced(neuron.id))
            .map(|neuron| neuron.id)
            .collect();
        if !unreached.is_empty() {
            return Err(UniquifyError::Stalled { pending: unreached });
        }
        Ok(())
    }

    fn uniquify_terminals(
        &self,
        network: &mut Network,
        report: &mut UniquifyReport,
    ) -> UniquifyResult<()> {
        let candidates: Vec<(TerminalId, NeuronId, NeuronId)> = network
            .items::<Terminal>()
            .filter(|terminal| terminal.is_transient)
            .filter(|terminal| {
                is_persistent_neuron(network, terminal.presynaptic_id)
                    && is_persistent_neuron(network, terminal.postsynaptic_id)
            })
            .map(|terminal| (terminal.id, terminal.presynaptic_id, terminal.postsynaptic_id))
            .collect();

        for (terminal_id, presynaptic_id, postsynaptic_id) in candidates {
            if self
                .query
                .has_identical_terminal(presynaptic_id, postsynaptic_id)?
            {
                network.remove(terminal_id);
                report.removed_terminals += 1;
                debug!(
                    "event=uniquify_terminal module=service terminal={terminal_id} outcome=removed"
                );
            }
        }
        Ok(())
    }

    fn find_canonical(
        &self,
        neuron: &Neuron,
        targets: &BTreeSet<NeuronId>,
        transaction_data: &NetworkTransactionData,
        cache: Option<&mut SignatureCache>,
    ) -> UniquifyResult<Option<Neuron>> {
        let tag = neuron.tag.as_deref();
        let signature = NeuronSignature::new(tag, targets);

        if let Some(hit) = cache.as_deref().and_then(|cache| cache.get(&signature)) {
            trace!("uniquify neuron={} source=cache", neuron.id);
            return select_candidate(tag, targets, hit);
        }
        if let Some(found) = transaction_data.find_equivalent(tag, targets)? {
            trace!("uniquify neuron={} source=transaction", neuron.id);
            return select_candidate(tag, targets, &found);
        }

        let found = self.query.find_identical_neuron(tag, targets)?;
        if found.is_empty() {
            return Ok(None);
        }
        trace!("uniquify neuron={} source=store", neuron.id);
        let canonical = select_candidate(tag, targets, &found)?;
        if let Some(cache) = cache {
            cache.insert(signature, found);
        }
        Ok(canonical)
    }
}

/// Next wave ids in first-enqueue order, without duplicates.
#[derive(Default)]
struct Wavefront {
    ids: Vec<NeuronId>,
    seen: HashSet<NeuronId>,
}

impl Wavefront {
    fn push(&mut self, id: NeuronId) {
        if self.seen.insert(id) {
            self.ids.push(id);
        }
    }
}

fn has_unfinalized_target(
    network: &Network,
    targets: &BTreeSet<NeuronId>,
    processed: &HashSet<NeuronId>,
) -> UniquifyResult<bool> {
    for target_id in targets {
        let target = network
            .try_get::<Neuron>(*target_id)
            .ok_or(UniquifyError::GraphCorruption(*target_id))?;
        if target.is_transient && !processed.contains(target_id) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_persistent_neuron(network: &Network, id: NeuronId) -> bool {
    network
        .try_get::<Neuron>(id)
        .is_some_and(|neuron| !neuron.is_transient)
}

/// Picks the single candidate of a lookup result, ignoring the postsynaptic
/// neurons it carries along.
fn select_candidate(
    tag: Option<&str>,
    targets: &BTreeSet<NeuronId>,
    found: &Network,
) -> UniquifyResult<Option<Neuron>> {
    let candidates: Vec<&Neuron> = found
        .items::<Neuron>()
        .filter(|neuron| !targets.contains(&neuron.id))
        .collect();

    let candidate = match candidates.as_slice() {
        [] => return Ok(None),
        [single] => *single,
        _ => {
            return Err(UniquifyError::RedundantNeurons {
                tag: tag.map(str::to_string),
                neuron_ids: candidates.iter().map(|neuron| neuron.id).collect(),
            })
        }
    };

    let terminal_count = found.outgoing_edges(candidate.id).len();
    if terminal_count != targets.len() {
        return Err(UniquifyError::TerminalCountMismatch {
            neuron_id: candidate.id,
            expected: targets.len(),
            actual: terminal_count,
        });
    }
    if &found.postsynaptic_ids(candidate.id) != targets {
        return Err(UniquifyError::PostsynapticMismatch {
            neuron_id: candidate.id,
        });
    }
    Ok(Some(candidate.clone()))
}

/// Points every dendrite of `original_id` at `canonical` and swaps the neuron.
///
/// A dendrite whose presynaptic neuron already reaches `canonical` is removed
/// instead, so sibling collapse never leaves parallel terminals.
///
/// Returns the number of terminals removed.
fn replace_neuron(
    network: &mut Network,
    original_id: NeuronId,
    canonical: Neuron,
    transaction_data: &mut NetworkTransactionData,
) -> UniquifyResult<usize> {
    let canonical_id = canonical.id;
    let mut removed = 0;

    if canonical_id != original_id {
        let dendrites: Vec<Terminal> = network
            .incoming_edges(original_id)
            .into_iter()
            .cloned()
            .collect();
        for mut dendrite in dendrites {
            let already_linked = network
                .outgoing_edges(dendrite.presynaptic_id)
                .iter()
                .any(|terminal| terminal.postsynaptic_id == canonical_id);
            if already_linked {
                network.remove(dendrite.id);
                removed += 1;
                trace!(
                    "uniquify terminal={} outcome=removed_parallel",
                    dendrite.id
                );
                continue;
            }
            dendrite.postsynaptic_id = canonical_id;
            network.add_or_replace(dendrite);
        }

        let own_terminals: Vec<TerminalId> = network
            .outgoing_edges(original_id)
            .into_iter()
            .map(|terminal| terminal.id)
            .collect();
        for terminal_id in own_terminals {
            network.remove(terminal_id);
            removed += 1;
        }
    }

    network.add_or_replace(canonical.clone());
    if canonical_id != original_id {
        network.remove(original_id);
    }
    transaction_data.record_replacement(original_id, canonical)?;
    Ok(removed)
}
