//! Save orchestration for uniquified networks.
//!
//! # Responsibility
//! - Commit every remaining transient neuron and terminal through the
//!   aggregate repositories.
//! - Record each committed item in the dedup memory.
//!
//! # Invariants
//! - Writes to one neuron aggregate are strictly sequential, each passing the
//!   version returned by the previous write.
//! - An item is recorded as committed only after all of its writes succeed.
//! - Non-transient items are never written.

use crate::model::network::{Network, NetworkItem};
use crate::model::neuron::{Neuron, NeuronId};
use crate::model::terminal::Terminal;
use crate::model::ItemValidationError;
use crate::repo::aggregate_repo::{NeuronAggregateRepository, TerminalAggregateRepository};
use crate::repo::{AggregateVersion, RepoError};
use crate::service::transaction_data::{NetworkTransactionData, TransactionDataError};
use log::{debug, error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

pub type SaveResult<T> = Result<T, SaveError>;

#[derive(Debug)]
pub enum SaveError {
    Repo(RepoError),
    TransactionData(TransactionDataError),
    Validation(ItemValidationError),
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::TransactionData(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::TransactionData(err) => Some(err),
            Self::Validation(err) => Some(err),
        }
    }
}

impl From<RepoError> for SaveError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<TransactionDataError> for SaveError {
    fn from(value: TransactionDataError) -> Self {
        Self::TransactionData(value)
    }
}

impl From<ItemValidationError> for SaveError {
    fn from(value: ItemValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Counters describing one `save` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub neurons_created: usize,
    pub terminals_created: usize,
}

/// Last completed step of a neuron's write chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteStage {
    Created,
    Tagged,
    Regioned,
    UrlAssigned,
}

/// Version-threading state for the writes of one neuron aggregate.
///
/// Each step consumes the chain, so a step can only run after the previous
/// one returned its version. Steps with nothing to write keep the version.
struct NeuronWriteChain<'a, A> {
    repo: &'a A,
    id: NeuronId,
    stage: WriteStage,
    version: AggregateVersion,
}

impl<'a, A: NeuronAggregateRepository> NeuronWriteChain<'a, A> {
    fn create(repo: &'a A, id: NeuronId) -> SaveResult<Self> {
        let version = repo.create_neuron(id)?;
        Ok(Self {
            repo,
            id,
            stage: WriteStage::Created,
            version,
        })
    }

    fn tag(self, tag: Option<&str>) -> SaveResult<Self> {
        let version = match tag {
            Some(tag) => self.repo.change_tag(self.id, tag, self.version)?,
            None => self.version,
        };
        Ok(self.advance(WriteStage::Tagged, version))
    }

    fn region(self, region_id: Option<Uuid>) -> SaveResult<Self> {
        let version = match region_id {
            Some(region_id) => self.repo.change_region(self.id, region_id, self.version)?,
            None => self.version,
        };
        Ok(self.advance(WriteStage::Regioned, version))
    }

    fn external_url(self, url: Option<&str>) -> SaveResult<Self> {
        let version = match url {
            Some(url) => self.repo.change_external_url(self.id, url, self.version)?,
            None => self.version,
        };
        Ok(self.advance(WriteStage::UrlAssigned, version))
    }

    fn advance(self, stage: WriteStage, version: AggregateVersion) -> Self {
        debug_assert!(stage > self.stage);
        Self {
            stage,
            version,
            ..self
        }
    }
}

/// Commits transient network items inside the caller's outer transaction.
pub struct NetworkTransactionService<A> {
    repo: A,
    write_cache: Option<Network>,
}

impl<A> NetworkTransactionService<A>
where
    A: NeuronAggregateRepository + TerminalAggregateRepository,
{
    pub fn new(repo: A) -> Self {
        Self {
            repo,
            write_cache: None,
        }
    }

    /// Uses `write_cache` region and external URL values in place of the
    /// saved neuron's own values when the cache holds the same neuron id.
    pub fn with_write_cache(mut self, write_cache: Network) -> Self {
        self.write_cache = Some(write_cache);
        self
    }

    /// Writes every transient item of `network`.
    ///
    /// # Errors
    /// - Stops at the first failing write; earlier writes stay in the outer
    ///   transaction, which the caller is expected to roll back.
    pub fn save(
        &self,
        network: &Network,
        transaction_data: &mut NetworkTransactionData,
    ) -> SaveResult<SaveReport> {
        let started_at = Instant::now();
        let pending: Vec<&NetworkItem> = network.transient_items().collect();
        info!(
            "event=network_save module=service status=start pending={}",
            pending.len()
        );

        let mut report = SaveReport::default();
        let result = pending.into_iter().try_for_each(|item| {
            let written = match item {
                NetworkItem::Neuron(neuron) => {
                    let written = self.save_neuron(neuron)?;
                    report.neurons_created += 1;
                    NetworkItem::Neuron(written)
                }
                NetworkItem::Terminal(terminal) => {
                    self.save_terminal(terminal)?;
                    report.terminals_created += 1;
                    item.clone()
                }
            };
            transaction_data.record_committed(&written)?;
            Ok::<(), SaveError>(())
        });

        match result {
            Ok(()) => {
                info!(
                    "event=network_save module=service status=ok neurons={} terminals={} duration_ms={}",
                    report.neurons_created,
                    report.terminals_created,
                    started_at.elapsed().as_millis()
                );
                Ok(report)
            }
            Err(err) => {
                error!(
                    "event=network_save module=service status=error neurons={} terminals={} duration_ms={} error={}",
                    report.neurons_created,
                    report.terminals_created,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn save_terminal(&self, terminal: &Terminal) -> SaveResult<()> {
        terminal.validate()?;
        self.repo.create_terminal(terminal)?;
        debug!(
            "event=network_save_item module=service kind=terminal id={}",
            terminal.id
        );
        Ok(())
    }

    /// Returns the neuron as written, write-cache values applied.
    fn save_neuron(&self, neuron: &Neuron) -> SaveResult<Neuron> {
        let effective = self.apply_write_cache(neuron);
        effective.validate()?;

        let chain = NeuronWriteChain::create(&self.repo, effective.id)?
            .tag(effective.tag.as_deref())?
            .region(effective.region_id)?
            .external_url(effective.external_url.as_deref())?;
        debug!(
            "event=network_save_item module=service kind=neuron id={} version={}",
            chain.id, chain.version
        );
        Ok(effective)
    }

    fn apply_write_cache(&self, neuron: &Neuron) -> Neuron {
        let mut effective = neuron.clone();
        let cached = self
            .write_cache
            .as_ref()
            .and_then(|cache| cache.try_get::<Neuron>(neuron.id));
        if let Some(cached) = cached {
            if cached.region_id.is_some() {
                effective.region_id = cached.region_id;
            }
            if cached.external_url.is_some() {
                effective.external_url = cached.external_url.clone();
            }
        }
        effective
    }
}
