//! Core merge engine for the neuron network.
//! Interns transient neurons and terminals against the persisted network and
//! commits the remainder through an optimistically versioned event store.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, MirrorConfig, NetworkConfig};
pub use db::{begin_transaction, open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::network::{Network, NetworkItem};
pub use model::neuron::{Neuron, NeuronId};
pub use model::terminal::{NeurotransmitterEffect, Terminal, TerminalId};
pub use model::ItemValidationError;
pub use repo::aggregate_repo::{
    NeuronAggregateRepository, SqliteAggregateRepository, TerminalAggregateRepository,
};
pub use repo::query_repo::{NetworkQueryRepository, SqliteNetworkQueryRepository};
pub use repo::{AggregateVersion, RepoError, RepoResult};
pub use service::mirror_service::{MirrorError, MirrorService};
pub use service::network_transaction::{NetworkTransactionService, SaveError, SaveReport};
pub use service::transaction_data::{NetworkTransactionData, TransactionDataError};
pub use service::uniquify::{
    NeuronSignature, SignatureCache, UniquifyError, UniquifyReport, UniquifyService,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
