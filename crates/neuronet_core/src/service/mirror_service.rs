//! Mirror neuron bootstrap.
//!
//! # Responsibility
//! - Map configured mirror keys to persistent neurons carrying the mirror URL.
//! - Create the mirror neurons that do not exist yet.
//!
//! # Invariants
//! - Key lists are validated before any store access.
//! - Neurons committed in the current transaction win over store results.
//! - One neuron is created per distinct mirror URL.

use crate::config::{MirrorConfig, NetworkConfig};
use crate::model::network::Network;
use crate::model::neuron::Neuron;
use crate::repo::aggregate_repo::{NeuronAggregateRepository, TerminalAggregateRepository};
use crate::repo::query_repo::NetworkQueryRepository;
use crate::repo::RepoError;
use crate::service::network_transaction::{NetworkTransactionService, SaveError};
use crate::service::transaction_data::NetworkTransactionData;
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug)]
pub enum MirrorError {
    EmptyKeys,
    BlankKey,
    /// Keys without a mirror configuration entry.
    ConfigNotFound(Vec<String>),
    /// Configured keys whose mirror neuron does not exist.
    MirrorsMissing(Vec<String>),
    Repo(RepoError),
    Save(SaveError),
}

impl Display for MirrorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKeys => write!(f, "mirror keys cannot be empty"),
            Self::BlankKey => write!(f, "mirror keys cannot contain a blank key"),
            Self::ConfigNotFound(keys) => {
                write!(f, "mirror configuration not found for: {}", keys.join(", "))
            }
            Self::MirrorsMissing(keys) => {
                write!(f, "mirror neurons not found for: {}", keys.join(", "))
            }
            Self::Repo(err) => write!(f, "{err}"),
            Self::Save(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MirrorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Save(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for MirrorError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<SaveError> for MirrorError {
    fn from(value: SaveError) -> Self {
        Self::Save(value)
    }
}

pub struct MirrorService<Q, A> {
    mirrors: Vec<MirrorConfig>,
    query: Q,
    saver: NetworkTransactionService<A>,
}

impl<Q, A> MirrorService<Q, A>
where
    Q: NetworkQueryRepository,
    A: NeuronAggregateRepository + TerminalAggregateRepository,
{
    pub fn new(config: &NetworkConfig, query: Q, repo: A) -> Self {
        Self {
            mirrors: config.mirrors.clone(),
            query,
            saver: NetworkTransactionService::new(repo),
        }
    }

    /// Returns configs for `keys` whose mirror neuron exists neither in
    /// `transaction_data` nor in the store.
    pub fn get_all_missing<K: AsRef<str>>(
        &self,
        keys: &[K],
        transaction_data: &NetworkTransactionData,
    ) -> MirrorResult<Vec<MirrorConfig>> {
        let configs = self.configs_for(keys)?;
        let existing = self.resolve(&configs, transaction_data)?;
        Ok(configs
            .into_iter()
            .filter(|config| !existing.contains_key(&config.url))
            .cloned()
            .collect())
    }

    /// Creates missing mirror neurons for `keys`.
    ///
    /// Returns `true` when at least one neuron was created.
    pub fn initialize<K: AsRef<str>>(
        &self,
        keys: &[K],
        transaction_data: &mut NetworkTransactionData,
    ) -> MirrorResult<bool> {
        let missing = self.get_all_missing(keys, transaction_data)?;
        if missing.is_empty() {
            return Ok(false);
        }

        let urls: BTreeSet<&str> = missing.iter().map(|config| config.url.as_str()).collect();
        let network: Network = urls
            .iter()
            .map(|url| Neuron::new_transient().with_external_url(*url))
            .collect();
        self.saver.save(&network, transaction_data)?;

        info!(
            "event=mirror_init module=service status=ok created={}",
            urls.len()
        );
        Ok(true)
    }

    /// Resolves `keys` to their mirror neurons.
    ///
    /// Keys whose neuron does not exist are left out, or fail the call with
    /// `MirrorsMissing` when `fail_if_missing` is set.
    pub fn get_by_keys<K: AsRef<str>>(
        &self,
        keys: &[K],
        fail_if_missing: bool,
        transaction_data: &NetworkTransactionData,
    ) -> MirrorResult<BTreeMap<String, Neuron>> {
        let configs = self.configs_for(keys)?;
        let existing = self.resolve(&configs, transaction_data)?;

        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for config in configs {
            match existing.get(&config.url) {
                Some(neuron) => {
                    found.insert(config.key.clone(), neuron.clone());
                }
                None => missing.push(config.key.clone()),
            }
        }

        if fail_if_missing && !missing.is_empty() {
            return Err(MirrorError::MirrorsMissing(missing));
        }
        Ok(found)
    }

    fn configs_for<K: AsRef<str>>(&self, keys: &[K]) -> MirrorResult<Vec<&MirrorConfig>> {
        if keys.is_empty() {
            return Err(MirrorError::EmptyKeys);
        }
        let keys: BTreeSet<&str> = keys.iter().map(|key| key.as_ref().trim()).collect();
        if keys.contains("") {
            return Err(MirrorError::BlankKey);
        }

        let configs: Vec<&MirrorConfig> = self
            .mirrors
            .iter()
            .filter(|config| keys.contains(config.key.trim()))
            .collect();
        let unknown: Vec<String> = keys
            .iter()
            .filter(|&&key| !configs.iter().any(|config| config.key.trim() == key))
            .map(|key| key.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(MirrorError::ConfigNotFound(unknown));
        }
        Ok(configs)
    }

    /// Maps mirror URL to existing neuron, committed neurons first.
    fn resolve(
        &self,
        configs: &[&MirrorConfig],
        transaction_data: &NetworkTransactionData,
    ) -> MirrorResult<BTreeMap<String, Neuron>> {
        let urls: BTreeSet<&str> = configs.iter().map(|config| config.url.as_str()).collect();
        let mut existing: BTreeMap<String, Neuron> = BTreeMap::new();
        for neuron in transaction_data.committed_neurons() {
            if let Some(url) = neuron.external_url.as_deref() {
                if urls.contains(url) {
                    existing.entry(url.to_string()).or_insert_with(|| neuron.clone());
                }
            }
        }

        let unresolved: Vec<String> = urls
            .iter()
            .filter(|url| !existing.contains_key(**url))
            .map(|url| url.to_string())
            .collect();
        if !unresolved.is_empty() {
            for neuron in self.query.get_by_external_urls(&unresolved)? {
                if let Some(url) = neuron.external_url.clone() {
                    existing.entry(url).or_insert(neuron);
                }
            }
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::{MirrorError, MirrorService};
    use crate::config::NetworkConfig;
    use crate::db::open_db_in_memory;
    use crate::repo::aggregate_repo::SqliteAggregateRepository;
    use crate::repo::query_repo::SqliteNetworkQueryRepository;
    use crate::service::transaction_data::NetworkTransactionData;

    fn config() -> NetworkConfig {
        NetworkConfig::from_json_str(
            r#"{ "mirrors": [
                { "key": "root", "url": "https://mirror.example/root" },
                { "key": "idea", "url": "https://mirror.example/idea" },
                { "key": "alias", "url": "https://mirror.example/idea" }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn invalid_keys_are_rejected_before_store_access() {
        let conn = open_db_in_memory().unwrap();
        let service = MirrorService::new(
            &config(),
            SqliteNetworkQueryRepository::try_new(&conn, 10).unwrap(),
            SqliteAggregateRepository::try_new(&conn).unwrap(),
        );
        let data = NetworkTransactionData::new();

        let empty: [&str; 0] = [];
        assert!(matches!(
            service.get_all_missing(&empty, &data),
            Err(MirrorError::EmptyKeys)
        ));
        assert!(matches!(
            service.get_all_missing(&["root", " "], &data),
            Err(MirrorError::BlankKey)
        ));
        assert!(matches!(
            service.get_all_missing(&["root", "nope"], &data),
            Err(MirrorError::ConfigNotFound(keys)) if keys == vec!["nope".to_string()]
        ));
    }

    #[test]
    fn initialize_creates_one_neuron_per_url_then_is_noop() {
        let conn = open_db_in_memory().unwrap();
        let service = MirrorService::new(
            &config(),
            SqliteNetworkQueryRepository::try_new(&conn, 10).unwrap(),
            SqliteAggregateRepository::try_new(&conn).unwrap(),
        );
        let mut data = NetworkTransactionData::new();
        let keys = ["root", "idea", "alias"];

        assert_eq!(service.get_all_missing(&keys, &data).unwrap().len(), 3);
        assert!(service.initialize(&keys, &mut data).unwrap());
        assert_eq!(data.committed_neurons().count(), 2);
        assert!(service.get_all_missing(&keys, &data).unwrap().is_empty());
        assert!(!service.initialize(&keys, &mut data).unwrap());

        let found = service.get_by_keys(&keys, true, &data).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found["idea"].id, found["alias"].id);
        assert_ne!(found["root"].id, found["idea"].id);
    }

    #[test]
    fn store_mirrors_are_found_across_transactions() {
        let conn = open_db_in_memory().unwrap();
        let service = MirrorService::new(
            &config(),
            SqliteNetworkQueryRepository::try_new(&conn, 10).unwrap(),
            SqliteAggregateRepository::try_new(&conn).unwrap(),
        );
        service
            .initialize(&["root"], &mut NetworkTransactionData::new())
            .unwrap();

        let fresh = NetworkTransactionData::new();
        assert!(service
            .get_all_missing(&["root"], &fresh)
            .unwrap()
            .is_empty());

        let found = service.get_by_keys(&["root", "idea"], false, &fresh).unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found["root"].is_transient);
        assert_eq!(
            found["root"].external_url.as_deref(),
            Some("https://mirror.example/root")
        );

        assert!(matches!(
            service.get_by_keys(&["root", "idea"], true, &fresh),
            Err(MirrorError::MirrorsMissing(keys)) if keys == vec!["idea".to_string()]
        ));
    }
}
