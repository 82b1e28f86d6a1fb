//! Persistent-network queries used during uniquification.
//!
//! # Responsibility
//! - Look up persistent neurons structurally identical to a transient one.
//! - Check whether a persistent terminal already links two neurons.
//! - Resolve persistent neurons by mirror/external URL.
//!
//! # Invariants
//! - Everything returned is flagged persistent (`is_transient = false`).
//! - Restricted queries fail with `ResultLimitExceeded` rather than truncate.

use super::{parse_uuid, RepoError, RepoResult};
use crate::db::ensure_connection_ready;
use crate::model::network::Network;
use crate::model::neuron::{Neuron, NeuronId};
use crate::model::terminal::{NeurotransmitterEffect, Terminal};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

/// Query contract against the durable store.
pub trait NetworkQueryRepository {
    /// Depth-1 outbound lookup by exact tag and exact postsynaptic id set.
    ///
    /// Returns every matching neuron with its terminals and postsynaptic
    /// neurons; an empty network means no match. More than one matching
    /// neuron is returned as-is and left to the caller to reject.
    fn find_identical_neuron(
        &self,
        tag: Option<&str>,
        postsynaptic_ids: &BTreeSet<NeuronId>,
    ) -> RepoResult<Network>;

    /// Returns whether a persistent terminal links `presynaptic_id` to
    /// `postsynaptic_id`.
    fn has_identical_terminal(
        &self,
        presynaptic_id: NeuronId,
        postsynaptic_id: NeuronId,
    ) -> RepoResult<bool>;

    /// Returns persistent neurons whose external URL is one of `urls`.
    fn get_by_external_urls(&self, urls: &[String]) -> RepoResult<Vec<Neuron>>;
}

impl<T: NetworkQueryRepository + ?Sized> NetworkQueryRepository for &T {
    fn find_identical_neuron(
        &self,
        tag: Option<&str>,
        postsynaptic_ids: &BTreeSet<NeuronId>,
    ) -> RepoResult<Network> {
        (**self).find_identical_neuron(tag, postsynaptic_ids)
    }

    fn has_identical_terminal(
        &self,
        presynaptic_id: NeuronId,
        postsynaptic_id: NeuronId,
    ) -> RepoResult<bool> {
        (**self).has_identical_terminal(presynaptic_id, postsynaptic_id)
    }

    fn get_by_external_urls(&self, urls: &[String]) -> RepoResult<Vec<Neuron>> {
        (**self).get_by_external_urls(urls)
    }
}

/// SQLite-backed query repository over the event-store projections.
pub struct SqliteNetworkQueryRepository<'conn> {
    conn: &'conn Connection,
    result_limit: u32,
}

impl<'conn> SqliteNetworkQueryRepository<'conn> {
    /// Creates repository from a migrated connection.
    ///
    /// `result_limit` caps the item count of restricted queries and must be
    /// greater than zero.
    pub fn try_new(conn: &'conn Connection, result_limit: u32) -> RepoResult<Self> {
        if result_limit == 0 {
            return Err(RepoError::InvalidArgument(
                "query result limit must be greater than zero".to_string(),
            ));
        }
        ensure_connection_ready(conn)?;
        Ok(Self { conn, result_limit })
    }

    pub fn result_limit(&self) -> u32 {
        self.result_limit
    }

    fn candidate_ids(
        &self,
        tag: Option<&str>,
        postsynaptic_ids: &BTreeSet<NeuronId>,
    ) -> RepoResult<Vec<NeuronId>> {
        let mut ids = Vec::new();
        match postsynaptic_ids.iter().next() {
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT n.uuid
                     FROM neurons n
                     WHERE n.tag IS ?1
                       AND NOT EXISTS (
                         SELECT 1 FROM terminals t WHERE t.presynaptic_uuid = n.uuid
                       )
                     ORDER BY n.uuid ASC;",
                )?;
                let mut rows = stmt.query(params![tag])?;
                while let Some(row) = rows.next()? {
                    let value: String = row.get(0)?;
                    ids.push(parse_uuid(&value, "neurons.uuid")?);
                }
            }
            Some(first) => {
                let mut stmt = self.conn.prepare(
                    "SELECT DISTINCT n.uuid
                     FROM neurons n
                     INNER JOIN terminals t ON t.presynaptic_uuid = n.uuid
                     WHERE n.tag IS ?1
                       AND t.postsynaptic_uuid = ?2
                     ORDER BY n.uuid ASC;",
                )?;
                let mut rows = stmt.query(params![tag, first.to_string()])?;
                while let Some(row) = rows.next()? {
                    let value: String = row.get(0)?;
                    ids.push(parse_uuid(&value, "neurons.uuid")?);
                }
            }
        }
        Ok(ids)
    }

    fn load_neuron(&self, id: NeuronId) -> RepoResult<Option<Neuron>> {
        self.conn
            .query_row(
                "SELECT uuid, tag, region_id, external_url
                 FROM neurons
                 WHERE uuid = ?1;",
                [id.to_string()],
                |row| Ok(parse_neuron_row(row)),
            )
            .optional()?
            .transpose()
    }

    fn load_terminals_of(&self, presynaptic_id: NeuronId) -> RepoResult<Vec<Terminal>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, presynaptic_uuid, postsynaptic_uuid, effect, strength
             FROM terminals
             WHERE presynaptic_uuid = ?1
             ORDER BY uuid ASC;",
        )?;
        let mut rows = stmt.query([presynaptic_id.to_string()])?;
        let mut terminals = Vec::new();
        while let Some(row) = rows.next()? {
            terminals.push(parse_terminal_row(row)?);
        }
        Ok(terminals)
    }

    fn ensure_within_limit(&self, count: usize) -> RepoResult<()> {
        if count > self.result_limit as usize {
            return Err(RepoError::ResultLimitExceeded {
                limit: self.result_limit,
                count,
            });
        }
        Ok(())
    }
}

impl NetworkQueryRepository for SqliteNetworkQueryRepository<'_> {
    fn find_identical_neuron(
        &self,
        tag: Option<&str>,
        postsynaptic_ids: &BTreeSet<NeuronId>,
    ) -> RepoResult<Network> {
        let mut result = Network::new();
        for candidate_id in self.candidate_ids(tag, postsynaptic_ids)? {
            let terminals = self.load_terminals_of(candidate_id)?;
            let targets: BTreeSet<NeuronId> = terminals
                .iter()
                .map(|terminal| terminal.postsynaptic_id)
                .collect();
            if &targets != postsynaptic_ids {
                continue;
            }

            let neuron = self.load_neuron(candidate_id)?.ok_or_else(|| {
                RepoError::InvalidData(format!("neuron {candidate_id} vanished during query"))
            })?;
            result.add_or_replace(neuron);
            for target_id in &targets {
                if let Some(target) = self.load_neuron(*target_id)? {
                    result.add_or_replace(target);
                }
            }
            result.add_or_replace_all(terminals);
        }

        self.ensure_within_limit(result.len())?;
        Ok(result)
    }

    fn has_identical_terminal(
        &self,
        presynaptic_id: NeuronId,
        postsynaptic_id: NeuronId,
    ) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM terminals
                WHERE presynaptic_uuid = ?1
                  AND postsynaptic_uuid = ?2
            );",
            params![presynaptic_id.to_string(), postsynaptic_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn get_by_external_urls(&self, urls: &[String]) -> RepoResult<Vec<Neuron>> {
        if urls.is_empty() {
            return Err(RepoError::InvalidArgument(
                "external url list must not be empty".to_string(),
            ));
        }

        let placeholders = vec!["?"; urls.len()].join(", ");
        let sql = format!(
            "SELECT uuid, tag, region_id, external_url
             FROM neurons
             WHERE external_url IN ({placeholders})
             ORDER BY uuid ASC;"
        );
        let bind_values: Vec<Value> = urls.iter().map(|url| Value::Text(url.clone())).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut neurons = Vec::new();
        while let Some(row) = rows.next()? {
            neurons.push(parse_neuron_row(row)?);
        }

        self.ensure_within_limit(neurons.len())?;
        Ok(neurons)
    }
}

fn parse_neuron_row(row: &Row<'_>) -> RepoResult<Neuron> {
    let uuid_text: String = row.get("uuid")?;
    let mut neuron = Neuron::persistent(parse_uuid(&uuid_text, "neurons.uuid")?);
    neuron.tag = row.get("tag")?;
    neuron.region_id = row
        .get::<_, Option<String>>("region_id")?
        .map(|value| parse_uuid(&value, "neurons.region_id"))
        .transpose()?;
    neuron.external_url = row.get("external_url")?;
    Ok(neuron)
}

fn parse_terminal_row(row: &Row<'_>) -> RepoResult<Terminal> {
    let uuid_text: String = row.get("uuid")?;
    let presynaptic_text: String = row.get("presynaptic_uuid")?;
    let postsynaptic_text: String = row.get("postsynaptic_uuid")?;
    let effect_text: String = row.get("effect")?;
    let effect = NeurotransmitterEffect::parse(&effect_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid effect `{effect_text}` in terminals.effect"))
    })?;
    let strength: f64 = row.get("strength")?;

    Ok(Terminal::persistent(
        parse_uuid(&uuid_text, "terminals.uuid")?,
        parse_uuid(&presynaptic_text, "terminals.presynaptic_uuid")?,
        parse_uuid(&postsynaptic_text, "terminals.postsynaptic_uuid")?,
        effect,
        strength as f32,
    ))
}

#[cfg(test)]
mod tests {
    use super::{NetworkQueryRepository, SqliteNetworkQueryRepository};
    use crate::db::open_db_in_memory;
    use crate::model::neuron::Neuron;
    use crate::model::terminal::Terminal;
    use crate::repo::aggregate_repo::{
        NeuronAggregateRepository, SqliteAggregateRepository, TerminalAggregateRepository,
    };
    use crate::repo::RepoError;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn persist_neuron(repo: &SqliteAggregateRepository<'_>, tag: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        let version = repo.create_neuron(id).unwrap();
        if let Some(tag) = tag {
            repo.change_tag(id, tag, version).unwrap();
        }
        id
    }

    fn persist_terminal(repo: &SqliteAggregateRepository<'_>, pre: Uuid, post: Uuid) {
        repo.create_terminal(&Terminal::new_transient(pre, post))
            .unwrap();
    }

    #[test]
    fn exact_target_set_is_required() {
        let conn = open_db_in_memory().unwrap();
        let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
        let b = persist_neuron(&writer, Some("b"));
        let c = persist_neuron(&writer, Some("c"));
        let exact = persist_neuron(&writer, Some("x"));
        persist_terminal(&writer, exact, b);
        let superset = persist_neuron(&writer, Some("x"));
        persist_terminal(&writer, superset, b);
        persist_terminal(&writer, superset, c);

        let query = SqliteNetworkQueryRepository::try_new(&conn, 100).unwrap();
        let result = query
            .find_identical_neuron(Some("x"), &BTreeSet::from([b]))
            .unwrap();

        assert!(result.try_get::<Neuron>(exact).is_some());
        assert!(result.try_get::<Neuron>(superset).is_none());
        assert!(result.try_get::<Neuron>(b).is_some());
        assert_eq!(result.outgoing_edges(exact).len(), 1);
    }

    #[test]
    fn untagged_leaf_matches_only_untagged_leaf() {
        let conn = open_db_in_memory().unwrap();
        let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
        let untagged = persist_neuron(&writer, None);
        let tagged = persist_neuron(&writer, Some("x"));

        let query = SqliteNetworkQueryRepository::try_new(&conn, 100).unwrap();
        let result = query.find_identical_neuron(None, &BTreeSet::new()).unwrap();
        let ids: Vec<Uuid> = result.items::<Neuron>().map(|n| n.id).collect();
        assert_eq!(ids, vec![untagged]);

        let result = query
            .find_identical_neuron(Some("x"), &BTreeSet::new())
            .unwrap();
        let ids: Vec<Uuid> = result.items::<Neuron>().map(|n| n.id).collect();
        assert_eq!(ids, vec![tagged]);
    }

    #[test]
    fn result_limit_is_enforced() {
        let conn = open_db_in_memory().unwrap();
        let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
        let b = persist_neuron(&writer, Some("b"));
        let a = persist_neuron(&writer, Some("a"));
        persist_terminal(&writer, a, b);

        let query = SqliteNetworkQueryRepository::try_new(&conn, 2).unwrap();
        let err = query
            .find_identical_neuron(Some("a"), &BTreeSet::from([b]))
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::ResultLimitExceeded { limit: 2, count: 3 }
        ));

        assert!(matches!(
            SqliteNetworkQueryRepository::try_new(&conn, 0),
            Err(RepoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn terminal_existence_and_url_lookup() {
        let conn = open_db_in_memory().unwrap();
        let writer = SqliteAggregateRepository::try_new(&conn).unwrap();
        let a = persist_neuron(&writer, None);
        let b = persist_neuron(&writer, None);
        persist_terminal(&writer, a, b);
        let v = writer.current_version(b).unwrap();
        writer
            .change_external_url(b, "https://example.org/b", v)
            .unwrap();

        let query = SqliteNetworkQueryRepository::try_new(&conn, 10).unwrap();
        assert!(query.has_identical_terminal(a, b).unwrap());
        assert!(!query.has_identical_terminal(b, a).unwrap());

        let found = query
            .get_by_external_urls(&["https://example.org/b".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b);
        assert!(matches!(
            query.get_by_external_urls(&[]),
            Err(RepoError::InvalidArgument(_))
        ));
    }
}
