//! Aggregate write adapters and the SQLite append-only event store.
//!
//! # Responsibility
//! - Define per-neuron and per-terminal write contracts.
//! - Append one event per write and keep read projections in step.
//!
//! # Invariants
//! - `create_neuron` returns version 1; every later write returns
//!   `expected + 1` or fails with `VersionConflict`.
//! - Events are never updated or deleted.
//! - Atomicity across several writes is provided by the caller's outer
//!   transaction (`db::begin_transaction`).

use super::{parse_uuid, RepoError, RepoResult};
use crate::db::ensure_connection_ready;
use crate::model::neuron::{Neuron, NeuronId};
use crate::model::terminal::{NeurotransmitterEffect, Terminal, TerminalId};
use crate::model::ItemValidationError;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optimistic-concurrency counter of one aggregate.
pub type AggregateVersion = i64;

/// Events recorded against a neuron aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NeuronEvent {
    NeuronCreated,
    TagChanged { tag: String },
    RegionChanged { region_id: Uuid },
    ExternalUrlChanged { url: String },
}

/// Event recorded when a terminal aggregate is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalCreated {
    pub presynaptic_id: NeuronId,
    pub postsynaptic_id: NeuronId,
    pub effect: NeurotransmitterEffect,
    pub strength: f32,
}

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub aggregate_id: Uuid,
    pub version: AggregateVersion,
    pub event_type: String,
    pub payload: String,
}

/// Write contract for neuron aggregates.
pub trait NeuronAggregateRepository {
    /// Creates a bare neuron and returns its initial version.
    fn create_neuron(&self, id: NeuronId) -> RepoResult<AggregateVersion>;
    fn change_tag(
        &self,
        id: NeuronId,
        tag: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion>;
    fn change_region(
        &self,
        id: NeuronId,
        region_id: Uuid,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion>;
    fn change_external_url(
        &self,
        id: NeuronId,
        url: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion>;
}

/// Write contract for terminal aggregates.
pub trait TerminalAggregateRepository {
    fn create_terminal(&self, terminal: &Terminal) -> RepoResult<()>;
}

impl<T: NeuronAggregateRepository + ?Sized> NeuronAggregateRepository for &T {
    fn create_neuron(&self, id: NeuronId) -> RepoResult<AggregateVersion> {
        (**self).create_neuron(id)
    }

    fn change_tag(
        &self,
        id: NeuronId,
        tag: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        (**self).change_tag(id, tag, expected_version)
    }

    fn change_region(
        &self,
        id: NeuronId,
        region_id: Uuid,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        (**self).change_region(id, region_id, expected_version)
    }

    fn change_external_url(
        &self,
        id: NeuronId,
        url: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        (**self).change_external_url(id, url, expected_version)
    }
}

impl<T: TerminalAggregateRepository + ?Sized> TerminalAggregateRepository for &T {
    fn create_terminal(&self, terminal: &Terminal) -> RepoResult<()> {
        (**self).create_terminal(terminal)
    }
}

/// SQLite-backed event store implementing both aggregate contracts.
pub struct SqliteAggregateRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAggregateRepository<'conn> {
    /// Creates repository from a migrated connection or transaction.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn)?;
        Ok(Self { conn })
    }

    /// Returns the current version of an aggregate, `0` when it has no events.
    pub fn current_version(&self, aggregate_id: Uuid) -> RepoResult<AggregateVersion> {
        let version = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0)
             FROM events
             WHERE aggregate_id = ?1;",
            [aggregate_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Loads the event log of one aggregate in version order.
    pub fn load_events(&self, aggregate_id: Uuid) -> RepoResult<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT aggregate_id, version, event_type, payload
             FROM events
             WHERE aggregate_id = ?1
             ORDER BY version ASC;",
        )?;
        let mut rows = stmt.query([aggregate_id.to_string()])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get(0)?;
            events.push(StoredEvent {
                aggregate_id: parse_uuid(&id_text, "events.aggregate_id")?,
                version: row.get(1)?,
                event_type: row.get(2)?,
                payload: row.get(3)?,
            });
        }
        Ok(events)
    }

    /// Rebuilds a neuron from its event log.
    pub fn replay_neuron(&self, id: NeuronId) -> RepoResult<Option<Neuron>> {
        let events = self.load_events(id)?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut neuron = Neuron::persistent(id);
        for stored in events {
            let event: NeuronEvent = serde_json::from_str(&stored.payload).map_err(|err| {
                RepoError::InvalidData(format!(
                    "invalid neuron event payload at {id} v{}: {err}",
                    stored.version
                ))
            })?;
            match event {
                NeuronEvent::NeuronCreated => {}
                NeuronEvent::TagChanged { tag } => neuron.tag = Some(tag),
                NeuronEvent::RegionChanged { region_id } => neuron.region_id = Some(region_id),
                NeuronEvent::ExternalUrlChanged { url } => neuron.external_url = Some(url),
            }
        }
        Ok(Some(neuron))
    }

    fn append(
        &self,
        aggregate_id: Uuid,
        version: AggregateVersion,
        event_type: &str,
        payload: &impl Serialize,
    ) -> RepoResult<()> {
        let payload = serde_json::to_string(payload).map_err(|err| {
            RepoError::InvalidData(format!("cannot encode `{event_type}` payload: {err}"))
        })?;
        self.conn.execute(
            "INSERT INTO events (aggregate_id, version, event_type, payload)
             VALUES (?1, ?2, ?3, ?4);",
            params![aggregate_id.to_string(), version, event_type, payload],
        )?;
        Ok(())
    }

    /// Checks `expected` against the stored version and returns the next one.
    fn next_version(
        &self,
        aggregate_id: Uuid,
        expected: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        let actual = self.current_version(aggregate_id)?;
        if actual == 0 {
            return Err(RepoError::AggregateNotFound(aggregate_id));
        }
        if actual != expected {
            return Err(RepoError::VersionConflict {
                aggregate_id,
                expected,
                actual,
            });
        }
        Ok(actual + 1)
    }

    fn change_neuron(
        &self,
        id: NeuronId,
        expected_version: AggregateVersion,
        event: NeuronEvent,
        projection_sql: &str,
        projection_value: &str,
    ) -> RepoResult<AggregateVersion> {
        let version = self.next_version(id, expected_version)?;
        let changed = self
            .conn
            .execute(projection_sql, params![id.to_string(), projection_value])?;
        if changed == 0 {
            return Err(RepoError::AggregateNotFound(id));
        }
        self.append(id, version, event_type_of(&event), &event)?;
        Ok(version)
    }
}

impl NeuronAggregateRepository for SqliteAggregateRepository<'_> {
    fn create_neuron(&self, id: NeuronId) -> RepoResult<AggregateVersion> {
        if self.current_version(id)? != 0 {
            return Err(RepoError::AlreadyExists(id));
        }
        let event = NeuronEvent::NeuronCreated;
        self.append(id, 1, event_type_of(&event), &event)?;
        self.conn.execute(
            "INSERT INTO neurons (uuid, tag, region_id, external_url)
             VALUES (?1, NULL, NULL, NULL);",
            [id.to_string()],
        )?;
        Ok(1)
    }

    fn change_tag(
        &self,
        id: NeuronId,
        tag: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        if tag.trim().is_empty() {
            return Err(ItemValidationError::BlankTag.into());
        }
        self.change_neuron(
            id,
            expected_version,
            NeuronEvent::TagChanged {
                tag: tag.to_string(),
            },
            "UPDATE neurons SET tag = ?2 WHERE uuid = ?1;",
            tag,
        )
    }

    fn change_region(
        &self,
        id: NeuronId,
        region_id: Uuid,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        self.change_neuron(
            id,
            expected_version,
            NeuronEvent::RegionChanged { region_id },
            "UPDATE neurons SET region_id = ?2 WHERE uuid = ?1;",
            &region_id.to_string(),
        )
    }

    fn change_external_url(
        &self,
        id: NeuronId,
        url: &str,
        expected_version: AggregateVersion,
    ) -> RepoResult<AggregateVersion> {
        if !crate::model::neuron::is_absolute_url(url) {
            return Err(ItemValidationError::InvalidExternalUrl(url.to_string()).into());
        }
        self.change_neuron(
            id,
            expected_version,
            NeuronEvent::ExternalUrlChanged {
                url: url.to_string(),
            },
            "UPDATE neurons SET external_url = ?2 WHERE uuid = ?1;",
            url,
        )
    }
}

impl TerminalAggregateRepository for SqliteAggregateRepository<'_> {
    fn create_terminal(&self, terminal: &Terminal) -> RepoResult<()> {
        terminal.validate()?;
        let id: TerminalId = terminal.id;
        if self.current_version(id)? != 0 {
            return Err(RepoError::AlreadyExists(id));
        }

        let event = TerminalCreated {
            presynaptic_id: terminal.presynaptic_id,
            postsynaptic_id: terminal.postsynaptic_id,
            effect: terminal.effect,
            strength: terminal.strength,
        };
        self.append(id, 1, "terminal_created", &event)?;
        self.conn.execute(
            "INSERT INTO terminals (uuid, presynaptic_uuid, postsynaptic_uuid, effect, strength)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                id.to_string(),
                terminal.presynaptic_id.to_string(),
                terminal.postsynaptic_id.to_string(),
                terminal.effect.as_str(),
                f64::from(terminal.strength),
            ],
        )?;
        Ok(())
    }
}

fn event_type_of(event: &NeuronEvent) -> &'static str {
    match event {
        NeuronEvent::NeuronCreated => "neuron_created",
        NeuronEvent::TagChanged { .. } => "tag_changed",
        NeuronEvent::RegionChanged { .. } => "region_changed",
        NeuronEvent::ExternalUrlChanged { .. } => "external_url_changed",
    }
}
