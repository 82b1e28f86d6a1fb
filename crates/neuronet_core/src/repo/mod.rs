//! Backing-store collaborators and their SQLite implementations.
//!
//! # Responsibility
//! - Define the query and aggregate-write contracts the merge engine and the
//!   save orchestrator consume.
//! - Isolate SQL details from service orchestration.
//!
//! # Invariants
//! - Aggregate writes are append-only and optimistically versioned.
//! - Read paths reject invalid persisted state instead of masking it.
//! - Restricted queries never return more items than the configured limit.

use crate::db::DbError;
use crate::model::ItemValidationError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod aggregate_repo;
pub mod query_repo;

pub use aggregate_repo::AggregateVersion;

pub type RepoResult<T> = Result<T, RepoError>;

/// Error for backing-store reads and writes.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    Validation(ItemValidationError),
    /// Rejected before any store access (empty collections, zero limits).
    InvalidArgument(String),
    InvalidData(String),
    AlreadyExists(Uuid),
    AggregateNotFound(Uuid),
    /// Optimistic-concurrency check failed.
    VersionConflict {
        aggregate_id: Uuid,
        expected: AggregateVersion,
        actual: AggregateVersion,
    },
    ResultLimitExceeded {
        limit: u32,
        count: usize,
    },
    /// Remote-backed collaborator failed or timed out.
    Unavailable(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted network data: {message}"),
            Self::AlreadyExists(id) => write!(f, "aggregate already exists: {id}"),
            Self::AggregateNotFound(id) => write!(f, "aggregate not found: {id}"),
            Self::VersionConflict {
                aggregate_id,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on aggregate {aggregate_id}: expected {expected}, found {actual}"
            ),
            Self::ResultLimitExceeded { limit, count } => {
                write!(f, "query results cannot exceed {limit} items, got {count}")
            }
            Self::Unavailable(message) => write!(f, "backing store unavailable: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ItemValidationError> for RepoError {
    fn from(value: ItemValidationError) -> Self {
        Self::Validation(value)
    }
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}
