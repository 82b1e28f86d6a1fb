//! Graph domain model for the persisted semantic network.
//!
//! # Responsibility
//! - Define neurons (typed nodes) and terminals (directed, attributed edges).
//! - Provide the in-memory `Network` container used by merge operations.
//!
//! # Invariants
//! - Every item is identified by a stable `Uuid` that is never reassigned.
//! - Transient items are not durable until the save orchestrator commits them.
//! - Structural identity is `(tag, set of postsynaptic ids)`, never the id alone.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod network;
pub mod neuron;
pub mod terminal;

/// Validation failures for network items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemValidationError {
    /// A tag was provided but contains only whitespace.
    BlankTag,
    /// A mirror/external URL was provided but is not an absolute URL.
    InvalidExternalUrl(String),
    /// Terminal strength is NaN or infinite.
    NonFiniteStrength,
}

impl Display for ItemValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankTag => write!(f, "tag must not be blank when present"),
            Self::InvalidExternalUrl(value) => {
                write!(f, "external url must be absolute (scheme://...): `{value}`")
            }
            Self::NonFiniteStrength => write!(f, "terminal strength must be a finite number"),
        }
    }
}

impl Error for ItemValidationError {}
