//! Neuron domain model.
//!
//! # Responsibility
//! - Define the graph vertex shared by the merge engine and the save path.
//! - Provide transient/persistent constructors and validation.
//!
//! # Invariants
//! - `id` is stable and never reused for another neuron.
//! - `tag` and `external_url`, when set, are non-blank.
//! - `is_transient` is `true` until the neuron is durably committed.

use super::ItemValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static EXTERNAL_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://\S+$").expect("valid external url regex")
});

/// Stable identifier of a neuron.
pub type NeuronId = Uuid;

/// Graph vertex with an optional label, region and mirror pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neuron {
    pub id: NeuronId,
    /// Optional label; part of the structural signature.
    pub tag: Option<String>,
    /// Region (aggregate) the neuron is assigned to.
    pub region_id: Option<Uuid>,
    /// Mirror/external-reference pointer.
    pub external_url: Option<String>,
    pub is_transient: bool,
}

impl Neuron {
    /// Creates a transient neuron with a generated id.
    pub fn new_transient() -> Self {
        Self::transient(Uuid::new_v4())
    }

    /// Creates a transient neuron with a caller-provided id.
    pub fn transient(id: NeuronId) -> Self {
        Self {
            id,
            tag: None,
            region_id: None,
            external_url: None,
            is_transient: true,
        }
    }

    /// Creates a neuron that is already durable in the backing store.
    pub fn persistent(id: NeuronId) -> Self {
        Self {
            is_transient: false,
            ..Self::transient(id)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_region(mut self, region_id: Uuid) -> Self {
        self.region_id = Some(region_id);
        self
    }

    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = Some(url.into());
        self
    }

    /// Returns a copy flagged as persistent, as recorded after a commit.
    pub fn clone_as_persistent(&self) -> Self {
        Self {
            is_transient: false,
            ..self.clone()
        }
    }

    /// Validates optional fields before persistence.
    pub fn validate(&self) -> Result<(), ItemValidationError> {
        if let Some(tag) = &self.tag {
            if tag.trim().is_empty() {
                return Err(ItemValidationError::BlankTag);
            }
        }
        if let Some(url) = &self.external_url {
            if !is_absolute_url(url) {
                return Err(ItemValidationError::InvalidExternalUrl(url.clone()));
            }
        }
        Ok(())
    }
}

/// Returns whether `value` looks like an absolute `scheme://...` URL.
pub fn is_absolute_url(value: &str) -> bool {
    EXTERNAL_URL_RE.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::{is_absolute_url, Neuron};
    use crate::model::ItemValidationError;
    use uuid::Uuid;

    #[test]
    fn clone_as_persistent_keeps_fields_and_clears_transient_flag() {
        let region = Uuid::new_v4();
        let neuron = Neuron::new_transient()
            .with_tag("x")
            .with_region(region)
            .with_external_url("https://example.org/a");

        let persisted = neuron.clone_as_persistent();
        assert!(neuron.is_transient);
        assert!(!persisted.is_transient);
        assert_eq!(persisted.id, neuron.id);
        assert_eq!(persisted.tag.as_deref(), Some("x"));
        assert_eq!(persisted.region_id, Some(region));
    }

    #[test]
    fn validate_rejects_blank_tag_and_relative_url() {
        let blank = Neuron::new_transient().with_tag("   ");
        assert_eq!(blank.validate(), Err(ItemValidationError::BlankTag));

        let relative = Neuron::new_transient().with_external_url("docs/a");
        assert!(matches!(
            relative.validate(),
            Err(ItemValidationError::InvalidExternalUrl(_))
        ));

        assert!(Neuron::new_transient().validate().is_ok());
    }

    #[test]
    fn absolute_url_detection() {
        assert!(is_absolute_url("https://example.org/x"));
        assert!(is_absolute_url("urn+x://item/1"));
        assert!(!is_absolute_url("://missing-scheme"));
        assert!(!is_absolute_url("https://has space"));
    }
}
