//! Terminal (directed edge) domain model.
//!
//! A terminal means "`presynaptic_id` influences `postsynaptic_id`".

use super::neuron::NeuronId;
use super::ItemValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a terminal.
pub type TerminalId = Uuid;

/// Influence a terminal exerts on its postsynaptic neuron.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeurotransmitterEffect {
    Excite,
    Inhibit,
}

impl NeurotransmitterEffect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excite => "excite",
            Self::Inhibit => "inhibit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "excite" => Some(Self::Excite),
            "inhibit" => Some(Self::Inhibit),
            _ => None,
        }
    }
}

/// Directed, attributed connection between two neurons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub presynaptic_id: NeuronId,
    pub postsynaptic_id: NeuronId,
    pub effect: NeurotransmitterEffect,
    pub strength: f32,
    pub is_transient: bool,
}

impl Terminal {
    /// Creates a transient excitatory terminal of strength `1.0`.
    pub fn new_transient(presynaptic_id: NeuronId, postsynaptic_id: NeuronId) -> Self {
        Self {
            id: Uuid::new_v4(),
            presynaptic_id,
            postsynaptic_id,
            effect: NeurotransmitterEffect::Excite,
            strength: 1.0,
            is_transient: true,
        }
    }

    /// Creates a terminal that is already durable in the backing store.
    pub fn persistent(
        id: TerminalId,
        presynaptic_id: NeuronId,
        postsynaptic_id: NeuronId,
        effect: NeurotransmitterEffect,
        strength: f32,
    ) -> Self {
        Self {
            id,
            presynaptic_id,
            postsynaptic_id,
            effect,
            strength,
            is_transient: false,
        }
    }

    pub fn with_effect(mut self, effect: NeurotransmitterEffect) -> Self {
        self.effect = effect;
        self
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength;
        self
    }

    /// Returns a copy flagged as persistent, as recorded after a commit.
    pub fn clone_as_persistent(&self) -> Self {
        Self {
            is_transient: false,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ItemValidationError> {
        if !self.strength.is_finite() {
            return Err(ItemValidationError::NonFiniteStrength);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{NeurotransmitterEffect, Terminal};
    use crate::model::ItemValidationError;
    use uuid::Uuid;

    #[test]
    fn effect_db_mapping_is_stable() {
        for effect in [NeurotransmitterEffect::Excite, NeurotransmitterEffect::Inhibit] {
            assert_eq!(NeurotransmitterEffect::parse(effect.as_str()), Some(effect));
        }
        assert_eq!(NeurotransmitterEffect::parse("Excite"), None);
    }

    #[test]
    fn validate_rejects_nan_strength() {
        let terminal =
            Terminal::new_transient(Uuid::new_v4(), Uuid::new_v4()).with_strength(f32::NAN);
        assert_eq!(
            terminal.validate(),
            Err(ItemValidationError::NonFiniteStrength)
        );
    }
}
