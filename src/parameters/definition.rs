//! Immutable descriptors of the parameters a model function takes.

use serde::{Deserialize, Serialize};

/// Describes one parameter of a model function.
///
/// Definitions are created once per model and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Name of the parameter, as used in formulas.
    pub name: String,

    /// Whether the parameter is fixed unless told otherwise.
    #[serde(default)]
    pub fixed_by_default: bool,

    /// Whether the parameter may take a different value for each dataset.
    /// Parameters that cannot are always global.
    #[serde(default = "default_buffer_specific")]
    pub can_be_buffer_specific: bool,
}

fn default_buffer_specific() -> bool {
    true
}

impl ParameterDefinition {
    /// A free, per-dataset parameter.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fixed_by_default: false,
            can_be_buffer_specific: true,
        }
    }

    /// A parameter that starts out fixed.
    pub fn fixed(name: &str) -> Self {
        Self {
            fixed_by_default: true,
            ..Self::new(name)
        }
    }

    /// A parameter shared by all datasets.
    pub fn global(name: &str) -> Self {
        Self {
            can_be_buffer_specific: false,
            ..Self::new(name)
        }
    }
}

/// Builds definitions for a list of names.
pub fn definitions(names: &[&str]) -> Vec<ParameterDefinition> {
    names.iter().map(|n| ParameterDefinition::new(n)).collect()
}
