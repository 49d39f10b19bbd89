//! Engine-specific options and their schema.

use crate::error::{FitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of value an option takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Number,
    Integer,
    Flag,
}

/// Describes one engine option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOptionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: OptionKind,
}

impl EngineOptionSpec {
    pub const fn number(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: OptionKind::Number,
        }
    }

    pub const fn integer(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: OptionKind::Integer,
        }
    }

    pub const fn flag(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: OptionKind::Flag,
        }
    }
}

/// Values of engine options, by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineOptions(BTreeMap<String, f64>);

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Checks every value against `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::InvalidOption`] for unknown names, non-finite
    /// values and non-integer values of integer options.
    pub fn validate(&self, schema: &[EngineOptionSpec]) -> Result<()> {
        for (name, value) in self.iter() {
            let spec = schema.iter().find(|s| s.name == name).ok_or_else(|| {
                let known: Vec<&str> = schema.iter().map(|s| s.name).collect();
                FitError::InvalidOption(format!(
                    "unknown option '{}' (known: {})",
                    name,
                    known.join(", ")
                ))
            })?;
            if !value.is_finite() {
                return Err(FitError::InvalidOption(format!(
                    "option '{}' is not finite",
                    name
                )));
            }
            let integral = value.fract() == 0.0;
            match spec.kind {
                OptionKind::Integer if !integral || value < 0.0 => {
                    return Err(FitError::InvalidOption(format!(
                        "option '{}' must be a non-negative integer, got {}",
                        name, value
                    )))
                }
                OptionKind::Flag if value != 0.0 && value != 1.0 => {
                    return Err(FitError::InvalidOption(format!(
                        "option '{}' must be 0 or 1, got {}",
                        name, value
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Overwrites `target` when the option is present.
    pub fn update(&self, name: &str, target: &mut f64) {
        if let Some(v) = self.get(name) {
            *target = v;
        }
    }

    pub fn update_usize(&self, name: &str, target: &mut usize) {
        if let Some(v) = self.get(name) {
            *target = v as usize;
        }
    }

    pub fn update_bool(&self, name: &str, target: &mut bool) {
        if let Some(v) = self.get(name) {
            *target = v != 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: [EngineOptionSpec; 3] = [
        EngineOptionSpec::number("lambda", "damping"),
        EngineOptionSpec::integer("particles", "population"),
        EngineOptionSpec::flag("scaling", "scale"),
    ];

    #[test]
    fn test_validate() {
        let ok = EngineOptions::new()
            .with("lambda", 0.5)
            .with("particles", 20.0)
            .with("scaling", 1.0);
        assert!(ok.validate(&SCHEMA).is_ok());

        assert!(EngineOptions::new().with("nope", 1.0).validate(&SCHEMA).is_err());
        assert!(EngineOptions::new().with("particles", 2.5).validate(&SCHEMA).is_err());
        assert!(EngineOptions::new().with("scaling", 3.0).validate(&SCHEMA).is_err());
        assert!(EngineOptions::new()
            .with("lambda", f64::NAN)
            .validate(&SCHEMA)
            .is_err());
    }

    #[test]
    fn test_update_and_serde() {
        let opts: EngineOptions = serde_json::from_str(r#"{"lambda": 0.1, "particles": 7}"#).unwrap();
        let mut lambda = 1.0;
        let mut particles = 50;
        let mut untouched = 3.0;
        opts.update("lambda", &mut lambda);
        opts.update_usize("particles", &mut particles);
        opts.update("scale", &mut untouched);
        assert_eq!(lambda, 0.1);
        assert_eq!(particles, 7);
        assert_eq!(untouched, 3.0);
    }
}
