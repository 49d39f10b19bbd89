//! Engines by name.
//!
//! The rest of the crate never names an engine type: it asks the registry
//! for a name and gets a boxed [`FitEngine`].

use super::lm::{lm_options, LmEngine, LmVariant};
use super::pso::{pso_options, ParticleSwarmEngine};
use super::qsoas::{qsoas_options, QSoasEngine};
use super::simplex::{simplex_options, SimplexEngine};
use super::{EngineOptionSpec, FitEngine};
use crate::error::{FitError, Result};
use crate::fit::FitContext;
use std::sync::{Arc, OnceLock};

/// Builds an engine for a context.
pub type EngineCreator = fn(Arc<FitContext>) -> Box<dyn FitEngine>;

/// One registered engine.
#[derive(Clone)]
pub struct EngineFactoryItem {
    /// Name used to select the engine.
    pub name: &'static str,
    /// Human-readable name.
    pub public_name: &'static str,
    pub creator: EngineCreator,
    /// Schema of the engine-specific options.
    pub options: fn() -> Vec<EngineOptionSpec>,
}

impl std::fmt::Debug for EngineFactoryItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineFactoryItem")
            .field("name", &self.name)
            .field("public_name", &self.public_name)
            .finish()
    }
}

/// Named engine constructors, in registration order.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    items: Vec<EngineFactoryItem>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every engine of the crate.
    pub fn with_default_engines() -> Self {
        let mut registry = Self::new();
        registry.register(EngineFactoryItem {
            name: "qsoas",
            public_name: "QSoas Levenberg-Marquardt",
            creator: |c| Box::new(QSoasEngine::new(c)),
            options: qsoas_options,
        });
        registry.register(EngineFactoryItem {
            name: "lm",
            public_name: "Unscaled Levenberg-Marquardt",
            creator: |c| Box::new(LmEngine::new(c, LmVariant::Unscaled)),
            options: lm_options,
        });
        registry.register(EngineFactoryItem {
            name: "lm-scaled",
            public_name: "Scaled Levenberg-Marquardt",
            creator: |c| Box::new(LmEngine::new(c, LmVariant::Scaled)),
            options: lm_options,
        });
        registry.register(EngineFactoryItem {
            name: "lm-nielsen",
            public_name: "Levenberg-Marquardt with Nielsen damping",
            creator: |c| Box::new(LmEngine::new(c, LmVariant::Nielsen)),
            options: lm_options,
        });
        registry.register(EngineFactoryItem {
            name: "simplex",
            public_name: "Nelder-Mead simplex",
            creator: |c| Box::new(SimplexEngine::new(c)),
            options: simplex_options,
        });
        registry.register(EngineFactoryItem {
            name: "pso",
            public_name: "Particle swarm optimizer",
            creator: |c| Box::new(ParticleSwarmEngine::new(c)),
            options: pso_options,
        });
        #[cfg(feature = "odr")]
        registry.register(EngineFactoryItem {
            name: "odrpack",
            public_name: "Orthogonal distance regression",
            creator: |c| Box::new(super::odr::OdrEngine::new(c)),
            options: super::odr::odr_options,
        });
        registry
    }

    /// Adds an engine, replacing any engine of the same name.
    pub fn register(&mut self, item: EngineFactoryItem) {
        match self.items.iter_mut().find(|i| i.name == item.name) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EngineFactoryItem> {
        self.items.iter().find(|i| i.name == name)
    }

    /// Creates the engine called `name` for `context`.
    ///
    /// # Errors
    ///
    /// [`FitError::UnknownEngine`] when nothing is registered under `name`.
    pub fn create(&self, name: &str, context: Arc<FitContext>) -> Result<Box<dyn FitEngine>> {
        let item = self.get(name).ok_or_else(|| {
            FitError::UnknownEngine(format!("'{}' (available: {})", name, self.names().join(", ")))
        })?;
        Ok((item.creator)(context))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.items.iter().map(|i| i.name).collect()
    }

    pub fn items(&self) -> &[EngineFactoryItem] {
        &self.items
    }
}

/// The shared registry holding the default engines.
pub fn default_registry() -> &'static EngineRegistry {
    static REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();
    REGISTRY.get_or_init(EngineRegistry::with_default_engines)
}
