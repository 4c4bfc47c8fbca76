use super::messages::MessagesModule;
use super::pruning::PruningModule;
use super::{Module, Modules};
use crate::repository::Repository;
use crate::runtime::config::IndexerConfig;
use crate::source::Source;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Collaborators handed to module factories.
#[derive(Clone)]
pub struct ModuleContext {
    pub source: Arc<dyn Source>,
    pub repository: Arc<dyn Repository>,
    pub config: IndexerConfig,
}

pub type ModuleFactory = Box<dyn Fn(&ModuleContext) -> Result<Arc<dyn Module>> + Send + Sync>;

/// Name to factory lookup built once at startup.
///
/// The registry is an ordinary value handed to the indexer; nothing is
/// registered globally.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `messages` and `pruning` modules.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert(MessagesModule::NAME.to_owned(), Box::new(MessagesModule::build));
        registry
            .factories
            .insert(PruningModule::NAME.to_owned(), Box::new(PruningModule::build));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ModuleContext) -> Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            bail!("module {name} is already registered");
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Registers an already-built module instance under its own name.
    pub fn register_instance(&mut self, module: Arc<dyn Module>) -> Result<()> {
        let name = module.name().to_owned();
        self.register(name, move |_| Ok(module.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiates `names` in the given order.
    pub fn build(&self, names: &[String], ctx: &ModuleContext) -> Result<Modules> {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let factory = self
                .factories
                .get(name)
                .with_context(|| format!("unknown module {name}"))?;
            let module =
                factory(ctx).with_context(|| format!("failed to initialize module {name}"))?;
            tracing::debug!(module = %name, "module initialized");
            entries.push(module);
        }
        Ok(Modules::new(entries))
    }
}
