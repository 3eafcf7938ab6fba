//! Registry of component types.

use std::sync::Arc;

use anyhow::bail;
use fxhash::FxHashMap;

use super::schema::{Arguments, ArgumentsSpec, ExportsSpec};
use super::{Component, ComponentOptions};

/// Factory producing a live component instance from the controller-provided
/// options and the initial arguments.
pub type BuildFn =
    Arc<dyn Fn(ComponentOptions, Arguments) -> anyhow::Result<Arc<dyn Component>> + Send + Sync>;

/// Everything the controller needs to know about one component type.
#[derive(Clone)]
pub struct Registration {
    /// Dotted type name, e.g. `remote.http`.
    pub name: String,
    /// Shape of the arguments the evaluator binds for this type.
    pub args: ArgumentsSpec,
    /// Shape of the exports instances of this type publish. `None` means the
    /// type exports nothing: published values are dropped and references to
    /// its exports are rejected at load time.
    pub exports: Option<ExportsSpec>,
    pub build: BuildFn,
}

impl Registration {
    pub fn new<F>(name: impl Into<String>, args: ArgumentsSpec, build: F) -> Self
    where
        F: Fn(ComponentOptions, Arguments) -> anyhow::Result<Arc<dyn Component>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            args,
            exports: None,
            build: Arc::new(build),
        }
    }

    pub fn with_exports(mut self, exports: ExportsSpec) -> Self {
        self.exports = Some(exports);
        self
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("has_exports", &self.exports.is_some())
            .finish_non_exhaustive()
    }
}

/// The set of component types known to a controller.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    by_name: FxHashMap<String, Registration>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component type. Registering the same name twice is an error.
    pub fn register(&mut self, registration: Registration) -> anyhow::Result<()> {
        let name = registration.name.clone();
        if self.by_name.insert(name.clone(), registration).is_some() {
            bail!("component type {name:?} registered twice");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
