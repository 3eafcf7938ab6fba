//! The runtime wrapper around one component instance.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::component::{
    Arguments, Component, ComponentOptions, Health, HealthState, Registration,
};
use crate::config::{Block, Value};

use super::graph::NodeId;

/// Globals shared by every node of one controller.
pub(crate) struct NodeGlobals {
    /// Base directory for component data; each node gets a subdirectory.
    pub data_path: PathBuf,
    /// Advisory listen address of the enclosing HTTP server.
    pub http_listen_addr: String,
    /// Registry component metrics are registered on.
    pub metrics: prometheus::Registry,
    /// Called after a node's exports changed; enqueues it for re-evaluation
    /// of its dependents.
    pub on_exports_change: Box<dyn Fn(Arc<ComponentNode>) + Send + Sync>,
}

/// A node of the component graph: one configured component instance together
/// with its latest arguments, exports and health.
///
/// Arguments and exports are guarded by locks held only for the duration of
/// pointer swaps; readers take a clone of the `Arc` under the lock and use it
/// lock-free afterwards, so a running reader always observes a consistent
/// snapshot.
pub struct ComponentNode {
    id: NodeId,
    registration: Registration,
    globals: Arc<NodeGlobals>,
    /// Used to hand the exports hook to the component instance.
    self_ref: Weak<ComponentNode>,

    /// The user's block as most recently applied, kept for diagnostics and
    /// API reporting.
    block: Mutex<Block>,
    instance: Mutex<Option<Arc<dyn Component>>>,
    /// Signalled when `instance` transitions from empty to built.
    built: Notify,
    args: Mutex<Option<Arguments>>,
    /// Last valid exports. Retained across failed re-evaluations so that
    /// dependents keep a usable input value.
    exports: Mutex<Option<Arc<Value>>>,
    /// Health derived from configuration evaluation.
    eval_health: Mutex<Health>,
    /// Health derived from the worker lifecycle. `Exited` is terminal.
    run_health: Mutex<Health>,
}

impl ComponentNode {
    pub(crate) fn new(
        block: Block,
        registration: Registration,
        globals: Arc<NodeGlobals>,
    ) -> Arc<Self> {
        let id = NodeId::new(format!("{}.{}", block.name, block.label));
        Arc::new_cyclic(|self_ref| Self {
            id,
            registration,
            globals,
            self_ref: self_ref.clone(),
            block: Mutex::new(block),
            instance: Mutex::new(None),
            built: Notify::new(),
            args: Mutex::new(None),
            exports: Mutex::new(None),
            eval_health: Mutex::new(Health::unknown("component created")),
            run_health: Mutex::new(Health::unknown("component created")),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The component's dotted type name.
    pub fn component_name(&self) -> String {
        self.block.lock().unwrap().name.clone()
    }

    /// The user-chosen label.
    pub fn label(&self) -> String {
        self.block.lock().unwrap().label.clone()
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.registration
    }

    pub(crate) fn block(&self) -> Block {
        self.block.lock().unwrap().clone()
    }

    /// Swaps in the block from a newer apply. The node ID never changes.
    pub(crate) fn replace_block(&self, block: Block) {
        debug_assert_eq!(
            self.id.as_str(),
            format!("{}.{}", block.name, block.label),
            "a node keeps its ID for its whole life"
        );
        *self.block.lock().unwrap() = block;
    }

    /// Applies freshly bound arguments, building the component on first use.
    ///
    /// On failure the evaluation health becomes unhealthy with the error
    /// message; on success it becomes healthy. Previous exports are retained
    /// either way.
    pub(crate) fn update(&self, args: Arguments) -> anyhow::Result<()> {
        *self.args.lock().unwrap() = Some(args.clone());

        let existing = self.instance.lock().unwrap().clone();
        let result = match existing {
            Some(component) => component.update(args),
            None => self.build(args),
        };
        match &result {
            Ok(()) => self.set_eval_health(HealthState::Healthy, "component evaluated"),
            Err(e) => self.set_eval_health(HealthState::Unhealthy, format!("{e:#}")),
        }
        result
    }

    fn build(&self, args: Arguments) -> anyhow::Result<()> {
        let component = (self.registration.build)(self.options(), args)
            .with_context(|| format!("building component {}", self.id))?;
        *self.instance.lock().unwrap() = Some(component);
        self.built.notify_waiters();
        Ok(())
    }

    fn options(&self) -> ComponentOptions {
        let self_ref = self.self_ref.clone();
        ComponentOptions {
            id: self.id.to_string(),
            data_path: self.globals.data_path.join(self.id.as_str()),
            http_listen_addr: self.globals.http_listen_addr.clone(),
            metrics: self.globals.metrics.clone(),
            on_exports_change: Arc::new(move |value| {
                if let Some(node) = self_ref.upgrade() {
                    node.set_exports(value);
                }
            }),
        }
    }

    /// Stores a new exports value and schedules dependents, unless the value
    /// equals the current exports.
    ///
    /// The value must match the type's declared exports schema; an invalid
    /// value is dropped and the last valid exports are retained, so
    /// dependents keep a usable input.
    fn set_exports(self: &Arc<Self>, value: Value) {
        let Some(exports_spec) = &self.registration.exports else {
            log::error!(
                "component {} published exports but its type declares none; value dropped",
                self.id
            );
            return;
        };
        if let Err(e) = exports_spec.validate(&value) {
            log::error!("component {} published invalid exports: {e}; value dropped", self.id);
            return;
        }

        let changed = {
            let mut exports = self.exports.lock().unwrap();
            match exports.as_deref() {
                Some(current) if *current == value => false,
                _ => {
                    *exports = Some(Arc::new(value));
                    true
                }
            }
        };
        if changed {
            (self.globals.on_exports_change)(self.clone());
        }
    }

    /// Runs the component until `shutdown` is cancelled, then reports the
    /// node as exited.
    ///
    /// A node whose configuration never evaluated successfully has no
    /// instance yet; its worker waits for the first successful evaluation (or
    /// shutdown) instead of failing.
    pub(crate) async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let instance = tokio::select! {
            _ = shutdown.cancelled() => {
                self.set_run_health(HealthState::Exited, "component never started");
                return Ok(());
            }
            instance = self.wait_instance() => instance,
        };

        self.set_run_health(HealthState::Healthy, "component started");
        let result = instance.run(shutdown).await;
        match &result {
            Ok(()) => self.set_run_health(HealthState::Exited, "component exited"),
            Err(e) => {
                self.set_run_health(HealthState::Exited, format!("component exited: {e:#}"))
            }
        }
        result
    }

    async fn wait_instance(&self) -> Arc<dyn Component> {
        loop {
            // Register interest before checking, so a build that lands
            // between the check and the await still wakes us.
            let built = self.built.notified();
            if let Some(instance) = self.instance.lock().unwrap().clone() {
                return instance;
            }
            built.await;
        }
    }

    /// The merged health of the node: evaluation health, worker health and
    /// the health the component reports about itself; the least healthy of
    /// the three wins.
    pub fn current_health(&self) -> Health {
        let mut health = self
            .eval_health
            .lock()
            .unwrap()
            .clone()
            .merge(self.run_health.lock().unwrap().clone());
        let instance = self.instance.lock().unwrap().clone();
        if let Some(reported) = instance.and_then(|i| i.current_health()) {
            health = health.merge(reported);
        }
        health
    }

    pub fn current_arguments(&self) -> Option<Arguments> {
        self.args.lock().unwrap().clone()
    }

    pub fn current_exports(&self) -> Option<Arc<Value>> {
        self.exports.lock().unwrap().clone()
    }

    pub(crate) fn set_eval_health(&self, state: HealthState, message: impl Into<String>) {
        *self.eval_health.lock().unwrap() = Health::new(state, message);
    }

    pub(crate) fn set_run_health(&self, state: HealthState, message: impl Into<String>) {
        let mut health = self.run_health.lock().unwrap();
        if health.state == HealthState::Exited {
            // Exited is terminal.
            return;
        }
        *health = Health::new(state, message);
    }

    pub(crate) fn debug_info(&self) -> Option<Value> {
        let instance = self.instance.lock().unwrap().clone()?;
        instance.debug_info()
    }

    pub(crate) fn http_handler(&self) -> Option<axum::Router> {
        let instance = self.instance.lock().unwrap().clone()?;
        instance.http_handler()
    }
}

impl std::fmt::Debug for ComponentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentNode")
            .field("id", &self.id)
            .field("health", &self.current_health().state)
            .finish_non_exhaustive()
    }
}
