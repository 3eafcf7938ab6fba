//! The component-graph controller.
//!
//! The controller binds together the configuration loader, the dependency
//! graph, the update-propagation queue and the per-component scheduler, and
//! runs the event loop that reacts to queue notifications and reload
//! signals:
//!
//! - a worker's exports change enqueues its node; the loop drains the queue
//!   and re-evaluates every dependent in propagation order;
//! - a finished load signals the loop, which synchronizes the scheduler with
//!   the current node set (starting new workers, stopping removed ones and
//!   leaving survivors untouched).
//!
//! All graph mutation and evaluation is serialised on this loop and on
//! [`Controller::load_file`]'s loader lock; only worker execution is
//! parallel.

mod graph;
mod http;
mod loader;
mod metrics;
mod node;
mod queue;
mod scheduler;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::component::{ComponentRegistry, Health};
use crate::config::{SourceFile, Value};
use crate::diag::Diagnostics;

pub use graph::{CycleError, Edge, NodeId};
pub use node::ComponentNode;

use loader::Loader;
use metrics::ControllerMetrics;
use node::NodeGlobals;
use queue::Queue;
use scheduler::Scheduler;

/// Static options for a controller.
#[derive(Clone)]
pub struct Options {
    /// Component types available to configurations.
    pub registry: ComponentRegistry,
    /// Directory where components can write data. Each component gets a
    /// subdirectory named after its node ID.
    pub data_path: PathBuf,
    /// Base address the enclosing HTTP server listens on. The controller
    /// does not listen there itself, but some components need it to build
    /// correct self-referencing targets.
    pub http_listen_addr: String,
    /// Registry for controller and component metrics.
    pub metrics_registry: prometheus::Registry,
}

/// A running controller.
///
/// Cheap to clone; all clones share the same state. Call
/// [`close`](Controller::close) to stop it.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Shared>,
}

struct Shared {
    loader: Loader,
    queue: Arc<Queue>,
    sched: Scheduler,
    metrics: ControllerMetrics,
    shutdown: CancellationToken,
    load_finished_tx: mpsc::Sender<()>,
    load_state: Mutex<LoadState>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct LoadState {
    /// Sticky: set by the first load that passes without errors.
    loaded_once: bool,
}

impl Controller {
    /// Creates and starts a new controller.
    ///
    /// Must be called from within a Tokio runtime; the event loop is spawned
    /// on it.
    pub fn new(options: Options) -> anyhow::Result<Controller> {
        let metrics = ControllerMetrics::register(&options.metrics_registry)
            .context("registering controller metrics")?;
        let queue = Arc::new(Queue::new());
        let globals = NodeGlobals {
            data_path: options.data_path,
            http_listen_addr: options.http_listen_addr,
            metrics: options.metrics_registry,
            on_exports_change: {
                // Changed components are queued for re-evaluation of their
                // dependents; the loop picks them up on its next tick.
                let queue = queue.clone();
                Box::new(move |node| queue.enqueue(node))
            },
        };
        let loader = Loader::new(options.registry, Arc::new(globals), metrics.clone());
        let sched = Scheduler::new(metrics.clone());
        let (load_finished_tx, load_finished_rx) = mpsc::channel(1);

        let controller = Controller {
            inner: Arc::new(Shared {
                loader,
                queue,
                sched,
                metrics,
                shutdown: CancellationToken::new(),
                load_finished_tx,
                load_state: Mutex::new(LoadState::default()),
                run_handle: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        };
        let handle = tokio::spawn(controller.clone().run(load_finished_rx));
        *controller.inner.run_handle.lock().unwrap() = Some(handle);
        Ok(controller)
    }

    /// The event loop: the only place where evaluation runs at runtime and
    /// where the scheduler is synchronized.
    async fn run(self, mut load_finished: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,

                _ = self.inner.queue.notified() => {
                    // Pop everything: with a single pop, other nodes could
                    // sit waiting for evaluation forever.
                    while let Some(node) = self.inner.queue.try_dequeue() {
                        self.inner.loader.evaluate_dependencies(&node);
                    }
                    self.inner.metrics.queue_size.set(self.inner.queue.len() as i64);
                }

                Some(()) = load_finished.recv() => {
                    log::info!("scheduling loaded components");
                    let components = self.inner.loader.components();
                    if let Err(e) = self.inner.sched.synchronize(components).await {
                        log::error!("failed to schedule components: {e:#}");
                    }
                }
            }
        }
        log::debug!("controller exiting");
    }

    /// Synchronizes the controller with a parsed configuration.
    ///
    /// Components are marked unhealthy if an error is encountered during the
    /// load, and the diagnostics of the whole load are returned. Workers are
    /// only started after the first load that passes without errors; from
    /// then on, failed reloads leave the previous healthy components
    /// running.
    pub fn load_file(&self, file: &SourceFile) -> Result<(), Diagnostics> {
        let mut state = self.inner.load_state.lock().unwrap();
        let diags = self.inner.loader.apply(file);
        if !state.loaded_once && diags.has_errors() {
            // The first load must be clean before any component runs.
            return Err(diags);
        }
        state.loaded_once = true;

        // Non-blocking: a pending refresh already covers this load.
        let _ = self.inner.load_finished_tx.try_send(());
        diags.error_or()
    }

    /// Whether a load has ever succeeded. Sticky; useful as a readiness
    /// signal for the host application.
    pub fn loaded_once(&self) -> bool {
        self.inner.load_state.lock().unwrap().loaded_once
    }

    /// A snapshot of every component, in configuration order.
    pub fn component_infos(&self) -> Vec<ComponentInfo> {
        let edges = self.inner.loader.edges();
        self.inner
            .loader
            .components()
            .iter()
            .map(|node| build_info(node, &edges))
            .collect()
    }

    pub(crate) fn component_info(&self, id: &NodeId) -> Option<ComponentInfo> {
        let node = self.inner.loader.get(id)?;
        let edges = self.inner.loader.edges();
        Some(build_info(&node, &edges))
    }

    pub(crate) fn get_node(&self, id: &NodeId) -> Option<Arc<ComponentNode>> {
        self.inner.loader.get(id)
    }

    /// An HTTP handler routing `/component/{id}/...` into the named
    /// component's debug handler.
    pub fn component_handler(&self) -> axum::Router {
        http::component_handler(self.clone())
    }

    /// Stops the controller and all running components, waiting for every
    /// worker to exit.
    ///
    /// # Panics
    /// Panics when called twice; a controller cannot be restarted.
    pub async fn close(&self) -> anyhow::Result<()> {
        let already_closed = self.inner.closed.swap(true, Ordering::SeqCst);
        assert!(!already_closed, "Controller::close called twice");

        self.inner.shutdown.cancel();
        let handle = self.inner.run_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| anyhow!("controller loop failed: {e}"))?;
        }
        self.inner.sched.close().await
    }
}

/// Snapshot of one component for API reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    /// Node ID, `<component_type>.<label>`.
    pub id: String,
    /// Dotted component type name.
    pub name: String,
    pub label: String,
    /// Node IDs this component references.
    #[serde(rename = "referencesTo")]
    pub references: Vec<String>,
    /// Node IDs referencing this component.
    pub referenced_by: Vec<String>,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exports: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<Value>,
}

fn build_info(node: &Arc<ComponentNode>, edges: &[Edge]) -> ComponentInfo {
    let id = node.id();
    let mut references = Vec::new();
    let mut referenced_by = Vec::new();
    for edge in edges {
        if &edge.from == id {
            references.push(edge.to.to_string());
        } else if &edge.to == id {
            referenced_by.push(edge.from.to_string());
        }
    }
    ComponentInfo {
        id: id.to_string(),
        name: node.component_name(),
        label: node.label(),
        references,
        referenced_by,
        health: node.current_health(),
        arguments: node.current_arguments().map(|args| args.into_value()),
        exports: node.current_exports().map(|e| (*e).clone()),
        debug_info: node.debug_info(),
    }
}
