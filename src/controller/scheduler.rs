//! Runs one worker per component node.
//!
//! The scheduler keys its table by node ID, not by object identity, so a
//! reload that keeps a node leaves its worker running undisturbed while the
//! loader delivers new arguments through `update`.

use std::sync::Arc;

use anyhow::anyhow;
use fxhash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::component::HealthState;

use super::graph::NodeId;
use super::metrics::ControllerMetrics;
use super::node::ComponentNode;

pub(crate) struct Scheduler {
    tasks: Mutex<FxHashMap<NodeId, RunningComponent>>,
    /// Parent of every worker's cancellation token.
    shutdown: CancellationToken,
    metrics: ControllerMetrics,
}

struct RunningComponent {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(metrics: ControllerMetrics) -> Self {
        Self {
            tasks: Mutex::new(FxHashMap::default()),
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    /// Diffs `desired` against the currently running set: starts newcomers,
    /// stops departures, leaves survivors untouched.
    ///
    /// Stopping awaits full worker termination before this method returns.
    pub async fn synchronize(&self, desired: Vec<Arc<ComponentNode>>) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        let desired_ids: FxHashSet<&NodeId> = desired.iter().map(|n| n.id()).collect();

        let removed: Vec<NodeId> = tasks
            .keys()
            .filter(|id| !desired_ids.contains(id))
            .cloned()
            .collect();
        let mut errors: Vec<String> = Vec::new();
        for id in removed {
            log::debug!("stopping component {id}");
            let running = tasks.remove(&id).unwrap();
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                errors.push(format!("worker of {id} failed: {e}"));
            }
        }

        for node in desired {
            if tasks.contains_key(node.id()) {
                continue;
            }
            let cancel = self.shutdown.child_token();
            let handle = self.spawn_worker(node.clone(), cancel.clone());
            self.metrics.started_components.inc();
            tasks.insert(node.id().clone(), RunningComponent { cancel, handle });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to stop components: {}", errors.join("; ")))
        }
    }

    /// Spawns a worker that owns the whole lifecycle of one node.
    ///
    /// The component future runs in its own task so that a panicking
    /// component tears down neither the worker bookkeeping nor the scheduler.
    fn spawn_worker(&self, node: Arc<ComponentNode>, cancel: CancellationToken) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        metrics.running_components.inc();
        tokio::spawn(async move {
            log::debug!("starting component {}", node.id());
            let run = {
                let node = node.clone();
                tokio::spawn(async move { node.run(cancel).await })
            };
            match run.await {
                Ok(Ok(())) => log::debug!("component {} exited", node.id()),
                Ok(Err(e)) => log::error!("component {} exited with error: {e:#}", node.id()),
                Err(e) if e.is_panic() => {
                    let message = panic_message(e);
                    log::error!("component {} panicked: {message}", node.id());
                    node.set_run_health(
                        HealthState::Exited,
                        format!("component panicked: {message}"),
                    );
                }
                Err(e) => {
                    // Cancelled task; we never abort component tasks.
                    log::error!("worker of {} stopped unexpectedly: {e}", node.id());
                }
            }
            metrics.running_components.dec();
        })
    }

    /// The number of workers currently tracked.
    pub async fn running(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancels every worker and waits for all of them to exit.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        let mut errors: Vec<String> = Vec::new();
        for (id, running) in tasks.drain() {
            if let Err(e) = running.handle.await {
                errors.push(format!("worker of {id} failed: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to stop components: {}", errors.join("; ")))
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
