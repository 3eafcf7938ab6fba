//! The contract between the controller and component implementations.
//!
//! A component is registered under a dotted type name (see
//! [`registry::Registration`]) and supplies an argument schema, an optional
//! exports schema and a factory. The factory receives the
//! controller-provided [`ComponentOptions`] and the initial [`Arguments`],
//! and returns a live instance implementing [`Component`].
//!
//! A type that publishes exports declares their shape with an
//! [`ExportsSpec`]; the controller validates every published value against
//! it, and a configuration referencing fields a component does not export is
//! rejected at load time.
//!
//! # Component health
//!
//! A component has various health states during its lifetime:
//!
//! 1. [`Unknown`](HealthState::Unknown): the initial state of new components.
//! 2. [`Healthy`](HealthState::Healthy): a healthy component.
//! 3. [`Unhealthy`](HealthState::Unhealthy): an unhealthy component.
//! 4. [`Exited`](HealthState::Exited): a component which is no longer running.
//!
//! Health states are paired with a timestamp and a message providing more
//! detail. A component can report its own health through
//! [`Component::current_health`]; the reported value is merged with the
//! controller-level health of the component, and the least healthy of the two
//! wins. An error when evaluating the configuration of a component keeps it
//! unhealthy until the next successful evaluation.

pub mod registry;
pub mod schema;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::config::Value;

pub use registry::{ComponentRegistry, Registration};
pub use schema::{Arguments, ArgumentsSpec, ExportsSpec, FieldKind, FieldSpec};

/// Boxed future returned by [`Component::run`].
pub type RunFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback through which a component publishes a new exports value.
///
/// Invoking it swaps the stored exports atomically and schedules every
/// dependent component for re-evaluation. Publishing a value equal to the
/// current exports is a no-op. A value that does not match the type's
/// declared [`ExportsSpec`] is dropped and the last valid exports are
/// retained.
pub type ExportsSetter = Arc<dyn Fn(Value) + Send + Sync>;

/// A live component instance.
pub trait Component: Send + Sync + 'static {
    /// Runs the component until `shutdown` is cancelled.
    ///
    /// Components must honour the cancellation promptly. Returning, normally
    /// or with an error, transitions the component to
    /// [`HealthState::Exited`]; the controller never restarts it.
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> RunFuture;

    /// Applies a new set of arguments.
    ///
    /// Called once right after the factory and again on every re-evaluation;
    /// it must be idempotent and safe to call concurrently with `run`.
    fn update(&self, args: Arguments) -> anyhow::Result<()>;

    /// Health reported by the component itself, merged with the health the
    /// controller tracks for it.
    fn current_health(&self) -> Option<Health> {
        None
    }

    /// JSON-like debug payload surfaced through the component debug handler.
    fn debug_info(&self) -> Option<Value> {
        None
    }

    /// Custom HTTP handler mounted under `/component/{id}/`.
    fn http_handler(&self) -> Option<axum::Router> {
        None
    }
}

/// Per-instance globals handed to a component factory.
pub struct ComponentOptions {
    /// Node ID of the component, unique per controller.
    pub id: String,
    /// Directory reserved for this component's data. The controller does not
    /// create it; components that persist state create it on first use.
    pub data_path: PathBuf,
    /// Base address the enclosing HTTP server listens on. The controller does
    /// not listen there itself, but some components need it to build correct
    /// self-referencing targets.
    pub http_listen_addr: String,
    /// Registry for the component's metrics. Use [`Self::metric_opts`] so the
    /// metrics carry the component's identity.
    pub metrics: prometheus::Registry,
    /// Publishes a new exports value.
    pub on_exports_change: ExportsSetter,
}

impl ComponentOptions {
    /// Prometheus options carrying this component's node ID as a const label.
    pub fn metric_opts(&self, name: &str, help: &str) -> prometheus::Opts {
        prometheus::Opts::new(name, help).const_label("component_id", &self.id)
    }
}

/// Health of a component at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub state: HealthState,
    pub message: String,
    #[serde(rename = "updatedTime", with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl Health {
    pub fn new(state: HealthState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            updated: OffsetDateTime::now_utc(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(HealthState::Unknown, message)
    }

    /// Merges two health values, keeping the least healthy one.
    ///
    /// `Exited` beats `Unhealthy` beats `Healthy` beats `Unknown`; on equal
    /// states the more recently updated value wins.
    pub fn merge(self, other: Health) -> Health {
        if self.state > other.state {
            self
        } else if other.state > self.state {
            other
        } else if self.updated >= other.updated {
            self
        } else {
            other
        }
    }
}

/// The four health states, ordered from most to least healthy for merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
    /// Terminal: an exited component never becomes healthy again.
    Exited,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Exited => "exited",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
