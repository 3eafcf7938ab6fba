//! Rill: a component-graph runtime for telemetry agents.
//!
//! A rill configuration declares a set of named components (discovery
//! producers, scrape jobs, relabeling stages, remote-write sinks, ...) that
//! reference each other's outputs by symbolic paths. The controller in this
//! crate turns such a configuration into a dependency graph, evaluates each
//! component's arguments from its dependencies' current exports, runs every
//! component concurrently, and propagates export changes through the graph.
//!
//! # Components
//!
//! Each component has a set of arguments (block attributes) and optionally a
//! set of exported fields. Components reference the exports of other
//! components with expressions; see the [`component`] module for the contract
//! a component implementation must satisfy and the [`config`] module for the
//! configuration data model.
//!
//! # The controller
//!
//! The [`controller`] module is the heart of the crate:
//! 1. [`Controller::new`](controller::Controller::new) starts the event loop.
//! 2. [`Controller::load_file`](controller::Controller::load_file) applies a
//!    parsed configuration, creating, updating and deleting components. The
//!    call can be repeated to hot-reload the configuration; components that
//!    survive a reload keep running and keep their state.
//! 3. When a component updates its exports at runtime, every component that
//!    directly or indirectly references it is re-evaluated.
//!
//! Components are only evaluated after all the components they reference have
//! been evaluated; cyclic references are rejected. The arguments and exports
//! of a component are left in their last valid state if it shuts down or is
//! given an invalid configuration, which prevents a single failed component
//! from taking down otherwise healthy dependents.
//!
//! The controller is backed by asynchronous **Tokio** tasks: one worker per
//! component, plus a single event loop that owns all graph mutation.

pub mod component;
pub mod config;
pub mod controller;
pub mod diag;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
