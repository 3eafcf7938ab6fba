//! Test components shared by the integration tests.
//!
//! The kit registers a handful of component types under `test.*`:
//!
//! - `test.source`: exports `{"value": <value>}`; tests push new values at
//!   runtime through [`TestKit::push`].
//! - `test.passthrough`: re-exports its `input` argument as `{"output": ...}`
//!   and can be told to fail evaluation with `fail = true`.
//! - `test.sink`: records its `input` argument, exports nothing.
//! - `test.exiter`: returns from `run` immediately.
//! - `test.crasher`: panics inside `run`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill::component::{
    Arguments, Component, ComponentOptions, ComponentRegistry, ArgumentsSpec, ExportsSpec,
    FieldKind, Registration, RunFuture,
};
use rill::config::{Block, Expr, Value};
use rill::controller::{Controller, Options};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared observation state plus the registry of test component types.
#[derive(Clone)]
pub struct TestKit {
    state: Arc<KitState>,
    registry: ComponentRegistry,
}

#[derive(Default)]
struct KitState {
    /// Channels feeding runtime values into `test.source` workers.
    feeds: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    /// Number of `update` calls per node ID.
    updates: Mutex<HashMap<String, u64>>,
    /// Number of `run` invocations per node ID.
    runs: Mutex<HashMap<String, u64>>,
    /// Last `input` argument seen per node ID.
    inputs: Mutex<HashMap<String, Value>>,
    /// Whether the node's worker is currently inside `run`.
    running: Mutex<HashMap<String, bool>>,
}

impl KitState {
    fn record_update(&self, id: &str, input: Option<&Value>) {
        *self.updates.lock().unwrap().entry(id.to_owned()).or_insert(0) += 1;
        if let Some(input) = input {
            self.inputs.lock().unwrap().insert(id.to_owned(), input.clone());
        }
    }

    fn record_run_start(&self, id: &str) {
        *self.runs.lock().unwrap().entry(id.to_owned()).or_insert(0) += 1;
        self.running.lock().unwrap().insert(id.to_owned(), true);
    }

    fn record_run_end(&self, id: &str) {
        self.running.lock().unwrap().insert(id.to_owned(), false);
    }
}

struct Source {
    opts: ComponentOptions,
    state: Arc<KitState>,
    feed: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl Component for Source {
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> RunFuture {
        Box::pin(async move {
            self.state.record_run_start(&self.opts.id);
            let mut feed = self.feed.lock().unwrap().take().expect("run is called once");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    pushed = feed.recv() => {
                        match pushed {
                            Some(value) => (self.opts.on_exports_change)(
                                Value::object([("value".to_owned(), value)]),
                            ),
                            None => break,
                        }
                    }
                }
            }
            self.state.record_run_end(&self.opts.id);
            Ok(())
        })
    }

    fn update(&self, args: Arguments) -> anyhow::Result<()> {
        self.state.record_update(&self.opts.id, None);
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        (self.opts.on_exports_change)(Value::object([("value".to_owned(), value)]));
        Ok(())
    }
}

struct Passthrough {
    opts: ComponentOptions,
    state: Arc<KitState>,
}

impl Component for Passthrough {
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> RunFuture {
        Box::pin(async move {
            self.state.record_run_start(&self.opts.id);
            shutdown.cancelled().await;
            self.state.record_run_end(&self.opts.id);
            Ok(())
        })
    }

    fn update(&self, args: Arguments) -> anyhow::Result<()> {
        let input = args.get("input").cloned().unwrap_or(Value::Null);
        self.state.record_update(&self.opts.id, Some(&input));
        if args.get("fail").and_then(Value::as_bool) == Some(true) {
            anyhow::bail!("told to fail");
        }
        (self.opts.on_exports_change)(Value::object([("output".to_owned(), input)]));
        Ok(())
    }
}

struct Sink {
    opts: ComponentOptions,
    state: Arc<KitState>,
}

impl Component for Sink {
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> RunFuture {
        Box::pin(async move {
            self.state.record_run_start(&self.opts.id);
            shutdown.cancelled().await;
            self.state.record_run_end(&self.opts.id);
            Ok(())
        })
    }

    fn update(&self, args: Arguments) -> anyhow::Result<()> {
        let input = args.get("input").cloned().unwrap_or(Value::Null);
        self.state.record_update(&self.opts.id, Some(&input));
        Ok(())
    }
}

struct Exiter {
    opts: ComponentOptions,
    state: Arc<KitState>,
}

impl Component for Exiter {
    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> RunFuture {
        Box::pin(async move {
            self.state.record_run_start(&self.opts.id);
            self.state.record_run_end(&self.opts.id);
            Ok(())
        })
    }

    fn update(&self, _args: Arguments) -> anyhow::Result<()> {
        self.state.record_update(&self.opts.id, None);
        Ok(())
    }
}

struct Crasher {
    opts: ComponentOptions,
    state: Arc<KitState>,
}

impl Component for Crasher {
    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> RunFuture {
        Box::pin(async move {
            self.state.record_run_start(&self.opts.id);
            panic!("crasher component crashed")
        })
    }

    fn update(&self, _args: Arguments) -> anyhow::Result<()> {
        self.state.record_update(&self.opts.id, None);
        Ok(())
    }
}

impl TestKit {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let state = Arc::new(KitState::default());
        let mut registry = ComponentRegistry::new();

        let kit = state.clone();
        registry
            .register(
                Registration::new(
                    "test.source",
                    ArgumentsSpec::new().optional("value", FieldKind::Any, Some(Value::Null)),
                    move |opts, args| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        kit.feeds.lock().unwrap().insert(opts.id.clone(), tx);
                        let source = Arc::new(Source {
                            opts,
                            state: kit.clone(),
                            feed: Mutex::new(Some(rx)),
                        });
                        source.update(args)?;
                        Ok(source as Arc<dyn Component>)
                    },
                )
                .with_exports(ExportsSpec::new().field("value", FieldKind::Any)),
            )
            .unwrap();

        let kit = state.clone();
        registry
            .register(
                Registration::new(
                    "test.passthrough",
                    ArgumentsSpec::new()
                        .field("input", FieldKind::Any)
                        .optional("fail", FieldKind::Bool, Some(Value::Bool(false))),
                    move |opts, args| {
                        let passthrough = Arc::new(Passthrough {
                            opts,
                            state: kit.clone(),
                        });
                        passthrough.update(args)?;
                        Ok(passthrough as Arc<dyn Component>)
                    },
                )
                .with_exports(ExportsSpec::new().field("output", FieldKind::Any)),
            )
            .unwrap();

        let kit = state.clone();
        registry
            .register(Registration::new(
                "test.sink",
                ArgumentsSpec::new().field("input", FieldKind::Any),
                move |opts, args| {
                    let sink = Arc::new(Sink {
                        opts,
                        state: kit.clone(),
                    });
                    sink.update(args)?;
                    Ok(sink as Arc<dyn Component>)
                },
            ))
            .unwrap();

        let kit = state.clone();
        registry
            .register(Registration::new(
                "test.exiter",
                ArgumentsSpec::new(),
                move |opts, _args| {
                    Ok(Arc::new(Exiter {
                        opts,
                        state: kit.clone(),
                    }) as Arc<dyn Component>)
                },
            ))
            .unwrap();

        let kit = state.clone();
        registry
            .register(Registration::new(
                "test.crasher",
                ArgumentsSpec::new(),
                move |opts, _args| {
                    Ok(Arc::new(Crasher {
                        opts,
                        state: kit.clone(),
                    }) as Arc<dyn Component>)
                },
            ))
            .unwrap();

        Self { state, registry }
    }

    /// Starts a controller over the kit's registry with a fresh metrics
    /// registry, returning both.
    pub fn controller(&self) -> (Controller, prometheus::Registry) {
        let metrics_registry = prometheus::Registry::new();
        let controller = Controller::new(Options {
            registry: self.registry.clone(),
            data_path: std::env::temp_dir().join("rill-tests"),
            http_listen_addr: "127.0.0.1:12345".to_owned(),
            metrics_registry: metrics_registry.clone(),
        })
        .expect("controller starts");
        (controller, metrics_registry)
    }

    /// Pushes a runtime value into a `test.source` node's worker.
    pub fn push(&self, id: &str, value: Value) {
        let feeds = self.state.feeds.lock().unwrap();
        let feed = feeds.get(id).unwrap_or_else(|| panic!("no source {id}"));
        feed.send(value).expect("source worker is alive");
    }

    pub fn updates(&self, id: &str) -> u64 {
        *self.state.updates.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub fn runs(&self, id: &str) -> u64 {
        *self.state.runs.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub fn input(&self, id: &str) -> Option<Value> {
        self.state.inputs.lock().unwrap().get(id).cloned()
    }

    pub fn is_running(&self, id: &str) -> bool {
        *self.state.running.lock().unwrap().get(id).unwrap_or(&false)
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Reads a counter or gauge value from a prometheus registry by name.
pub fn metric_value(registry: &prometheus::Registry, name: &str) -> f64 {
    let families = registry.gather();
    let family = families
        .iter()
        .find(|f| f.get_name() == name)
        .unwrap_or_else(|| panic!("metric {name} not registered"));
    let metric = &family.get_metric()[0];
    if metric.has_counter() {
        metric.get_counter().get_value()
    } else {
        metric.get_gauge().get_value()
    }
}

// Block builders for the test component types.

pub fn source(label: &str, value: impl Into<Value>) -> Block {
    Block::new("test.source", label).with_attr("value", Expr::literal(value))
}

pub fn passthrough(label: &str, input: &str) -> Block {
    Block::new("test.passthrough", label).with_attr("input", Expr::reference(input))
}

pub fn sink(label: &str, input: &str) -> Block {
    Block::new("test.sink", label).with_attr("input", Expr::reference(input))
}
