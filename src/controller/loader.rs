//! Applies configurations to the component graph and evaluates nodes.
//!
//! The loader owns the graph. [`Loader::apply`] is the full reconciliation
//! run by a (re)load: it creates, reuses and deletes nodes, derives the
//! dependency edges from the blocks' reference expressions, and evaluates
//! every node in dependency order. [`Loader::evaluate_dependencies`] is the
//! partial reconciliation run when one node's exports changed at runtime.
//!
//! Both entry points serialise on an internal lock: the graph is never
//! mutated, and no evaluation runs, from two threads at once.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use fxhash::FxHashSet;

use crate::component::{ComponentRegistry, HealthState};
use crate::config::{Block, Expr, RefPath, SourceFile, Value};
use crate::diag::{Diagnostic, Diagnostics};

use super::graph::{Edge, Graph, NodeId};
use super::metrics::ControllerMetrics;
use super::node::{ComponentNode, NodeGlobals};

pub(crate) struct Loader {
    registry: ComponentRegistry,
    globals: Arc<NodeGlobals>,
    metrics: ControllerMetrics,
    /// The exclusive loader lock; guards the graph and serialises evaluation.
    graph: Mutex<Graph>,
}

impl Loader {
    pub fn new(
        registry: ComponentRegistry,
        globals: Arc<NodeGlobals>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            registry,
            globals,
            metrics,
            graph: Mutex::new(Graph::new()),
        }
    }

    /// Full reconciliation of the graph against `file`.
    ///
    /// Structural problems (unknown component types, duplicate IDs, dangling
    /// references, references to fields a component does not export, cycles)
    /// reject the whole apply and leave the previous graph live. Once the
    /// structure is sound the new graph is committed; evaluation failures of
    /// individual nodes are collected as diagnostics and mark the node
    /// unhealthy, but do not remove it.
    pub fn apply(&self, file: &SourceFile) -> Diagnostics {
        let mut graph = self.graph.lock().unwrap();
        let mut diags = Diagnostics::new();

        // Pass 1: create or reuse one node per block. Reused nodes are not
        // touched yet; their blocks are swapped only once the new
        // configuration is structurally sound, so a rejected apply leaves
        // the surviving nodes exactly as they were.
        let mut new_graph = Graph::new();
        let mut accepted: Vec<(NodeId, &Block)> = Vec::new();
        for block in &file.components {
            if block.label.is_empty() {
                diags.push(
                    Diagnostic::error(format!(
                        "component \"{}\" must have a label",
                        block.name
                    ))
                    .with_span(block.span),
                );
                continue;
            }
            let Some(registration) = self.registry.get(&block.name) else {
                diags.push(
                    Diagnostic::error(format!("unknown component type \"{}\"", block.name))
                        .with_span(block.span),
                );
                continue;
            };
            let id = NodeId::new(format!("{}.{}", block.name, block.label));
            if new_graph.contains(&id) {
                diags.push(
                    Diagnostic::error(format!("component \"{id}\" declared more than once"))
                        .with_span(block.span),
                );
                continue;
            }
            // Reusing the node keeps the worker and component state alive
            // across the reload.
            let node = match graph.get(&id) {
                Some(existing) => existing.clone(),
                None => ComponentNode::new(block.clone(), registration.clone(), self.globals.clone()),
            };
            new_graph.add_node(node);
            accepted.push((id, block));
        }

        // Pass 2: derive the dependency edges from reference expressions.
        for (id, block) in &accepted {
            let mut refs: Vec<RefPath> = Vec::new();
            for attr in &block.body {
                attr.value.references(&mut refs);
            }

            let mut targets: Vec<NodeId> = Vec::new();
            let mut seen: FxHashSet<NodeId> = FxHashSet::default();
            for path in refs {
                match resolve_reference(&new_graph, &path) {
                    Some((target, consumed)) => match check_reference(target, &path, consumed) {
                        Ok(()) => {
                            let target = target.id().clone();
                            if seen.insert(target.clone()) {
                                targets.push(target);
                            }
                        }
                        Err(message) => {
                            diags.push(Diagnostic::error(message).with_span(block.span))
                        }
                    },
                    None => diags.push(
                        Diagnostic::error(format!("component \"{path}\" does not exist"))
                            .with_span(block.span),
                    ),
                }
            }
            if new_graph.set_dependencies(id, targets).is_err() {
                // Unreachable: every target came from the graph above.
                diags.push(Diagnostic::error(format!(
                    "internal error wiring references of \"{id}\""
                )));
            }
        }

        // Pass 3: the new graph must be acyclic.
        let sorted = match new_graph.topological_sort() {
            Ok(sorted) => sorted,
            Err(cycle) => {
                let span = cycle.cycle.first().and_then(|cycle_id| {
                    accepted
                        .iter()
                        .find(|(id, _)| id == cycle_id)
                        .map(|(_, block)| block.span)
                });
                let mut diag = Diagnostic::error(cycle.to_string());
                if let Some(span) = span {
                    diag = diag.with_span(span);
                }
                diags.push(diag);
                return diags;
            }
        };

        if diags.has_errors() {
            // Structural failure: keep the previous graph running.
            return diags;
        }

        // The new configuration is sound; surviving nodes take their new
        // blocks now.
        for (id, block) in &accepted {
            new_graph.get(id).unwrap().replace_block((*block).clone());
        }

        // Pass 4: evaluate every node, dependencies first. Failures mark the
        // node unhealthy and are reported, but evaluation continues.
        for node in &sorted {
            if let Err(e) = self.evaluate(&new_graph, node) {
                log::error!("failed to evaluate component {}: {e:#}", node.id());
                diags.push(
                    Diagnostic::error(format!(
                        "failed to evaluate component \"{}\": {e:#}",
                        node.id()
                    ))
                    .with_span(node.block().span),
                );
            }
        }

        // Commit. Nodes absent from the new configuration are dropped here;
        // the scheduler stops their workers on the next synchronize.
        let old = std::mem::replace(&mut *graph, new_graph);
        for node in old.nodes() {
            if !graph.contains(node.id()) {
                log::debug!("removed component {}", node.id());
            }
        }

        diags
    }

    /// Partial reconciliation after `changed`'s exports were updated:
    /// re-evaluates every node transitively depending on it, dependencies
    /// first, so each dependent observes the freshest exports of this pass.
    ///
    /// A dependent whose own exports change as a result is enqueued again by
    /// its exports hook and re-processed in a future tick; that converts
    /// re-entry into forward progress instead of unbounded recursion.
    pub fn evaluate_dependencies(&self, changed: &ComponentNode) {
        let graph = self.graph.lock().unwrap();
        if !graph.contains(changed.id()) {
            // The node was removed by a reload while it sat in the queue.
            return;
        }
        log::debug!("handling component with updated state: {}", changed.id());
        for node in graph.reachable(changed.id()) {
            if let Err(e) = self.evaluate(&graph, &node) {
                log::error!("failed to evaluate component {}: {e:#}", node.id());
            }
        }
    }

    /// Binds `node`'s argument expressions against its dependencies' current
    /// exports and applies the result to the component.
    fn evaluate(&self, graph: &Graph, node: &Arc<ComponentNode>) -> anyhow::Result<()> {
        self.metrics.evaluations.inc();
        let result = self.try_evaluate(graph, node);
        if let Err(e) = &result {
            // Failures before `update` (expression or binding errors) must
            // still surface through health.
            node.set_eval_health(HealthState::Unhealthy, format!("{e:#}"));
        }
        result
    }

    fn try_evaluate(&self, graph: &Graph, node: &Arc<ComponentNode>) -> anyhow::Result<()> {
        let block = node.block();
        let mut attrs: Vec<(String, Value)> = Vec::with_capacity(block.body.len());
        for attr in &block.body {
            let value = eval_expr(graph, &attr.value)
                .with_context(|| format!("evaluating attribute \"{}\"", attr.name))?;
            attrs.push((attr.name.clone(), value));
        }
        let args = node.registration().args.bind(&attrs)?;
        node.update(args)
    }

    /// All current nodes, in insertion order of the latest apply.
    pub fn components(&self) -> Vec<Arc<ComponentNode>> {
        self.graph.lock().unwrap().nodes().cloned().collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<ComponentNode>> {
        self.graph.lock().unwrap().get(id).cloned()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.graph.lock().unwrap().edges()
    }
}

/// Checks a resolved reference against the target type's exports schema:
/// the target must declare exports, and the first indexing segment (if any)
/// must name a declared field.
fn check_reference(
    target: &Arc<ComponentNode>,
    path: &RefPath,
    consumed: usize,
) -> Result<(), String> {
    let Some(exports) = &target.registration().exports else {
        return Err(format!(
            "component \"{}\" does not export any fields",
            target.id()
        ));
    };
    if let Some(first) = path.segments().get(consumed) {
        if exports.get(first).is_none() {
            return Err(format!(
                "component \"{}\" does not export field \"{first}\"",
                target.id()
            ));
        }
    }
    Ok(())
}

/// Resolves a reference path to a node: the longest prefix naming a node in
/// `graph` wins, and the remaining segments index into that node's exports.
fn resolve_reference<'a>(
    graph: &'a Graph,
    path: &RefPath,
) -> Option<(&'a Arc<ComponentNode>, usize)> {
    let segments = path.segments();
    // A node ID has at least two segments (type and label).
    for n in (2..=segments.len()).rev() {
        let id = NodeId::new(path.prefix(n));
        if let Some(node) = graph.get(&id) {
            return Some((node, n));
        }
    }
    None
}

fn eval_expr(graph: &Graph, expr: &Expr) -> anyhow::Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(graph, item)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(entries) => {
            let mut out = std::collections::BTreeMap::new();
            for (key, value) in entries {
                out.insert(key.clone(), eval_expr(graph, value)?);
            }
            Ok(Value::Object(out))
        }
        Expr::Reference(path) => {
            let (node, consumed) = resolve_reference(graph, path)
                .ok_or_else(|| anyhow!("component \"{path}\" does not exist"))?;
            let exports = node
                .current_exports()
                .ok_or_else(|| anyhow!("dependency \"{}\" has no value", node.id()))?;
            let rest = &path.segments()[consumed..];
            let value = exports.index_path(rest).ok_or_else(|| {
                anyhow!(
                    "\"{}\" does not exist in the exports of \"{}\"",
                    rest.join("."),
                    node.id()
                )
            })?;
            Ok(value.clone())
        }
    }
}
