//! Coalescing queue of nodes awaiting re-evaluation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use fxhash::FxHashSet;
use tokio::sync::Notify;

use super::graph::NodeId;
use super::node::ComponentNode;

/// A lossless, coalescing FIFO of component nodes.
///
/// During a burst of export changes, one producer can make many dependents
/// publish new exports of their own, each enqueueing again; coalescing bounds
/// the queue at the number of nodes in the graph instead of letting it grow
/// quadratically.
pub(crate) struct Queue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    queued: FxHashSet<NodeId>,
    order: VecDeque<Arc<ComponentNode>>,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queued: FxHashSet::default(),
                order: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Adds `node` unless it is already pending, then wakes at most one
    /// waiter.
    pub fn enqueue(&self, node: Arc<ComponentNode>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.queued.insert(node.id().clone()) {
                inner.order.push_back(node);
            }
        }
        // notify_one stores a single permit when nobody is waiting, so a
        // consumer that starts waiting later still wakes up.
        self.notify.notify_one();
    }

    /// Removes and returns one pending node. Non-blocking.
    pub fn try_dequeue(&self) -> Option<Arc<ComponentNode>> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.order.pop_front()?;
        inner.queued.remove(node.id());
        Some(node)
    }

    /// Resolves when the queue may be non-empty.
    ///
    /// The notification is edge-triggered: a woken consumer must drain with
    /// [`try_dequeue`](Self::try_dequeue) until `None` before waiting again,
    /// otherwise nodes may sit in the queue forever.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    #[allow(unused)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
