//! Node context injection for multi-node logging
//!
//! Several nodes often share one process in tests and simulations. A
//! [`NodeContextGuard`] stores the identity of the node currently doing
//! work in thread-local storage; [`crate::layers::NodeContextLayer`]
//! attaches it to every span opened in that scope.

use std::cell::RefCell;

use overlink_core::NodeIdentifier;
use uuid::Uuid;

/// Node context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContextData {
    /// Short form of the node id
    pub node_id: String,
    /// Which tier of identity `node_id` is
    pub node_kind: &'static str,
    /// Short form of the persistent instance id
    pub instance: String,
    /// Distinguishes guard scopes of the same node in merged logs
    pub scope_id: Uuid,
}

thread_local! {
    static NODE_CONTEXT: RefCell<Option<NodeContextData>> = const { RefCell::new(None) };
}

/// RAII guard for node context
///
/// Creating the guard sets the node context for the current thread;
/// dropping it restores the previous context.
///
/// # Example
///
/// ```ignore
/// use overlink_logging::NodeContextGuard;
///
/// let _guard = NodeContextGuard::new(&session_id);
/// tracing::info!("Applying advertisement");
/// ```
pub struct NodeContextGuard {
    previous: Option<NodeContextData>,
}

impl NodeContextGuard {
    pub fn new<I: NodeIdentifier>(identity: &I) -> Self {
        Self::with_scope_id(identity, Uuid::new_v4())
    }

    /// Use a known scope id, e.g. to keep it stable across restarts
    pub fn with_scope_id<I: NodeIdentifier>(identity: &I, scope_id: Uuid) -> Self {
        let data = NodeContextData {
            node_id: identity.short_id(),
            node_kind: I::KIND,
            instance: identity.instance_node_id().short_id(),
            scope_id,
        };
        let previous = NODE_CONTEXT.with(|ctx| ctx.borrow_mut().replace(data));
        Self { previous }
    }

    /// Get the current node context (if any)
    pub fn current() -> Option<NodeContextData> {
        NODE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_node_id() -> Option<String> {
        Self::current().map(|ctx| ctx.node_id)
    }
}

impl Drop for NodeContextGuard {
    fn drop(&mut self) {
        NODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block with a node context set
///
/// ```ignore
/// with_node_context!(&session_id, {
///     tracing::info!("Processing request");
/// });
/// ```
#[macro_export]
macro_rules! with_node_context {
    ($identity:expr, $body:block) => {{
        let _guard = $crate::context::NodeContextGuard::new($identity);
        $body
    }};
}
