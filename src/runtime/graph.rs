//! Filter graph editing
//!
//! [`FilterGraph`] owns a named set of nodes and is the only place edges are
//! added or removed. It rejects edits the executor can't run: unknown nodes,
//! streams a filter won't accept, and edges that would close a cycle. Removing
//! a node disconnects every input that read from it first.

use super::errors::ConnectionError;
use super::node::{Filter, FlowGraphNode, NodeHandle};
use super::registry::FilterRegistry;
use super::stream::StreamDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique identifier for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Fresh id, unique for the life of the process
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Named set of nodes and the edges between them
#[derive(Default)]
pub struct FilterGraph {
    nodes: Vec<NodeHandle>,
    node_names: HashMap<String, usize>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node named `name` around `filter`
    pub fn add_node<F: Filter + 'static>(
        &mut self,
        name: impl Into<String>,
        filter: F,
    ) -> Result<NodeHandle, ConnectionError> {
        let name = name.into();
        self.check_name_free(&name)?;
        self.insert(FlowGraphNode::new(name, filter))
    }

    /// Create a node from the filter registered under `protocol`
    pub fn add_node_by_protocol(
        &mut self,
        registry: &FilterRegistry,
        protocol: &str,
        name: impl Into<String>,
    ) -> Result<NodeHandle, ConnectionError> {
        let name = name.into();
        self.check_name_free(&name)?;
        let filter = registry
            .create(protocol)
            .ok_or_else(|| ConnectionError::UnknownProtocol(protocol.to_string()))?;
        self.insert(FlowGraphNode::from_boxed(name, filter))
    }

    /// Adopt a node created elsewhere
    pub fn add_existing(&mut self, node: NodeHandle) -> Result<NodeHandle, ConnectionError> {
        self.check_name_free(node.name())?;
        self.insert(node)
    }

    fn check_name_free(&self, name: &str) -> Result<(), ConnectionError> {
        if self.node_names.contains_key(name) {
            return Err(ConnectionError::DuplicateNode(name.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, node: NodeHandle) -> Result<NodeHandle, ConnectionError> {
        info!(
            "[{}] Added {} node {:?}",
            node.name(),
            node.protocol_name(),
            node.id()
        );
        self.node_names.insert(node.name().to_string(), self.nodes.len());
        self.nodes.push(Arc::clone(&node));
        Ok(node)
    }

    /// Connect stream `from_stream` of `from_node` to input `to_input` of `to_node`
    pub fn connect(
        &mut self,
        from_node: &str,
        from_stream: &str,
        to_node: &str,
        to_input: &str,
    ) -> Result<(), ConnectionError> {
        let from = self.lookup(from_node)?;
        let to = self.lookup(to_node)?;

        let stream_index = from
            .streams()
            .iter()
            .position(|s| s.name() == from_stream)
            .ok_or_else(|| ConnectionError::PortNotFound {
                node: from_node.to_string(),
                port: from_stream.to_string(),
            })?;
        let input_index = to
            .input_index(to_input)
            .ok_or_else(|| ConnectionError::PortNotFound {
                node: to_node.to_string(),
                port: to_input.to_string(),
            })?;

        self.connect_by_index(&from, stream_index, &to, input_index)
    }

    /// Connect by position instead of by name
    pub fn connect_by_index(
        &mut self,
        from: &NodeHandle,
        from_stream: usize,
        to: &NodeHandle,
        to_input: usize,
    ) -> Result<(), ConnectionError> {
        for node in [from, to] {
            if !self.contains(node) {
                return Err(ConnectionError::NodeNotFound(node.name().to_string()));
            }
        }

        if Arc::ptr_eq(from, to) {
            return Err(ConnectionError::SelfLoop(to.name().to_string()));
        }
        if Self::reaches_upstream(from, to) {
            return Err(ConnectionError::Cycle {
                from_node: from.name().to_string(),
                to_node: to.name().to_string(),
            });
        }

        to.set_input(to_input, StreamDescriptor::new(from, from_stream))?;
        debug!(
            "Connected {}.{} -> {}.{}",
            from.name(),
            from_stream,
            to.name(),
            to_input
        );
        Ok(())
    }

    /// True if walking upstream from `start` reaches `target`
    fn reaches_upstream(start: &NodeHandle, target: &NodeHandle) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![Arc::clone(start)];
        while let Some(node) = stack.pop() {
            if node.id() == target.id() {
                return true;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.extend(node.inputs().iter().filter_map(|d| d.node().cloned()));
        }
        false
    }

    /// Leave input `to_input` of `to_node` floating
    pub fn disconnect(&mut self, to_node: &str, to_input: &str) -> Result<(), ConnectionError> {
        let to = self.lookup(to_node)?;
        let index = to
            .input_index(to_input)
            .ok_or_else(|| ConnectionError::PortNotFound {
                node: to_node.to_string(),
                port: to_input.to_string(),
            })?;
        to.disconnect_input(index);
        debug!("Disconnected {}.{}", to_node, to_input);
        Ok(())
    }

    /// Remove `name` after disconnecting every input that reads from it
    pub fn remove_node(&mut self, name: &str) -> Result<NodeHandle, ConnectionError> {
        let position = *self
            .node_names
            .get(name)
            .ok_or_else(|| ConnectionError::NodeNotFound(name.to_string()))?;
        let removed = self.nodes.remove(position);

        for node in &self.nodes {
            for (index, descriptor) in node.inputs().iter().enumerate() {
                if descriptor.node().is_some_and(|n| Arc::ptr_eq(n, &removed)) {
                    debug!("[{}] Input {} lost its source {}", node.name(), index, name);
                    node.disconnect_input(index);
                }
            }
        }

        self.node_names = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name().to_string(), i))
            .collect();

        info!("[{}] Removed node {:?}", name, removed.id());
        Ok(removed)
    }

    fn lookup(&self, name: &str) -> Result<NodeHandle, ConnectionError> {
        self.node(name)
            .cloned()
            .ok_or_else(|| ConnectionError::NodeNotFound(name.to_string()))
    }

    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.node_names.get(name).map(|&i| &self.nodes[i])
    }

    /// All nodes, in insertion order
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn contains(&self, node: &NodeHandle) -> bool {
        self.node(node.name()).is_some_and(|n| Arc::ptr_eq(n, node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `(node, input)` names of every floating input
    pub fn unconnected_inputs(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.inputs()
                    .iter()
                    .zip(node.input_names())
                    .filter(|(d, _)| d.node().is_none())
                    .map(|(_, input)| (node.name().to_string(), input.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
