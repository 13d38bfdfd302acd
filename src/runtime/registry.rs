//! Filter factory table
//!
//! Maps protocol names to constructors so nodes can be created by name, for
//! example from a saved setup or a UI menu. A registry is an ordinary value:
//! build one, register what you need and pass it to
//! [`FilterGraph::add_node_by_protocol`](super::graph::FilterGraph::add_node_by_protocol).

use super::node::Filter;
use std::collections::BTreeMap;
use tracing::{debug, warn};

type FilterCreatorFn = Box<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Protocol name to filter constructor
#[derive(Default)]
pub struct FilterRegistry {
    creators: BTreeMap<String, FilterCreatorFn>,
}

impl FilterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every filter shipped with the crate
    pub fn with_builtin_filters() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_builtin_filters(&mut registry);
        registry
    }

    /// Register `F` under its own protocol name.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register<F, C>(&mut self, create: C)
    where
        F: Filter + 'static,
        C: Fn() -> F + Send + Sync + 'static,
    {
        let protocol = create().protocol_name().to_string();
        if self.creators.contains_key(&protocol) {
            warn!("Filter protocol '{}' registered twice, keeping the latest", protocol);
        }
        debug!("Registered filter protocol '{}'", protocol);
        self.creators
            .insert(protocol, Box::new(move || Box::new(create()) as Box<dyn Filter>));
    }

    /// Instantiate the filter registered as `protocol`
    pub fn create(&self, protocol: &str) -> Option<Box<dyn Filter>> {
        self.creators.get(protocol).map(|create| create())
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.creators.contains_key(protocol)
    }

    /// Registered protocol names, sorted
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.creators.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.creators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }
}
