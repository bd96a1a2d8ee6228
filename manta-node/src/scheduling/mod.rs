// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod actor_scheduling_queue;
pub mod cluster_resource_scheduler;
pub mod cluster_task_manager;

use manta_common::model::{NodeId, ResourceSet};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResources {
    pub static_resources: ResourceSet,
    pub available: ResourceSet,
}

/// The scheduler's view of cluster capacity: static and currently available
/// resources per live node. The local node's `available` is the one vector
/// this node mutates; remote entries are refreshed from heartbeats.
pub struct ClusterView {
    local_node_id: NodeId,
    nodes: HashMap<NodeId, NodeResources>,
}

impl ClusterView {
    pub fn new(local_node_id: NodeId, static_resources: ResourceSet) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            local_node_id,
            NodeResources {
                available: static_resources.clone(),
                static_resources,
            },
        );
        ClusterView {
            local_node_id,
            nodes,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn update_node(
        &mut self,
        node_id: NodeId,
        static_resources: ResourceSet,
        available: ResourceSet,
    ) {
        if node_id == self.local_node_id {
            return;
        }
        self.nodes.insert(
            node_id,
            NodeResources {
                static_resources,
                available,
            },
        );
    }

    pub fn remove_node(&mut self, node_id: &NodeId) {
        if *node_id != self.local_node_id {
            self.nodes.remove(node_id);
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeResources)> {
        self.nodes.iter()
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeResources> {
        self.nodes.get(node_id)
    }

    pub fn local_available(&self) -> &ResourceSet {
        &self.nodes[&self.local_node_id].available
    }

    pub fn local_static(&self) -> &ResourceSet {
        &self.nodes[&self.local_node_id].static_resources
    }

    /// Atomic check-then-subtract on the local availability vector.
    pub fn acquire_local(&mut self, demand: &ResourceSet) -> bool {
        let local = self
            .nodes
            .get_mut(&self.local_node_id)
            .expect("local node is always present");
        if !demand.is_subset_of(&local.available) {
            return false;
        }
        local.available = local.available.subtract_strict(demand);
        true
    }

    /// Adds resources back, clamped by the static vector so that bookkeeping
    /// drift after failures cannot inflate capacity.
    pub fn release_local(&mut self, demand: &ResourceSet) {
        let local = self
            .nodes
            .get_mut(&self.local_node_id)
            .expect("local node is always present");
        local.available = local
            .available
            .add_clamped(demand, &local.static_resources);
    }
}
