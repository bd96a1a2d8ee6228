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

use crate::scheduling::ClusterView;
use manta_common::model::{NodeId, ObjectId, TaskSpec};
use rand::Rng;

/// Sizes and holders of one object, as known to the directory; the locality
/// input of the scheduling policy.
pub type ObjectLocality<'a> = &'a dyn Fn(&ObjectId) -> Vec<(NodeId, u64)>;

/// Picks the node a task should run on, or `None` when no feasible node has
/// capacity right now (the caller retries on resource updates).
pub trait SchedulingPolicy: Send + Sync {
    fn schedule(
        &self,
        spec: &TaskSpec,
        view: &ClusterView,
        locality: ObjectLocality<'_>,
    ) -> Option<NodeId>;
}

/// The canonical policy: feasibility on static resources, schedulability on
/// current availability, then best argument locality, random among ties.
pub struct CapacityLocalityPolicy;

impl SchedulingPolicy for CapacityLocalityPolicy {
    fn schedule(
        &self,
        spec: &TaskSpec,
        view: &ClusterView,
        locality: ObjectLocality<'_>,
    ) -> Option<NodeId> {
        let placement = spec.placement_resources();
        let schedulable: Vec<NodeId> = view
            .nodes()
            .filter(|(_, resources)| placement.is_subset_of(&resources.static_resources))
            .filter(|(_, resources)| spec.required_resources.is_subset_of(&resources.available))
            .map(|(node_id, _)| *node_id)
            .collect();
        if schedulable.is_empty() {
            return None;
        }

        // Locality score: bytes of the task's arguments already present on
        // the candidate.
        let mut scores: Vec<(NodeId, u64)> =
            schedulable.iter().map(|node_id| (*node_id, 0u64)).collect();
        for object_id in spec.dependencies() {
            for (holder, size) in locality(&object_id) {
                if let Some(entry) = scores.iter_mut().find(|(node_id, _)| *node_id == holder) {
                    entry.1 += size;
                }
            }
        }

        let best = scores.iter().map(|(_, score)| *score).max().unwrap_or(0);
        let winners: Vec<NodeId> = scores
            .into_iter()
            .filter(|(_, score)| *score == best)
            .map(|(node_id, _)| node_id)
            .collect();
        let index = if winners.len() > 1 {
            rand::rng().random_range(0..winners.len())
        } else {
            0
        };
        Some(winners[index])
    }
}
