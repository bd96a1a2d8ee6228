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

use crate::gcs::{TaskReconstructionData, TaskReconstructionLog};
use manta_common::error::Result;
use manta_common::metrics;
use manta_common::model::{NodeId, ObjectId, TaskId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Invoked when this node won the right to re-execute a task.
pub type ReconstructionHandler = Arc<dyn Fn(TaskId) + Send + Sync>;

const DEFAULT_NUM_TICKS: u32 = 2;

struct ObjectEntry {
    num_reconstructions: u32,
    num_ticks: u32,
}

#[derive(Default)]
struct State {
    listening: HashMap<ObjectId, ObjectEntry>,
    /// Ticks left per object before reconstruction is attempted.
    object_ticks: HashMap<ObjectId, u32>,
    /// Tasks with an append in flight, and the watched objects they
    /// produced. Siblings accumulate here instead of racing on their own
    /// appends.
    reconstructing_tasks: HashMap<TaskId, Vec<ObjectId>>,
}

/// Watches objects that local tasks are waiting for. An object that stays
/// silent for `num_ticks` tick periods triggers re-execution of its
/// producing task, arbitrated cluster-wide by a conditional append to the
/// task reconstruction log: the single winner re-submits the task, everyone
/// else only advances their attempt counter.
pub struct ReconstructionPolicy {
    node_id: NodeId,
    state: Mutex<State>,
    log: Arc<dyn TaskReconstructionLog>,
    handler: ReconstructionHandler,
}

impl ReconstructionPolicy {
    pub fn new(
        node_id: NodeId,
        log: Arc<dyn TaskReconstructionLog>,
        handler: ReconstructionHandler,
    ) -> Self {
        ReconstructionPolicy {
            node_id,
            state: Mutex::new(State::default()),
            log,
            handler,
        }
    }

    /// Starts watching an object. Idempotent. If the producing task is
    /// already mid-reconstruction the object joins its sibling list rather
    /// than starting a timer of its own.
    pub fn listen(&self, object_id: ObjectId) {
        let mut state = self.state.lock().unwrap();
        if state.listening.contains_key(&object_id) {
            return;
        }
        state.listening.insert(
            object_id,
            ObjectEntry {
                num_reconstructions: 0,
                num_ticks: DEFAULT_NUM_TICKS,
            },
        );

        let task_id = object_id.task_id();
        if let Some(siblings) = state.reconstructing_tasks.get_mut(&task_id) {
            if !siblings.contains(&object_id) {
                siblings.push(object_id);
            }
        } else {
            state.object_ticks.insert(object_id, DEFAULT_NUM_TICKS);
        }
    }

    /// A liveness signal for the object (location update, task lease
    /// renewal); its timer starts over.
    pub fn notify(&self, object_id: ObjectId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.listening.get(&object_id) {
            let num_ticks = entry.num_ticks;
            state.object_ticks.insert(object_id, num_ticks);
        }
    }

    /// Liveness for every watched return of a task, driven by task lease
    /// renewals.
    pub fn notify_task(&self, task_id: &TaskId) {
        let mut state = self.state.lock().unwrap();
        let watched: Vec<(ObjectId, u32)> = state
            .listening
            .iter()
            .filter(|(object_id, _)| object_id.task_id() == *task_id)
            .map(|(object_id, entry)| (*object_id, entry.num_ticks))
            .collect();
        for (object_id, num_ticks) in watched {
            state.object_ticks.insert(object_id, num_ticks);
        }
    }

    /// Stops watching and drops any in-flight bookkeeping for the object.
    pub fn cancel(&self, object_id: ObjectId) {
        let mut state = self.state.lock().unwrap();
        state.listening.remove(&object_id);
        state.object_ticks.remove(&object_id);
        let task_id = object_id.task_id();
        if let Some(siblings) = state.reconstructing_tasks.get_mut(&task_id) {
            siblings.retain(|sibling| *sibling != object_id);
        }
    }

    /// One timer period: counts every watched object down and attempts
    /// reconstruction for those that reached zero.
    pub async fn tick(&self) -> Result<()> {
        let timed_out: Vec<ObjectId> = {
            let mut state = self.state.lock().unwrap();
            let mut expired = Vec::new();
            state.object_ticks.retain(|object_id, ticks| {
                *ticks -= 1;
                if *ticks == 0 {
                    expired.push(*object_id);
                    false
                } else {
                    true
                }
            });
            expired
        };

        for object_id in timed_out {
            self.reconstruct(object_id).await?;
        }
        Ok(())
    }

    async fn reconstruct(&self, object_id: ObjectId) -> Result<()> {
        let task_id = object_id.task_id();
        let append_at_index = {
            let mut state = self.state.lock().unwrap();
            let siblings = state.reconstructing_tasks.entry(task_id).or_default();
            siblings.push(object_id);
            if siblings.len() > 1 {
                // Another sibling already has the append in flight.
                return Ok(());
            }
            match state.listening.get_mut(&object_id) {
                Some(entry) => {
                    let index = entry.num_reconstructions;
                    entry.num_reconstructions += 1;
                    index
                }
                None => {
                    // Canceled between timing out and getting here.
                    state.reconstructing_tasks.remove(&task_id);
                    return Ok(());
                }
            }
        };

        debug!(%object_id, %task_id, attempt = append_at_index, "attempting reconstruction");
        let appended = self
            .log
            .append_at(
                &task_id,
                append_at_index,
                TaskReconstructionData {
                    node_id: self.node_id,
                    num_reconstructions: append_at_index,
                },
            )
            .await?;
        self.handle_log_append(task_id, append_at_index, appended);
        Ok(())
    }

    fn handle_log_append(&self, task_id: TaskId, attempted_index: u32, appended: bool) {
        let object_ids = {
            let mut state = self.state.lock().unwrap();
            state
                .reconstructing_tasks
                .remove(&task_id)
                .unwrap_or_default()
        };
        if object_ids.is_empty() {
            // Everything we watched for this task was canceled meanwhile.
            return;
        }

        if appended {
            info!(%task_id, attempt = attempted_index, "reconstruction triggered");
            metrics::record_reconstruction_triggered();
            (self.handler)(task_id);
        }

        // The next attempt index is one past the attempt just decided, or
        // the highest count any sibling has already seen.
        let mut state = self.state.lock().unwrap();
        let mut next_attempt = attempted_index + 1;
        for object_id in &object_ids {
            if let Some(entry) = state.listening.get(object_id) {
                next_attempt = next_attempt.max(entry.num_reconstructions);
            }
        }
        for object_id in object_ids {
            if let Some(entry) = state.listening.get_mut(&object_id) {
                entry.num_reconstructions = next_attempt;
                let num_ticks = entry.num_ticks;
                state.object_ticks.insert(object_id, num_ticks);
            }
        }
    }

    pub fn is_listening(&self, object_id: &ObjectId) -> bool {
        self.state.lock().unwrap().listening.contains_key(object_id)
    }
}
