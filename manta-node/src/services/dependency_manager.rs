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

use manta_common::model::{ObjectId, TaskId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

struct TaskEntry {
    missing: HashSet<ObjectId>,
    /// The bundle this task holds in the pull manager while it waits.
    pull_request_id: Option<u64>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskEntry>,
    dependents: HashMap<ObjectId, HashSet<TaskId>>,
    local_objects: HashSet<ObjectId>,
}

/// Tracks which queued tasks still miss which arguments. The node manager
/// feeds it store arrivals and evictions; it answers with the tasks that
/// became ready (or blocked again).
#[derive(Default)]
pub struct TaskDependencyManager {
    state: Mutex<State>,
}

impl TaskDependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task's dependency set. Returns true when everything is
    /// already local and the task can be dispatched right away.
    pub fn subscribe_dependencies(&self, task_id: TaskId, dependencies: &[ObjectId]) -> bool {
        let mut state = self.state.lock().unwrap();
        let missing: HashSet<ObjectId> = dependencies
            .iter()
            .filter(|object_id| !state.local_objects.contains(*object_id))
            .copied()
            .collect();
        for object_id in &missing {
            state
                .dependents
                .entry(*object_id)
                .or_default()
                .insert(task_id);
        }
        let ready = missing.is_empty();
        state.tasks.insert(
            task_id,
            TaskEntry {
                missing,
                pull_request_id: None,
            },
        );
        ready
    }

    /// Drops a task's subscriptions (dispatch, cancellation, or failure).
    /// Returns the pull bundle to cancel, if one was opened.
    pub fn unsubscribe_dependencies(&self, task_id: &TaskId) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let entry = state.tasks.remove(task_id)?;
        for object_id in &entry.missing {
            if let Some(dependents) = state.dependents.get_mut(object_id) {
                dependents.remove(task_id);
                if dependents.is_empty() {
                    state.dependents.remove(object_id);
                }
            }
        }
        entry.pull_request_id
    }

    pub fn set_pull_request(&self, task_id: &TaskId, pull_request_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.tasks.get_mut(task_id) {
            entry.pull_request_id = Some(pull_request_id);
        }
    }

    /// An object became local; returns every waiting task that now has all
    /// of its dependencies.
    pub fn handle_object_local(&self, object_id: ObjectId) -> Vec<TaskId> {
        let mut state = self.state.lock().unwrap();
        state.local_objects.insert(object_id);
        let Some(dependents) = state.dependents.remove(&object_id) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for task_id in dependents {
            if let Some(entry) = state.tasks.get_mut(&task_id) {
                entry.missing.remove(&object_id);
                if entry.missing.is_empty() {
                    ready.push(task_id);
                }
            }
        }
        if !ready.is_empty() {
            debug!(%object_id, ready = ready.len(), "object arrival unblocked tasks");
        }
        ready
    }

    /// An object disappeared from the local store; returns the tasks that
    /// were counting on it and must go back to waiting.
    pub fn handle_object_missing(&self, object_id: ObjectId) -> Vec<TaskId> {
        let mut state = self.state.lock().unwrap();
        state.local_objects.remove(&object_id);
        let mut blocked = Vec::new();
        let waiting: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, entry)| !entry.missing.contains(&object_id))
            .map(|(task_id, _)| *task_id)
            .collect();
        for task_id in waiting {
            // Only tasks that actually depend on the object re-block.
            let depends = state
                .dependents
                .get(&object_id)
                .map(|dependents| dependents.contains(&task_id))
                .unwrap_or(false);
            if depends {
                if let Some(entry) = state.tasks.get_mut(&task_id) {
                    entry.missing.insert(object_id);
                    blocked.push(task_id);
                }
            }
        }
        blocked
    }

    pub fn missing_objects(&self, task_id: &TaskId) -> Vec<ObjectId> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(task_id)
            .map(|entry| entry.missing.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_task_ready(&self, task_id: &TaskId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(task_id)
            .map(|entry| entry.missing.is_empty())
            .unwrap_or(false)
    }
}
