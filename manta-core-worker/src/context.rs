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

use manta_common::model::{JobId, TaskId, WorkerId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Ambient identity of a worker process. Submission and put indices are
/// scoped to the current task, so a re-executed task derives the same child
/// task ids and put ids as the original run.
pub struct WorkerContext {
    worker_id: WorkerId,
    job_id: JobId,
    current_task_id: Mutex<TaskId>,
    task_index: AtomicU32,
    put_index: AtomicU32,
}

impl WorkerContext {
    pub fn new(worker_id: WorkerId, job_id: JobId) -> Self {
        let driver_task_id = TaskId::for_driver(job_id, &worker_id);
        WorkerContext {
            worker_id,
            job_id,
            current_task_id: Mutex::new(driver_task_id),
            task_index: AtomicU32::new(0),
            put_index: AtomicU32::new(0),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn current_task_id(&self) -> TaskId {
        *self.current_task_id.lock().unwrap()
    }

    /// Entering a task resets the per-task counters.
    pub fn set_current_task(&self, task_id: TaskId) {
        *self.current_task_id.lock().unwrap() = task_id;
        self.task_index.store(0, Ordering::SeqCst);
        self.put_index.store(0, Ordering::SeqCst);
    }

    pub fn next_task_index(&self) -> u32 {
        self.task_index.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_put_index(&self) -> u32 {
        self.put_index.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn counters_reset_per_task() {
        let context = WorkerContext::new(WorkerId::new_random(), JobId::new_random());
        assert_eq!(context.next_task_index(), 0);
        assert_eq!(context.next_task_index(), 1);
        assert_eq!(context.next_put_index(), 0);

        let other = TaskId::for_driver(context.job_id(), &WorkerId::new_random());
        context.set_current_task(other);
        assert_eq!(context.current_task_id(), other);
        assert_eq!(context.next_task_index(), 0);
        assert_eq!(context.next_put_index(), 0);
    }
}
