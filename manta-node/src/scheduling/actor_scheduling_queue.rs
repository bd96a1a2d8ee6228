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

use manta_common::model::Task;
use std::collections::BTreeMap;
use tracing::debug;

/// Per-actor dispatch queue ordered by `actor_counter`. Exactly one call is
/// in flight at a time; late arrivals slot into order, and counters at or
/// below the last executed one are duplicates from retries and are dropped.
pub struct ActorSchedulingQueue {
    queue: BTreeMap<u64, Task>,
    next_counter: u64,
    in_flight: Option<u64>,
}

impl ActorSchedulingQueue {
    pub fn new() -> Self {
        ActorSchedulingQueue {
            queue: BTreeMap::new(),
            next_counter: 0,
            in_flight: None,
        }
    }

    /// Inserts in counter order; returns false for dropped duplicates.
    pub fn push(&mut self, task: Task) -> bool {
        let counter = task.spec.actor_counter;
        if counter < self.next_counter {
            debug!(
                task_id = %task.spec.task_id,
                counter,
                next = self.next_counter,
                "dropping duplicate actor task"
            );
            return false;
        }
        self.queue.insert(counter, task);
        true
    }

    /// Pops the head when it is exactly the next expected counter and no
    /// call is currently executing. `worker_idle` reflects the pinned
    /// worker's state.
    pub fn pop_ready(&mut self, worker_idle: bool) -> Option<Task> {
        if !worker_idle || self.in_flight.is_some() {
            return None;
        }
        let head = *self.queue.keys().next()?;
        if head != self.next_counter {
            return None;
        }
        self.in_flight = Some(head);
        self.queue.remove(&head)
    }

    /// The in-flight call finished; the sequence advances.
    pub fn on_executed(&mut self, counter: u64) {
        if self.in_flight == Some(counter) {
            self.in_flight = None;
        }
        self.next_counter = self.next_counter.max(counter + 1);
    }

    /// The in-flight call failed before executing (worker died); it goes
    /// back into the queue for the replacement worker.
    pub fn requeue(&mut self, task: Task) {
        let counter = task.spec.actor_counter;
        if self.in_flight == Some(counter) {
            self.in_flight = None;
        }
        if counter >= self.next_counter {
            self.queue.insert(counter, task);
        }
    }

    /// Re-seeds the expected sequence after a restore; stale queued entries
    /// are dropped.
    pub fn reset_to(&mut self, next_counter: u64) {
        self.next_counter = next_counter;
        self.in_flight = None;
        self.queue = self.queue.split_off(&next_counter);
    }

    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for ActorSchedulingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::{
        ActorHandleId, ActorId, FunctionDescriptor, JobId, Language, ResourceSet, TaskId,
        TaskSpecBuilder, WorkerId,
    };

    fn actor_task(counter: u64) -> Task {
        let driver = TaskId::for_driver(
            JobId::from_bytes([2, 2, 2, 2]),
            &WorkerId::from_bytes([3u8; 16]),
        );
        let actor_id = ActorId::from_creation_task(&driver);
        let spec = TaskSpecBuilder::new(
            JobId::from_bytes([2, 2, 2, 2]),
            driver,
            counter as u32,
            driver,
            Language::Rust,
            FunctionDescriptor::new(["push"]),
            vec![],
            2,
            ResourceSet::new(),
            ResourceSet::new(),
        )
        .actor_task(actor_id, ActorHandleId::nil(), counter, vec![])
        .build();
        Task::new(spec, vec![])
    }

    #[test]
    fn executes_in_counter_order_without_gaps() {
        let mut queue = ActorSchedulingQueue::new();
        // Arrivals out of order.
        queue.push(actor_task(1));
        queue.push(actor_task(0));
        queue.push(actor_task(2));

        let mut executed = Vec::new();
        while let Some(task) = queue.pop_ready(true) {
            let counter = task.spec.actor_counter;
            executed.push(counter);
            queue.on_executed(counter);
        }
        assert_eq!(executed, vec![0, 1, 2]);
    }

    #[test]
    fn waits_for_missing_predecessors() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(1));
        assert!(queue.pop_ready(true).is_none());
        queue.push(actor_task(0));
        assert_eq!(queue.pop_ready(true).unwrap().spec.actor_counter, 0);
    }

    #[test]
    fn duplicates_at_or_below_last_executed_are_dropped() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(0));
        let task = queue.pop_ready(true).unwrap();
        queue.on_executed(task.spec.actor_counter);

        assert!(!queue.push(actor_task(0)));
        assert!(queue.push(actor_task(1)));
    }

    #[test]
    fn one_call_in_flight_at_a_time() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(0));
        queue.push(actor_task(1));
        assert!(queue.pop_ready(true).is_some());
        assert!(queue.pop_ready(true).is_none());
        queue.on_executed(0);
        assert_eq!(queue.pop_ready(true).unwrap().spec.actor_counter, 1);
    }

    #[test]
    fn busy_worker_blocks_dispatch() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(0));
        assert!(queue.pop_ready(false).is_none());
    }

    #[test]
    fn requeue_allows_retry_after_worker_death() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(0));
        queue.push(actor_task(1));
        let task = queue.pop_ready(true).unwrap();
        queue.requeue(task);
        // Counter 0 runs again before 1; nothing was skipped.
        assert_eq!(queue.pop_ready(true).unwrap().spec.actor_counter, 0);
    }

    #[test]
    fn reset_drops_stale_entries() {
        let mut queue = ActorSchedulingQueue::new();
        queue.push(actor_task(0));
        queue.push(actor_task(1));
        queue.push(actor_task(2));
        queue.reset_to(2);
        assert_eq!(queue.pop_ready(true).unwrap().spec.actor_counter, 2);
        assert!(queue.is_empty());
    }
}
