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

use manta_common::metrics;
use manta_common::model::{NodeId, ObjectId};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Sends a peer pull request for one object to the chosen node.
pub type SendPullRequest = Arc<dyn Fn(ObjectId, NodeId) + Send + Sync>;

/// Restores one spilled object; returns whether the restore was started.
pub type RestoreSpilledObject = Arc<dyn Fn(ObjectId, String) -> bool + Send + Sync>;

const MAX_BACKOFF_DOUBLINGS: u32 = 5;

struct ObjectPullRequest {
    locations: Vec<NodeId>,
    spilled_url: Option<String>,
    size: Option<u64>,
    num_tries: u32,
    last_attempt: Option<Instant>,
    is_local: bool,
    /// How many queued bundles reference the object.
    bundle_refs: usize,
}

impl ObjectPullRequest {
    fn new() -> Self {
        ObjectPullRequest {
            locations: Vec::new(),
            spilled_url: None,
            size: None,
            num_tries: 0,
            last_attempt: None,
            is_local: false,
            bundle_refs: 0,
        }
    }

    fn billed_size(&self) -> u64 {
        if self.is_local {
            0
        } else {
            self.size.unwrap_or(0)
        }
    }
}

struct PullState {
    requests: HashMap<ObjectId, ObjectPullRequest>,
    /// FIFO of submitted bundles; admission never reorders or splits them.
    bundles: Vec<(u64, Vec<ObjectId>)>,
    active: HashSet<ObjectId>,
    num_bytes_available: u64,
    next_request_id: u64,
}

impl PullState {
    fn active_bytes(&self) -> u64 {
        self.active
            .iter()
            .filter_map(|object_id| self.requests.get(object_id))
            .map(|request| request.billed_size())
            .sum()
    }

    /// Greedy FIFO admission: bundles are admitted whole, in submission
    /// order, until the next one no longer fits the byte budget.
    fn recompute_active(&mut self) {
        let mut new_active: HashSet<ObjectId> = HashSet::new();
        let mut admitted_bytes: u64 = 0;
        for (_, object_ids) in &self.bundles {
            let additional: u64 = object_ids
                .iter()
                .filter(|object_id| !new_active.contains(*object_id))
                .filter_map(|object_id| self.requests.get(object_id))
                .map(|request| request.billed_size())
                .sum();
            if admitted_bytes + additional > self.num_bytes_available {
                break;
            }
            admitted_bytes += additional;
            for object_id in object_ids {
                if let Some(request) = self.requests.get(object_id) {
                    if !request.is_local {
                        new_active.insert(*object_id);
                    }
                }
            }
        }
        self.active = new_active;
    }
}

/// Decides which remote objects this node requests at a time, under the byte
/// budget advised by the object store. Bundles (the object sets of single
/// tasks) are admitted atomically in FIFO order; active objects are retried
/// with exponential backoff, preferring restore-from-spill over peer pulls.
pub struct PullManager {
    state: Mutex<PullState>,
    send_pull_request: SendPullRequest,
    restore_spilled_object: RestoreSpilledObject,
    backoff_base: Duration,
}

impl PullManager {
    pub fn new(
        num_bytes_available: u64,
        backoff_base: Duration,
        send_pull_request: SendPullRequest,
        restore_spilled_object: RestoreSpilledObject,
    ) -> Self {
        PullManager {
            state: Mutex::new(PullState {
                requests: HashMap::new(),
                bundles: Vec::new(),
                active: HashSet::new(),
                num_bytes_available,
                next_request_id: 1,
            }),
            send_pull_request,
            restore_spilled_object,
            backoff_base,
        }
    }

    /// Queues one bundle. Returns the bundle id and the object ids that were
    /// not yet known here, for which the caller must start location lookups.
    pub fn pull(&self, refs: &[ObjectId]) -> (u64, Vec<ObjectId>) {
        let mut state = self.state.lock().unwrap();
        let request_id = state.next_request_id;
        state.next_request_id += 1;

        let mut deduped = Vec::new();
        let mut needs_lookup = Vec::new();
        for object_id in refs {
            if deduped.contains(object_id) {
                continue;
            }
            deduped.push(*object_id);
            let request = state
                .requests
                .entry(*object_id)
                .or_insert_with(ObjectPullRequest::new);
            if request.bundle_refs == 0 {
                needs_lookup.push(*object_id);
            }
            request.bundle_refs += 1;
        }
        state.bundles.push((request_id, deduped));
        state.recompute_active();
        debug!(request_id, lookups = needs_lookup.len(), "queued pull bundle");
        (request_id, needs_lookup)
    }

    /// Drops one bundle; returns the object ids no longer referenced by any
    /// bundle so the caller can unsubscribe their location feeds.
    pub fn cancel_pull(&self, request_id: u64) -> Vec<ObjectId> {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state
            .bundles
            .iter()
            .position(|(id, _)| *id == request_id)
        else {
            return Vec::new();
        };
        let (_, object_ids) = state.bundles.remove(position);

        let mut to_cancel = Vec::new();
        for object_id in object_ids {
            if let Some(request) = state.requests.get_mut(&object_id) {
                request.bundle_refs -= 1;
                if request.bundle_refs == 0 {
                    state.requests.remove(&object_id);
                    to_cancel.push(object_id);
                }
            }
        }
        state.recompute_active();
        to_cancel
    }

    /// Feeds a location update from the directory into the pull state.
    pub fn on_location_change(
        &self,
        object_id: ObjectId,
        node_ids: Vec<NodeId>,
        spilled_url: Option<String>,
        size: Option<u64>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(request) = state.requests.get_mut(&object_id) {
            request.locations = node_ids;
            request.spilled_url = spilled_url;
            if size.is_some() {
                request.size = size;
            }
            state.recompute_active();
        }
    }

    /// The object arrived locally; it stops counting against the budget and
    /// the next queued bundle may be promoted.
    pub fn on_object_local(&self, object_id: ObjectId) {
        let mut state = self.state.lock().unwrap();
        if let Some(request) = state.requests.get_mut(&object_id) {
            request.is_local = true;
            state.recompute_active();
        }
    }

    pub fn update_pulls_based_on_available_memory(&self, num_bytes_available: u64) {
        let mut state = self.state.lock().unwrap();
        state.num_bytes_available = num_bytes_available;
        state.recompute_active();
    }

    /// Periodic retry pass. Every active object whose backoff has elapsed
    /// gets one attempt: restore-from-spill when a spill location is known
    /// (falling back to a peer pull if the restore cannot start), otherwise
    /// a pull from a uniformly random holder.
    pub fn tick(&self, now: Instant) {
        enum Attempt {
            Restore(ObjectId, String, Option<NodeId>),
            Peer(ObjectId, NodeId),
        }

        let mut attempts = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let active: Vec<ObjectId> = state.active.iter().copied().collect();
            for object_id in active {
                let backoff_base = self.backoff_base;
                let Some(request) = state.requests.get_mut(&object_id) else {
                    continue;
                };
                if request.is_local {
                    continue;
                }
                let due = match request.last_attempt {
                    None => true,
                    Some(at) => {
                        let doublings = request.num_tries.min(MAX_BACKOFF_DOUBLINGS);
                        now.duration_since(at) >= backoff_base * 2u32.pow(doublings)
                    }
                };
                if !due {
                    continue;
                }

                let fallback = pick_random(&request.locations);
                if let Some(url) = request.spilled_url.clone() {
                    request.num_tries += 1;
                    request.last_attempt = Some(now);
                    attempts.push(Attempt::Restore(object_id, url, fallback));
                } else if let Some(node_id) = fallback {
                    request.num_tries += 1;
                    request.last_attempt = Some(now);
                    attempts.push(Attempt::Peer(object_id, node_id));
                }
            }
        }

        for attempt in attempts {
            match attempt {
                Attempt::Restore(object_id, url, fallback) => {
                    if !(self.restore_spilled_object)(object_id, url) {
                        if let Some(node_id) = fallback {
                            (self.send_pull_request)(object_id, node_id);
                        }
                    }
                    metrics::record_object_pulled();
                }
                Attempt::Peer(object_id, node_id) => {
                    (self.send_pull_request)(object_id, node_id);
                    metrics::record_object_pulled();
                }
            }
        }
    }

    pub fn active_objects(&self) -> HashSet<ObjectId> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn active_bytes(&self) -> u64 {
        self.state.lock().unwrap().active_bytes()
    }

    pub fn num_bytes_available(&self) -> u64 {
        self.state.lock().unwrap().num_bytes_available
    }
}

fn pick_random(locations: &[NodeId]) -> Option<NodeId> {
    if locations.is_empty() {
        None
    } else {
        let index = rand::rng().random_range(0..locations.len());
        Some(locations[index])
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::{JobId, TaskId, WorkerId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn object(i: u32) -> ObjectId {
        let task =
            TaskId::for_driver(JobId::from_bytes([0, 0, 1, 0]), &WorkerId::from_bytes([5u8; 16]));
        ObjectId::for_task_return(&task, i)
    }

    fn node(i: u8) -> NodeId {
        NodeId::from_bytes([i; 16])
    }

    fn manager(budget: u64) -> (Arc<PullManager>, Arc<Mutex<Vec<(ObjectId, NodeId)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_in_callback = sent.clone();
        let manager = Arc::new(PullManager::new(
            budget,
            Duration::from_millis(10),
            Arc::new(move |object_id, node_id| {
                sent_in_callback.lock().unwrap().push((object_id, node_id));
            }),
            Arc::new(|_, _| true),
        ));
        (manager, sent)
    }

    #[test]
    fn bundles_admit_in_fifo_order_within_budget() {
        let (manager, _) = manager(10);
        let (first, _) = manager.pull(&[object(0)]);
        manager.on_location_change(object(0), vec![node(1)], None, Some(8));
        let (_second, _) = manager.pull(&[object(1)]);
        manager.on_location_change(object(1), vec![node(1)], None, Some(8));

        assert_eq!(manager.active_objects(), HashSet::from([object(0)]));
        assert!(manager.active_bytes() <= manager.num_bytes_available());

        // Canceling the head promotes the next bundle; they are never active
        // together.
        let canceled = manager.cancel_pull(first);
        assert_eq!(canceled, vec![object(0)]);
        assert_eq!(manager.active_objects(), HashSet::from([object(1)]));
    }

    #[test]
    fn pull_dedups_known_objects() {
        let (manager, _) = manager(100);
        let (_, lookups) = manager.pull(&[object(0), object(0), object(1)]);
        assert_eq!(lookups, vec![object(0), object(1)]);
        let (_, lookups) = manager.pull(&[object(0), object(2)]);
        assert_eq!(lookups, vec![object(2)]);
    }

    #[test]
    fn budget_shrink_deactivates_the_tail() {
        let (manager, _) = manager(20);
        manager.pull(&[object(0)]);
        manager.pull(&[object(1)]);
        manager.on_location_change(object(0), vec![node(1)], None, Some(8));
        manager.on_location_change(object(1), vec![node(1)], None, Some(8));
        assert_eq!(manager.active_objects().len(), 2);

        manager.update_pulls_based_on_available_memory(10);
        assert_eq!(manager.active_objects(), HashSet::from([object(0)]));
        assert!(manager.active_bytes() <= 10);
    }

    #[test]
    fn local_objects_stop_counting_and_promote_followers() {
        let (manager, _) = manager(10);
        manager.pull(&[object(0)]);
        manager.pull(&[object(1)]);
        manager.on_location_change(object(0), vec![node(1)], None, Some(8));
        manager.on_location_change(object(1), vec![node(1)], None, Some(8));
        manager.on_object_local(object(0));
        assert_eq!(manager.active_objects(), HashSet::from([object(1)]));
    }

    #[test]
    fn tick_sends_peer_requests_and_backs_off() {
        let (manager, sent) = manager(100);
        manager.pull(&[object(0)]);
        manager.on_location_change(object(0), vec![node(1)], None, Some(4));

        let start = Instant::now();
        manager.tick(start);
        assert_eq!(sent.lock().unwrap().len(), 1);
        // Within the backoff window nothing is re-sent.
        manager.tick(start + Duration::from_millis(5));
        assert_eq!(sent.lock().unwrap().len(), 1);
        // After the doubled backoff the retry fires.
        manager.tick(start + Duration::from_millis(25));
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn failed_restore_falls_back_to_peer_pull() {
        let restores = Arc::new(AtomicUsize::new(0));
        let restores_in_callback = restores.clone();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_in_callback = sent.clone();
        let manager = PullManager::new(
            100,
            Duration::from_millis(10),
            Arc::new(move |object_id, node_id| {
                sent_in_callback.lock().unwrap().push((object_id, node_id));
            }),
            Arc::new(move |_, _| {
                restores_in_callback.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        manager.pull(&[object(0)]);
        manager.on_location_change(
            object(0),
            vec![node(2)],
            Some("spill:///o0".to_string()),
            Some(4),
        );
        manager.tick(Instant::now());
        assert_eq!(restores.load(Ordering::SeqCst), 1);
        assert_eq!(sent.lock().unwrap().as_slice(), &[(object(0), node(2))]);
    }

    #[test]
    fn cancel_keeps_objects_still_referenced_elsewhere() {
        let (manager, _) = manager(100);
        let (first, _) = manager.pull(&[object(0), object(1)]);
        let (_second, _) = manager.pull(&[object(1)]);
        let canceled = manager.cancel_pull(first);
        assert_eq!(canceled, vec![object(0)]);
        assert!(manager.cancel_pull(first).is_empty());
    }
}
