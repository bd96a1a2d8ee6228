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

use crate::store::{ClientId, PlasmaError, PlasmaObject};
use manta_common::model::ObjectId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Invoked with the effective `evict_if_full` flag for the attempt.
pub type CreateObjectCallback =
    Box<dyn FnMut(bool) -> Result<PlasmaObject, PlasmaError> + Send>;

/// Asks the embedding process to move sealed objects to external storage;
/// returns whether anything could be spilled.
pub type SpillObjectsCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Asks the embedding process to reclaim heap memory cluster-wide.
pub type GlobalGcCallback = Arc<dyn Fn() + Send + Sync>;

const GLOBAL_GC_MIN_INTERVAL: Duration = Duration::from_secs(10);

struct CreateRequest {
    object_id: ObjectId,
    request_id: u64,
    client: ClientId,
    callback: CreateObjectCallback,
}

/// Admission queue in front of the store so that concurrent creates under
/// memory pressure retry in order instead of live-locking each other.
/// Results are retrievable exactly once by request id.
pub struct CreateRequestQueue {
    queue: VecDeque<CreateRequest>,
    /// `None` while the request is still queued; the result exactly once
    /// after it finished, until the client picks it up.
    fulfilled: HashMap<u64, Option<(ClientId, Result<PlasmaObject, PlasmaError>)>>,
    next_request_id: u64,
    evict_if_full_default: bool,
    /// Failed attempts of the current head request; after the first failure
    /// every retry is allowed to evict.
    num_retries: u32,
    spill_objects_callback: SpillObjectsCallback,
    trigger_global_gc: Option<GlobalGcCallback>,
    last_global_gc: Option<Instant>,
}

impl CreateRequestQueue {
    pub fn new(
        evict_if_full_default: bool,
        spill_objects_callback: SpillObjectsCallback,
        trigger_global_gc: Option<GlobalGcCallback>,
    ) -> Self {
        CreateRequestQueue {
            queue: VecDeque::new(),
            fulfilled: HashMap::new(),
            next_request_id: 1,
            evict_if_full_default,
            num_retries: 0,
            spill_objects_callback,
            trigger_global_gc,
            last_global_gc: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn add_request(
        &mut self,
        object_id: ObjectId,
        client: ClientId,
        callback: CreateObjectCallback,
    ) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.fulfilled.insert(request_id, None);
        self.queue.push_back(CreateRequest {
            object_id,
            request_id,
            client,
            callback,
        });
        request_id
    }

    /// One-shot, idempotent retrieval: `None` while pending, the result
    /// exactly once after completion. Asking again (or for an unknown id)
    /// yields an error so a confused client cannot hang.
    pub fn get_request_result(
        &mut self,
        request_id: u64,
    ) -> Option<Result<PlasmaObject, PlasmaError>> {
        match self.fulfilled.get(&request_id) {
            None => {
                error!(
                    request_id,
                    "create result requested after it was already returned"
                );
                Some(Err(PlasmaError::UnexpectedError(
                    "create request result no longer available".to_string(),
                )))
            }
            Some(None) => None,
            Some(Some(_)) => {
                let (_, result) = self.fulfilled.remove(&request_id).unwrap().unwrap();
                Some(result)
            }
        }
    }

    /// Fast path for a caller that does not want to queue: only valid when
    /// the queue is empty, otherwise the caller is told the store is out of
    /// memory right away.
    pub fn try_request_immediately(
        &mut self,
        object_id: ObjectId,
        client: ClientId,
        callback: CreateObjectCallback,
    ) -> Result<PlasmaObject, PlasmaError> {
        if !self.queue.is_empty() {
            return Err(PlasmaError::OutOfMemory);
        }
        let request_id = self.add_request(object_id, client, callback);
        if self.process_requests().is_err() && !self.queue.is_empty() {
            // The request could not be served synchronously; fail it now
            // rather than leaving the caller to poll.
            self.finish_front(Err(PlasmaError::OutOfMemory));
        }
        self.get_request_result(request_id)
            .expect("immediate request must be finished")
    }

    /// Drains the FIFO head-first. Stops (keeping the head queued) when the
    /// store reports pressure that a spill may relieve; finishes the head
    /// with ObjectStoreFull when spilling cannot make progress.
    pub fn process_requests(&mut self) -> Result<(), PlasmaError> {
        while !self.queue.is_empty() {
            let evict_if_full = self.evict_if_full_default || self.num_retries > 0;
            let result = {
                let request = self.queue.front_mut().unwrap();
                (request.callback)(evict_if_full)
            };
            match result {
                Err(PlasmaError::OutOfMemory) | Err(PlasmaError::TransientObjectStoreFull) => {
                    self.num_retries += 1;
                    if !(self.spill_objects_callback)() {
                        error!("cannot spill any more objects, create fails terminally");
                        self.finish_front(Err(PlasmaError::ObjectStoreFull));
                        return Err(PlasmaError::ObjectStoreFull);
                    }
                    self.trigger_global_gc_if_needed();
                    return Err(PlasmaError::TransientObjectStoreFull);
                }
                result => {
                    self.finish_front(result);
                }
            }
        }
        Ok(())
    }

    /// Purges queued and fulfilled-but-unread requests of a client that went
    /// away, so nothing leaks.
    pub fn remove_disconnected_client_requests(&mut self, client: ClientId) {
        let removed: Vec<u64> = self
            .queue
            .iter()
            .filter(|request| request.client == client)
            .map(|request| request.request_id)
            .collect();
        self.queue.retain(|request| request.client != client);
        for request_id in removed {
            self.fulfilled.remove(&request_id);
        }
        self.fulfilled.retain(|_, slot| match slot {
            Some((owner, _)) => *owner != client,
            None => true,
        });
    }

    fn finish_front(&mut self, result: Result<PlasmaObject, PlasmaError>) {
        let request = self.queue.pop_front().expect("finishing an empty queue");
        debug!(object_id = %request.object_id, request_id = request.request_id, ok = result.is_ok(), "create request finished");
        self.fulfilled
            .insert(request.request_id, Some((request.client, result)));
        self.num_retries = 0;
    }

    fn trigger_global_gc_if_needed(&mut self) {
        if let Some(trigger) = &self.trigger_global_gc {
            let due = self
                .last_global_gc
                .map(|at| at.elapsed() >= GLOBAL_GC_MIN_INTERVAL)
                .unwrap_or(true);
            if due {
                trigger();
                self.last_global_gc = Some(Instant::now());
            }
        }
    }
}
