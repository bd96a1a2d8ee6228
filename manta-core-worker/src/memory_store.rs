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

use manta_common::error::{MantaError, Result};
use manta_common::model::{ObjectId, ObjectValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One blocking `Get` or `Wait` call. Both register against every missing
/// id; a `Get` needs all of them, a `Wait` is satisfied once `num_required`
/// arrived.
struct GetOrWaitRequest {
    object_ids: Vec<ObjectId>,
    is_get: bool,
    num_required: usize,
    state: Mutex<HashMap<ObjectId, ObjectValue>>,
    ready: Notify,
}

impl GetOrWaitRequest {
    fn new(object_ids: Vec<ObjectId>, is_get: bool, num_required: usize) -> Arc<Self> {
        Arc::new(GetOrWaitRequest {
            object_ids,
            is_get,
            num_required,
            state: Mutex::new(HashMap::new()),
            ready: Notify::new(),
        })
    }

    /// Called under the store lock; each waiter sees exactly one wake once
    /// its requirement is met.
    fn set(&self, object_id: ObjectId, value: ObjectValue) {
        let mut state = self.state.lock().unwrap();
        state.insert(object_id, value);
        if state.len() >= self.num_required {
            self.ready.notify_waiters();
            self.ready.notify_one();
        }
    }

    fn is_satisfied(&self) -> bool {
        self.state.lock().unwrap().len() >= self.num_required
    }

    fn take(&self, object_id: &ObjectId) -> Option<ObjectValue> {
        self.state.lock().unwrap().get(object_id).cloned()
    }
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, ObjectValue>,
    waiters: HashMap<ObjectId, Vec<Arc<GetOrWaitRequest>>>,
}

/// The per-worker small-object map. Values put here wake any blocked `Get`
/// or `Wait`; a value consumed by a waiting `Get` is handed over directly
/// and never enters the map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, object_id: ObjectId, value: ObjectValue) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.contains_key(&object_id) {
            return Err(MantaError::key_error(format!(
                "object {object_id} already exists"
            )));
        }

        let mut consumed_by_get = false;
        if let Some(waiters) = inner.waiters.get(&object_id) {
            for waiter in waiters {
                waiter.set(object_id, value.clone());
                if waiter.is_get {
                    consumed_by_get = true;
                }
            }
        }
        if !consumed_by_get {
            inner.objects.insert(object_id, value);
        }
        Ok(())
    }

    pub async fn get(
        &self,
        object_ids: &[ObjectId],
        timeout: Duration,
    ) -> Vec<Option<ObjectValue>> {
        self.get_or_wait(object_ids, timeout, true, object_ids.len())
            .await
    }

    pub async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_objects: usize,
        timeout: Duration,
    ) -> Result<Vec<bool>> {
        if num_objects > object_ids.len() {
            return Err(MantaError::invalid(
                "num_objects should not exceed the number of object ids",
            ));
        }
        let results = self
            .get_or_wait(object_ids, timeout, false, num_objects)
            .await;
        Ok(results.into_iter().map(|value| value.is_some()).collect())
    }

    pub fn delete(&self, object_ids: &[ObjectId]) {
        let mut inner = self.inner.lock().unwrap();
        for object_id in object_ids {
            inner.objects.remove(object_id);
        }
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.inner.lock().unwrap().objects.contains_key(object_id)
    }

    async fn get_or_wait(
        &self,
        object_ids: &[ObjectId],
        timeout: Duration,
        is_get: bool,
        num_required: usize,
    ) -> Vec<Option<ObjectValue>> {
        let mut results: Vec<Option<ObjectValue>> = vec![None; object_ids.len()];
        let request = {
            let mut inner = self.inner.lock().unwrap();
            let mut remaining = Vec::new();
            let mut num_present = 0;
            for (i, object_id) in object_ids.iter().enumerate() {
                if let Some(value) = inner.objects.get(object_id) {
                    results[i] = Some(value.clone());
                    num_present += 1;
                    if is_get {
                        inner.objects.remove(object_id);
                    }
                } else {
                    remaining.push(*object_id);
                }
            }
            if num_present >= num_required {
                return results;
            }

            // Register as a waiter for every missing id before releasing
            // the lock; the required count excludes what is already here.
            let request =
                GetOrWaitRequest::new(remaining.clone(), is_get, num_required - num_present);
            for object_id in &remaining {
                inner
                    .waiters
                    .entry(*object_id)
                    .or_default()
                    .push(request.clone());
            }
            request
        };

        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = request.ready.notified();
                if request.is_satisfied() {
                    break;
                }
                notified.await;
            }
        })
        .await;

        {
            let mut inner = self.inner.lock().unwrap();
            for (i, object_id) in object_ids.iter().enumerate() {
                if results[i].is_none() {
                    results[i] = request.take(object_id);
                }
            }
            // Deregistration is idempotent and trims empty waiter lists.
            for object_id in &request.object_ids {
                if let Some(waiters) = inner.waiters.get_mut(object_id) {
                    waiters.retain(|waiter| !Arc::ptr_eq(waiter, &request));
                    if waiters.is_empty() {
                        inner.waiters.remove(object_id);
                    }
                }
            }
        }
        results
    }
}
