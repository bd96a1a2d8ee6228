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

use crate::allocator::{Allocation, Arena};
use crate::eviction::LruIndex;
use crate::hashing::content_hash;
use manta_common::config::ObjectStoreConfig;
use manta_common::error::MantaError;
use manta_common::metrics;
use manta_common::model::{ObjectId, ObjectInfo, ObjectValue};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Identifies one connected store client (a worker or the node manager
/// itself). Client zero is reserved for in-process callers.
pub type ClientId = u64;

pub const LOCAL_CLIENT: ClientId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PlasmaError {
    #[error("object store out of memory")]
    OutOfMemory,
    #[error("object already exists")]
    ObjectExists,
    #[error("object does not exist")]
    ObjectNonexistent,
    #[error("object store full, request may be retried after spilling")]
    TransientObjectStoreFull,
    #[error("object store full")]
    ObjectStoreFull,
    #[error("unexpected object store error: {0}")]
    UnexpectedError(String),
}

impl From<PlasmaError> for MantaError {
    fn from(err: PlasmaError) -> Self {
        match err {
            PlasmaError::OutOfMemory | PlasmaError::TransientObjectStoreFull => {
                MantaError::out_of_memory(err.to_string())
            }
            PlasmaError::ObjectStoreFull => MantaError::object_store_full(err.to_string()),
            PlasmaError::ObjectExists => MantaError::object_exists(err.to_string()),
            PlasmaError::ObjectNonexistent => MantaError::key_error(err.to_string()),
            PlasmaError::UnexpectedError(details) => MantaError::io_error(details),
        }
    }
}

/// Descriptor of a created (not necessarily sealed) object, shared with the
/// creating client so it can address its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlasmaObject {
    pub object_id: ObjectId,
    pub offset: usize,
    pub data_size: usize,
    pub metadata_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Unsealed,
    Sealed,
    Spilled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    ObjectAdded(ObjectInfo),
    ObjectRemoved(ObjectId),
}

struct Entry {
    allocation: Option<Allocation>,
    data_size: usize,
    metadata_size: usize,
    state: ObjectState,
    ref_count: usize,
    creating_client: ClientId,
    spilled_url: Option<String>,
    content_hash: u64,
}

impl Entry {
    fn total_size(&self) -> usize {
        self.data_size + self.metadata_size
    }

    fn info(&self, object_id: ObjectId) -> ObjectInfo {
        ObjectInfo {
            object_id,
            data_size: self.data_size as u64,
            metadata_size: self.metadata_size as u64,
            content_hash: self.content_hash,
        }
    }
}

struct StoreInner {
    arena: Arena,
    entries: HashMap<ObjectId, Entry>,
    lru: LruIndex,
    /// Releases deferred so that create/release churn does not thrash; the
    /// oldest entries are applied once the window overflows or usage crosses
    /// the watermark.
    release_history: VecDeque<(ClientId, ObjectId)>,
}

/// The node-local shared object store. All mutation happens under one lock;
/// callers on async loops use the non-blocking operations and subscribe for
/// notifications instead of holding the lock across waits.
pub struct PlasmaStore {
    inner: Mutex<StoreInner>,
    config: ObjectStoreConfig,
    notifications: broadcast::Sender<StoreNotification>,
    created_at: Instant,
}

impl PlasmaStore {
    pub fn new(config: ObjectStoreConfig) -> std::io::Result<Self> {
        let arena = Arena::new(config.capacity_bytes as usize)?;
        let (notifications, _) = broadcast::channel(1024);
        Ok(PlasmaStore {
            inner: Mutex::new(StoreInner {
                arena,
                entries: HashMap::new(),
                lru: LruIndex::new(),
                release_history: VecDeque::new(),
            }),
            config,
            notifications,
            created_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    pub fn uptime_ms(&self) -> u128 {
        self.created_at.elapsed().as_millis()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.notifications.subscribe()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.inner.lock().unwrap().arena.bytes_allocated() as u64
    }

    /// Advisory budget for the pull manager: what is not currently
    /// allocated.
    pub fn bytes_available(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        (inner.arena.capacity() - inner.arena.bytes_allocated()) as u64
    }

    /// Allocates an unsealed buffer for `object_id`. With `evict_if_full`
    /// the store evicts least-recently-released unreferenced objects until
    /// the allocation fits; without it a full store fails immediately.
    pub fn create(
        &self,
        client: ClientId,
        object_id: ObjectId,
        data_size: usize,
        metadata_size: usize,
        evict_if_full: bool,
    ) -> Result<PlasmaObject, PlasmaError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&object_id) {
            return Err(PlasmaError::ObjectExists);
        }

        let needed = data_size + metadata_size;
        let mut allocation = inner.arena.allocate(needed);
        if allocation.is_none() {
            if !evict_if_full {
                return Err(PlasmaError::OutOfMemory);
            }
            self.evict_locked(&mut inner, needed);
            allocation = inner.arena.allocate(needed);
        }

        let allocation = allocation.ok_or(PlasmaError::OutOfMemory)?;
        inner.entries.insert(
            object_id,
            Entry {
                allocation: Some(allocation),
                data_size,
                metadata_size,
                state: ObjectState::Unsealed,
                ref_count: 1,
                creating_client: client,
                spilled_url: None,
                content_hash: 0,
            },
        );
        metrics::record_object_created();
        metrics::set_store_bytes_in_use(inner.arena.bytes_allocated() as u64);
        Ok(PlasmaObject {
            object_id,
            offset: allocation.offset,
            data_size,
            metadata_size,
        })
    }

    /// Fills the unsealed buffer. Only the creating client may write.
    pub fn write(
        &self,
        client: ClientId,
        object_id: ObjectId,
        data: &[u8],
        metadata: &[u8],
    ) -> Result<(), PlasmaError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get(&object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if entry.state != ObjectState::Unsealed || entry.creating_client != client {
            return Err(PlasmaError::UnexpectedError(format!(
                "write to {object_id} denied: not the creating client or already sealed"
            )));
        }
        if data.len() != entry.data_size || metadata.len() != entry.metadata_size {
            return Err(PlasmaError::UnexpectedError(format!(
                "write to {object_id} denied: size mismatch"
            )));
        }
        let allocation = entry.allocation.expect("unsealed entry has a buffer");
        let data_size = entry.data_size;
        inner.arena.write(allocation, 0, data);
        inner.arena.write(allocation, data_size, metadata);
        Ok(())
    }

    /// Transitions Unsealed → Sealed, hashes the content and publishes the
    /// object-added notification. Sealing an unknown or already sealed id is
    /// a contract violation and aborts.
    pub fn seal(&self, client: ClientId, object_id: ObjectId) -> ObjectInfo {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let entry = inner
            .entries
            .get_mut(&object_id)
            .unwrap_or_else(|| panic!("seal of unknown object {object_id}"));
        assert!(
            entry.state == ObjectState::Unsealed && entry.creating_client == client,
            "seal of {object_id} violates the create/seal contract"
        );
        entry.state = ObjectState::Sealed;

        let allocation = entry.allocation.expect("unsealed entry has a buffer");
        let data_size = entry.data_size;
        let metadata_size = entry.metadata_size;
        let payload = inner.arena.read(allocation, data_size + metadata_size);
        let hash = content_hash(&payload[..data_size], &payload[data_size..]);

        let entry = inner.entries.get_mut(&object_id).unwrap();
        entry.content_hash = hash;
        // The creator's implicit reference is dropped at seal; consumers pin
        // through Get.
        entry.ref_count -= 1;
        let info = entry.info(object_id);
        if entry.ref_count == 0 {
            inner.lru.insert(object_id);
        }

        debug!(%object_id, hash, "object sealed");
        let _ = self.notifications.send(StoreNotification::ObjectAdded(info.clone()));
        info
    }

    /// Non-blocking lookup. Sealed hits are pinned for the caller and must
    /// be released; unsealed and spilled entries come back as `None`.
    pub fn get(&self, client: ClientId, object_ids: &[ObjectId]) -> Vec<Option<ObjectValue>> {
        let _ = client;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut results = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let result = match inner.entries.get_mut(object_id) {
                Some(entry) if entry.state == ObjectState::Sealed => {
                    entry.ref_count += 1;
                    let allocation = entry.allocation.expect("sealed entry has a buffer");
                    let data_size = entry.data_size;
                    let total = entry.total_size();
                    inner.lru.remove(object_id);
                    let mut data = inner.arena.read(allocation, total).to_vec();
                    let metadata = data.split_off(data_size);
                    Some(ObjectValue::new(data, metadata))
                }
                _ => None,
            };
            results.push(result);
        }
        results
    }

    /// Blocking form of `get`: waits up to `timeout` for missing objects to
    /// be sealed. Intended for worker threads, never the node-manager loop.
    pub async fn get_wait(
        &self,
        client: ClientId,
        object_ids: &[ObjectId],
        timeout: std::time::Duration,
    ) -> Vec<Option<ObjectValue>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut subscription = self.subscribe();
        let mut results = self.get(client, object_ids);
        while results.iter().any(|r| r.is_none()) {
            let next = tokio::time::timeout_at(deadline, subscription.recv()).await;
            match next {
                Ok(Ok(StoreNotification::ObjectAdded(info))) => {
                    for (i, object_id) in object_ids.iter().enumerate() {
                        if results[i].is_none() && *object_id == info.object_id {
                            results[i] =
                                self.get(client, &[*object_id]).into_iter().next().flatten();
                        }
                    }
                }
                Ok(Ok(StoreNotification::ObjectRemoved(_))) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Missed notifications; re-check everything we lack.
                    for (i, object_id) in object_ids.iter().enumerate() {
                        if results[i].is_none() {
                            results[i] = self.get(client, &[*object_id]).into_iter().next().flatten();
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }
        results
    }

    /// Deferred reference drop. The release becomes effective once it ages
    /// out of the release window or usage crosses the watermark.
    pub fn release(&self, client: ClientId, object_id: ObjectId) {
        let mut inner = self.inner.lock().unwrap();
        inner.release_history.push_front((client, object_id));
        self.flush_releases_locked(&mut inner, false);
    }

    /// Applies every deferred release immediately.
    pub fn flush_releases(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.flush_releases_locked(&mut inner, true);
    }

    /// Deletion hint: drops objects that are sealed and unreferenced,
    /// after applying any deferred release that still pins them.
    pub fn delete(&self, object_ids: &[ObjectId]) {
        let mut inner = self.inner.lock().unwrap();
        for object_id in object_ids {
            let pending: Vec<(ClientId, ObjectId)> = inner
                .release_history
                .iter()
                .filter(|(_, id)| id == object_id)
                .copied()
                .collect();
            if !pending.is_empty() {
                inner.release_history.retain(|(_, id)| id != object_id);
                for (_, id) in pending {
                    self.apply_release_locked(&mut inner, id);
                }
            }
            let Some(entry) = inner.entries.get(object_id) else {
                continue;
            };
            if entry.state == ObjectState::Unsealed || entry.ref_count > 0 {
                debug!(%object_id, "delete hint ignored for busy object");
                continue;
            }
            self.drop_entry_locked(&mut inner, *object_id);
        }
    }

    /// Frees at least `num_bytes` of sealed, unreferenced objects in
    /// least-recently-released order. Returns the bytes actually freed.
    pub fn evict(&self, num_bytes: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        self.evict_locked(&mut inner, num_bytes)
    }

    /// Marks a sealed object as spilled to `url` and frees its buffer. The
    /// entry survives so that the spilled location can be served to pullers.
    pub fn mark_spilled(&self, object_id: ObjectId, url: String) -> Result<(), PlasmaError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&object_id)
            .ok_or(PlasmaError::ObjectNonexistent)?;
        if entry.state != ObjectState::Sealed || entry.ref_count > 0 {
            return Err(PlasmaError::UnexpectedError(format!(
                "cannot spill busy object {object_id}"
            )));
        }
        entry.state = ObjectState::Spilled;
        entry.spilled_url = Some(url);
        let allocation = entry.allocation.take();
        inner.lru.remove(&object_id);
        if let Some(allocation) = allocation {
            inner.arena.free(allocation);
        }
        metrics::set_store_bytes_in_use(inner.arena.bytes_allocated() as u64);
        let _ = self
            .notifications
            .send(StoreNotification::ObjectRemoved(object_id));
        Ok(())
    }

    pub fn spilled_url(&self, object_id: &ObjectId) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(object_id)
            .and_then(|entry| entry.spilled_url.clone())
    }

    /// True when a sealed copy is present locally.
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(object_id)
            .map(|entry| entry.state == ObjectState::Sealed)
            .unwrap_or(false)
    }

    pub fn object_info(&self, object_id: &ObjectId) -> Option<ObjectInfo> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(object_id).and_then(|entry| {
            (entry.state == ObjectState::Sealed).then(|| entry.info(*object_id))
        })
    }

    pub fn ref_count(&self, object_id: &ObjectId) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(object_id).map(|entry| entry.ref_count)
    }

    /// Ids of every sealed object, for directory bootstrap and spill victim
    /// selection.
    pub fn sealed_objects(&self) -> Vec<ObjectInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == ObjectState::Sealed)
            .map(|(object_id, entry)| entry.info(*object_id))
            .collect()
    }

    /// Sealed, unreferenced objects in least-recently-released order; the
    /// candidates a spill pass may take.
    pub fn spill_candidates(&self) -> Vec<ObjectInfo> {
        let inner = self.inner.lock().unwrap();
        let mut candidates = Vec::new();
        for object_id in inner
            .lru
            .choose_victims(usize::MAX, |id| {
                inner
                    .entries
                    .get(id)
                    .map(|entry| entry.total_size())
                    .unwrap_or(0)
            })
        {
            if let Some(entry) = inner.entries.get(&object_id) {
                candidates.push(entry.info(object_id));
            }
        }
        candidates
    }

    /// Abandons unsealed creations and drops pins held by a disconnected
    /// client. Deferred releases from the client are applied immediately.
    pub fn disconnect_client(&self, client: ClientId, held: &[ObjectId]) {
        let mut inner = self.inner.lock().unwrap();
        let pending: Vec<(ClientId, ObjectId)> = inner
            .release_history
            .iter()
            .filter(|(c, _)| *c == client)
            .copied()
            .collect();
        inner.release_history.retain(|(c, _)| *c != client);
        for (_, object_id) in pending {
            self.apply_release_locked(&mut inner, object_id);
        }
        for object_id in held {
            self.apply_release_locked(&mut inner, *object_id);
        }
        let abandoned: Vec<ObjectId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state == ObjectState::Unsealed && entry.creating_client == client
            })
            .map(|(object_id, _)| *object_id)
            .collect();
        for object_id in abandoned {
            warn!(%object_id, client, "dropping unsealed object of disconnected client");
            self.drop_entry_locked(&mut inner, object_id);
        }
    }

    fn flush_releases_locked(&self, inner: &mut StoreInner, force: bool) {
        let watermark =
            (self.config.capacity_bytes as f64 * self.config.release_watermark) as usize;
        loop {
            let over_window = inner.release_history.len() > self.config.release_delay;
            let over_watermark = inner.arena.bytes_allocated() > watermark;
            if inner.release_history.is_empty() || !(force || over_window || over_watermark) {
                break;
            }
            let (_, object_id) = inner.release_history.pop_back().unwrap();
            self.apply_release_locked(inner, object_id);
        }
    }

    fn apply_release_locked(&self, inner: &mut StoreInner, object_id: ObjectId) {
        if let Some(entry) = inner.entries.get_mut(&object_id) {
            if entry.ref_count == 0 {
                warn!(%object_id, "release of an unreferenced object ignored");
                return;
            }
            entry.ref_count -= 1;
            if entry.ref_count == 0 && entry.state == ObjectState::Sealed {
                inner.lru.insert(object_id);
            }
        }
    }

    fn evict_locked(&self, inner: &mut StoreInner, num_bytes: usize) -> usize {
        let victims = inner.lru.choose_victims(num_bytes, |object_id| {
            inner
                .entries
                .get(object_id)
                .map(|entry| entry.total_size())
                .unwrap_or(0)
        });
        let mut freed = 0usize;
        for object_id in victims {
            freed += self.drop_entry_locked(inner, object_id);
            metrics::record_object_evicted();
        }
        if freed > 0 {
            debug!(freed, "evicted objects from the store");
        }
        freed
    }

    fn drop_entry_locked(&self, inner: &mut StoreInner, object_id: ObjectId) -> usize {
        inner.lru.remove(&object_id);
        let Some(entry) = inner.entries.remove(&object_id) else {
            return 0;
        };
        let mut freed = 0;
        if let Some(allocation) = entry.allocation {
            freed = inner.arena.free(allocation);
        }
        metrics::set_store_bytes_in_use(inner.arena.bytes_allocated() as u64);
        let _ = self
            .notifications
            .send(StoreNotification::ObjectRemoved(object_id));
        freed
    }
}
