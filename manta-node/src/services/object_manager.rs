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

use async_trait::async_trait;
use bytes::Bytes;
use manta_common::config::ObjectManagerConfig;
use manta_common::error::Result;
use manta_common::model::{NodeId, ObjectId, ObjectValue, Task};
use manta_object_store::store::{PlasmaError, PlasmaStore, LOCAL_CLIENT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Outbound RPCs to peer node managers. One implementation speaks the wire
/// protocol; tests wire peers up in process.
#[async_trait]
pub trait PeerClientPool: Send + Sync {
    async fn send_pull_request(
        &self,
        to: NodeId,
        object_id: ObjectId,
        requester: NodeId,
    ) -> Result<()>;

    async fn send_push(
        &self,
        to: NodeId,
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    ) -> Result<()>;

    async fn send_free_objects(&self, to: NodeId, object_ids: Vec<ObjectId>) -> Result<()>;

    async fn forward_task(&self, to: NodeId, task: Task) -> Result<()>;
}

struct ChunkAssembly {
    num_chunks: u64,
    metadata_size: u64,
    received: HashMap<u64, Bytes>,
}

/// Answers peer pulls with chunked pushes, reassembles inbound pushes into
/// the local store, and fans out object frees.
pub struct ObjectManager {
    node_id: NodeId,
    store: Arc<PlasmaStore>,
    peers: Arc<dyn PeerClientPool>,
    config: ObjectManagerConfig,
    /// Last push per (object, node) so a chatty peer does not receive the
    /// same object twice within the configured window.
    recent_pushes: Mutex<HashMap<(ObjectId, NodeId), Instant>>,
    assemblies: Mutex<HashMap<ObjectId, ChunkAssembly>>,
}

impl ObjectManager {
    pub fn new(
        node_id: NodeId,
        store: Arc<PlasmaStore>,
        peers: Arc<dyn PeerClientPool>,
        config: ObjectManagerConfig,
    ) -> Self {
        ObjectManager {
            node_id,
            store,
            peers,
            config,
            recent_pushes: Mutex::new(HashMap::new()),
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    /// A peer wants this object. If a sealed copy is local, push it back in
    /// chunks; otherwise ignore, the peer will retry elsewhere.
    pub async fn handle_pull_request(&self, object_id: ObjectId, requester: NodeId) -> Result<()> {
        {
            let mut recent = self.recent_pushes.lock().unwrap();
            if let Some(last) = recent.get(&(object_id, requester)) {
                if last.elapsed() < self.config.repeated_push_delay {
                    debug!(%object_id, %requester, "suppressing repeated push");
                    return Ok(());
                }
            }
            recent.insert((object_id, requester), Instant::now());
        }

        let value = {
            let mut results = self.store.get(LOCAL_CLIENT, &[object_id]);
            results.pop().flatten()
        };
        let Some(value) = value else {
            debug!(%object_id, %requester, "pull request for an object this node no longer has");
            return Ok(());
        };

        let result = self.push_object(object_id, requester, &value).await;
        self.store.release(LOCAL_CLIENT, object_id);
        result
    }

    async fn push_object(
        &self,
        object_id: ObjectId,
        to: NodeId,
        value: &ObjectValue,
    ) -> Result<()> {
        let metadata_size = value.metadata.len() as u64;
        let mut combined = Vec::with_capacity(value.size());
        combined.extend_from_slice(&value.data);
        combined.extend_from_slice(&value.metadata);
        let combined = Bytes::from(combined);

        let chunk_size = self.config.default_chunk_size.max(1);
        let num_chunks = combined.len().div_ceil(chunk_size).max(1) as u64;
        debug!(%object_id, %to, num_chunks, "pushing object");
        for chunk_index in 0..num_chunks {
            let start = chunk_index as usize * chunk_size;
            let end = (start + chunk_size).min(combined.len());
            self.peers
                .send_push(
                    to,
                    object_id,
                    chunk_index,
                    num_chunks,
                    metadata_size,
                    combined.slice(start..end),
                )
                .await?;
        }
        Ok(())
    }

    /// One inbound push chunk. When the object is complete it is created and
    /// sealed locally; duplicates of an object already present are dropped.
    pub fn handle_push(
        &self,
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    ) {
        if self.store.contains(&object_id) {
            return;
        }

        let complete = {
            let mut assemblies = self.assemblies.lock().unwrap();
            let assembly = assemblies.entry(object_id).or_insert_with(|| ChunkAssembly {
                num_chunks,
                metadata_size,
                received: HashMap::new(),
            });
            if assembly.num_chunks != num_chunks {
                warn!(%object_id, "push chunk count changed mid-transfer, restarting");
                *assembly = ChunkAssembly {
                    num_chunks,
                    metadata_size,
                    received: HashMap::new(),
                };
            }
            assembly.received.insert(chunk_index, data);
            if assembly.received.len() as u64 == assembly.num_chunks {
                assemblies.remove(&object_id)
            } else {
                None
            }
        };

        if let Some(assembly) = complete {
            let mut combined = Vec::new();
            for index in 0..assembly.num_chunks {
                match assembly.received.get(&index) {
                    Some(chunk) => combined.extend_from_slice(chunk),
                    None => {
                        warn!(%object_id, index, "push assembly missing a chunk");
                        return;
                    }
                }
            }
            let metadata_size = assembly.metadata_size as usize;
            if metadata_size > combined.len() {
                warn!(%object_id, "push assembly metadata larger than payload");
                return;
            }
            let data_size = combined.len() - metadata_size;
            let metadata = combined.split_off(data_size);

            match self
                .store
                .create(LOCAL_CLIENT, object_id, data_size, metadata_size, true)
            {
                Ok(_) => {
                    if let Err(error) =
                        self.store
                            .write(LOCAL_CLIENT, object_id, &combined, &metadata)
                    {
                        warn!(%object_id, %error, "failed to write pushed object");
                        return;
                    }
                    self.store.seal(LOCAL_CLIENT, object_id);
                    debug!(%object_id, "pushed object sealed locally");
                }
                Err(PlasmaError::ObjectExists) => {}
                Err(error) => {
                    warn!(%object_id, %error, "failed to store pushed object");
                }
            }
        }
    }

    /// Deletes objects locally and, unless `local_only`, tells every given
    /// peer to do the same.
    pub async fn free_objects(
        &self,
        object_ids: Vec<ObjectId>,
        local_only: bool,
        peers: Vec<NodeId>,
    ) -> Result<()> {
        self.store.delete(&object_ids);
        if !local_only {
            for peer in peers {
                if peer != self.node_id {
                    self.peers
                        .send_free_objects(peer, object_ids.clone())
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::config::ObjectStoreConfig;
    use manta_common::error::MantaError;
    use manta_common::model::{JobId, TaskId, WorkerId};

    fn object(i: u32) -> ObjectId {
        let task =
            TaskId::for_driver(JobId::from_bytes([0, 2, 0, 0]), &WorkerId::from_bytes([6u8; 16]));
        ObjectId::for_task_return(&task, i)
    }

    struct RecordingPeers {
        pushes: Mutex<Vec<(NodeId, ObjectId, u64, u64, Bytes)>>,
        frees: Mutex<Vec<(NodeId, Vec<ObjectId>)>>,
    }

    impl RecordingPeers {
        fn new() -> Self {
            RecordingPeers {
                pushes: Mutex::new(Vec::new()),
                frees: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerClientPool for RecordingPeers {
        async fn send_pull_request(
            &self,
            _to: NodeId,
            _object_id: ObjectId,
            _requester: NodeId,
        ) -> Result<()> {
            Ok(())
        }

        async fn send_push(
            &self,
            to: NodeId,
            object_id: ObjectId,
            chunk_index: u64,
            num_chunks: u64,
            _metadata_size: u64,
            data: Bytes,
        ) -> Result<()> {
            self.pushes
                .lock()
                .unwrap()
                .push((to, object_id, chunk_index, num_chunks, data));
            Ok(())
        }

        async fn send_free_objects(&self, to: NodeId, object_ids: Vec<ObjectId>) -> Result<()> {
            self.frees.lock().unwrap().push((to, object_ids));
            Ok(())
        }

        async fn forward_task(&self, _to: NodeId, _task: Task) -> Result<()> {
            Err(MantaError::not_implemented("forwarding in tests"))
        }
    }

    fn manager(chunk_size: usize) -> (ObjectManager, Arc<RecordingPeers>, Arc<PlasmaStore>) {
        let store = Arc::new(
            PlasmaStore::new(ObjectStoreConfig {
                capacity_bytes: 1024 * 1024,
                release_delay: 0,
                ..ObjectStoreConfig::default()
            })
            .unwrap(),
        );
        let peers = Arc::new(RecordingPeers::new());
        let manager = ObjectManager::new(
            NodeId::from_bytes([1u8; 16]),
            store.clone(),
            peers.clone(),
            ObjectManagerConfig {
                default_chunk_size: chunk_size,
                ..ObjectManagerConfig::default()
            },
        );
        (manager, peers, store)
    }

    fn seal_local(store: &PlasmaStore, id: ObjectId, data: &[u8], metadata: &[u8]) {
        store
            .create(LOCAL_CLIENT, id, data.len(), metadata.len(), true)
            .unwrap();
        store.write(LOCAL_CLIENT, id, data, metadata).unwrap();
        store.seal(LOCAL_CLIENT, id);
    }

    #[test]
    async fn pull_requests_answer_with_chunked_pushes() {
        let (manager, peers, store) = manager(4);
        seal_local(&store, object(0), b"0123456789", b"mm");
        let requester = NodeId::from_bytes([2u8; 16]);

        manager.handle_pull_request(object(0), requester).await.unwrap();

        let pushes = peers.pushes.lock().unwrap();
        // 12 bytes at chunk size 4
        assert_eq!(pushes.len(), 3);
        assert!(pushes.iter().all(|(to, id, _, total, _)| {
            *to == requester && *id == object(0) && *total == 3
        }));
        // Pinning for the read was undone afterwards.
        assert_eq!(store.ref_count(&object(0)), Some(0));
    }

    #[test]
    async fn repeated_pulls_are_suppressed_within_the_window() {
        let (manager, peers, store) = manager(1024);
        seal_local(&store, object(0), b"abc", b"");
        let requester = NodeId::from_bytes([2u8; 16]);

        manager.handle_pull_request(object(0), requester).await.unwrap();
        manager.handle_pull_request(object(0), requester).await.unwrap();
        assert_eq!(peers.pushes.lock().unwrap().len(), 1);
    }

    #[test]
    async fn inbound_chunks_reassemble_and_seal() {
        let (manager, _, store) = manager(4);
        // data = "0123456789", metadata = "mm"
        let chunks = [
            Bytes::from_static(b"0123"),
            Bytes::from_static(b"4567"),
            Bytes::from_static(b"89mm"),
        ];
        // Deliver out of order on purpose.
        manager.handle_push(object(1), 2, 3, 2, chunks[2].clone());
        manager.handle_push(object(1), 0, 3, 2, chunks[0].clone());
        assert!(!store.contains(&object(1)));
        manager.handle_push(object(1), 1, 3, 2, chunks[1].clone());

        assert!(store.contains(&object(1)));
        let value = store.get(LOCAL_CLIENT, &[object(1)]).pop().flatten().unwrap();
        assert_eq!(&value.data[..], b"0123456789");
        assert_eq!(&value.metadata[..], b"mm");
    }

    #[test]
    async fn free_objects_broadcasts_to_peers() {
        let (manager, peers, store) = manager(1024);
        seal_local(&store, object(2), b"x", b"");
        let other = NodeId::from_bytes([3u8; 16]);

        manager
            .free_objects(vec![object(2)], false, vec![other])
            .await
            .unwrap();
        assert!(!store.contains(&object(2)));
        assert_eq!(peers.frees.lock().unwrap().as_slice(), &[(other, vec![object(2)])]);
    }
}
