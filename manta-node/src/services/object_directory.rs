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

use crate::gcs::{ObjectTable, ObjectTableData};
use async_trait::async_trait;
use manta_common::error::Result;
use manta_common::model::{NodeId, ObjectId, ObjectInfo, ObjectLocationUpdate, WorkerAddress};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

pub type LocationSubscriptionCallback = Arc<dyn Fn(ObjectLocationUpdate) + Send + Sync>;

/// The cluster's current view of live nodes. Location feeds are intersected
/// with it so that dead nodes never surface to directory consumers.
#[derive(Clone, Default)]
pub struct LiveNodeView {
    nodes: Arc<RwLock<HashSet<NodeId>>>,
}

impl LiveNodeView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, node_id: NodeId) {
        self.nodes.write().unwrap().insert(node_id);
    }

    pub fn mark_dead(&self, node_id: &NodeId) {
        self.nodes.write().unwrap().remove(node_id);
    }

    pub fn is_alive(&self, node_id: &NodeId) -> bool {
        self.nodes.read().unwrap().contains(node_id)
    }

    pub fn filter(&self, node_ids: Vec<NodeId>) -> Vec<NodeId> {
        let nodes = self.nodes.read().unwrap();
        node_ids
            .into_iter()
            .filter(|node_id| nodes.contains(node_id))
            .collect()
    }
}

/// Where object replicas live. One interface, two sources of truth: the GCS
/// object table, or the object's owner worker.
#[async_trait]
pub trait ObjectDirectory: Send + Sync {
    async fn report_object_added(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
        info: &ObjectInfo,
    ) -> Result<()>;

    async fn report_object_removed(&self, object_id: ObjectId, node_id: NodeId) -> Result<()>;

    /// Registers `callback` for every change of the object's node set until
    /// unsubscribed. Idempotent per `(callback_id, object_id)`.
    async fn subscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
        owner: Option<WorkerAddress>,
        callback: LocationSubscriptionCallback,
    ) -> Result<()>;

    async fn unsubscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
    ) -> Result<()>;

    /// Single-shot location query.
    async fn lookup_locations(
        &self,
        object_id: ObjectId,
        owner: Option<WorkerAddress>,
    ) -> Result<ObjectLocationUpdate>;
}

type SubscriptionMap = HashMap<ObjectId, HashMap<String, LocationSubscriptionCallback>>;

/// Directory backed by the GCS object table: adds and removes are log
/// appends, subscriptions ride the table's broadcast.
pub struct GcsObjectDirectory {
    objects: Arc<dyn ObjectTable>,
    live_nodes: LiveNodeView,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
}

impl GcsObjectDirectory {
    pub fn new(objects: Arc<dyn ObjectTable>, live_nodes: LiveNodeView) -> Arc<Self> {
        let directory = Arc::new(GcsObjectDirectory {
            objects: objects.clone(),
            live_nodes,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        });

        let listener = directory.clone();
        let mut events = objects.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(data) => listener.deliver(data),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "object directory lagging behind the object table");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        directory
    }

    fn deliver(&self, data: ObjectTableData) {
        let callbacks: Vec<LocationSubscriptionCallback> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            match subscriptions.get(&data.object_id) {
                Some(by_id) => by_id.values().cloned().collect(),
                None => return,
            }
        };
        let update = self.filtered(data);
        for callback in callbacks {
            callback(update.clone());
        }
    }

    fn filtered(&self, data: ObjectTableData) -> ObjectLocationUpdate {
        ObjectLocationUpdate {
            object_id: data.object_id,
            node_ids: self.live_nodes.filter(data.locations),
            spilled_url: data.spilled_url,
            size: data.size,
        }
    }
}

#[async_trait]
impl ObjectDirectory for GcsObjectDirectory {
    async fn report_object_added(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
        info: &ObjectInfo,
    ) -> Result<()> {
        self.objects
            .add_location(&object_id, node_id, Some(info.total_size()))
            .await
    }

    async fn report_object_removed(&self, object_id: ObjectId, node_id: NodeId) -> Result<()> {
        self.objects.remove_location(&object_id, node_id).await
    }

    async fn subscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
        _owner: Option<WorkerAddress>,
        callback: LocationSubscriptionCallback,
    ) -> Result<()> {
        let inserted = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .entry(object_id)
                .or_default()
                .insert(callback_id.to_string(), callback.clone())
                .is_none()
        };
        if inserted {
            debug!(%object_id, callback_id, "subscribed to object locations");
            // Seed the subscriber with the current set.
            let current = self.objects.get(&object_id).await?;
            callback(self.filtered(current));
        }
        Ok(())
    }

    async fn unsubscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(by_id) = subscriptions.get_mut(&object_id) {
            by_id.remove(callback_id);
            if by_id.is_empty() {
                subscriptions.remove(&object_id);
            }
        }
        Ok(())
    }

    async fn lookup_locations(
        &self,
        object_id: ObjectId,
        _owner: Option<WorkerAddress>,
    ) -> Result<ObjectLocationUpdate> {
        let data = self.objects.get(&object_id).await?;
        Ok(self.filtered(data))
    }
}

/// Transport to an object's owner worker, for the ownership-based variant.
/// `poll_locations` blocks server-side until the owner's version advances
/// past `last_version`, which turns plain request/reply into a push loop.
#[async_trait]
pub trait OwnerClient: Send + Sync {
    async fn add_location(
        &self,
        owner: &WorkerAddress,
        object_id: ObjectId,
        node_id: NodeId,
        size: Option<u64>,
    ) -> Result<()>;

    async fn remove_location(
        &self,
        owner: &WorkerAddress,
        object_id: ObjectId,
        node_id: NodeId,
    ) -> Result<()>;

    async fn poll_locations(
        &self,
        owner: &WorkerAddress,
        object_id: ObjectId,
        last_version: u64,
    ) -> Result<(u64, ObjectLocationUpdate)>;

    /// Connection bookkeeping hooks; the default transport pools one
    /// connection per owner.
    fn retain_connection(&self, _owner: &WorkerAddress) {}
    fn release_connection(&self, _owner: &WorkerAddress) {}
}

type OwnershipSubscriptions = HashMap<ObjectId, HashMap<String, LocationSubscriptionCallback>>;

/// Directory variant that keeps object locations on the owning worker. Every
/// add/remove is an RPC to the owner; subscriptions are server-push loops
/// over long polls.
pub struct OwnershipBasedObjectDirectory {
    client: Arc<dyn OwnerClient>,
    live_nodes: LiveNodeView,
    subscriptions: Arc<Mutex<OwnershipSubscriptions>>,
    /// Owner worker of each object this node has seen, registered when the
    /// object reference first arrives here.
    owners: Mutex<HashMap<ObjectId, WorkerAddress>>,
    /// Outstanding request count per owner; the connection drops at zero.
    connection_refs: Arc<Mutex<HashMap<WorkerAddress, usize>>>,
}

impl OwnershipBasedObjectDirectory {
    pub fn new(client: Arc<dyn OwnerClient>, live_nodes: LiveNodeView) -> Arc<Self> {
        Arc::new(OwnershipBasedObjectDirectory {
            client,
            live_nodes,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            owners: Mutex::new(HashMap::new()),
            connection_refs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Remembers who owns an object, so that later adds and removes can be
    /// routed without the caller repeating the address.
    pub fn register_owner(&self, object_id: ObjectId, owner: WorkerAddress) {
        self.owners.lock().unwrap().insert(object_id, owner);
    }

    fn owner_of(&self, object_id: &ObjectId) -> Result<WorkerAddress> {
        self.owners
            .lock()
            .unwrap()
            .get(object_id)
            .cloned()
            .ok_or_else(|| {
                manta_common::error::MantaError::key_error(format!(
                    "no owner registered for object {object_id}"
                ))
            })
    }

    fn retain(&self, owner: &WorkerAddress) {
        let mut refs = self.connection_refs.lock().unwrap();
        let count = refs.entry(owner.clone()).or_insert(0);
        if *count == 0 {
            self.client.retain_connection(owner);
        }
        *count += 1;
    }

    fn release(&self, owner: &WorkerAddress) {
        let mut refs = self.connection_refs.lock().unwrap();
        if let Some(count) = refs.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                refs.remove(owner);
                self.client.release_connection(owner);
            }
        }
    }

    /// The long-poll loop of one subscribed object. Each reply is delivered
    /// and immediately triggers the next poll; the loop ends when the last
    /// callback unsubscribes or the owner becomes unreachable.
    fn spawn_poll_loop(
        client: Arc<dyn OwnerClient>,
        live_nodes: LiveNodeView,
        subscriptions: Arc<Mutex<OwnershipSubscriptions>>,
        connection_refs: Arc<Mutex<HashMap<WorkerAddress, usize>>>,
        object_id: ObjectId,
        owner: WorkerAddress,
    ) {
        tokio::spawn(async move {
            let mut version = 0;
            loop {
                let callbacks: Vec<LocationSubscriptionCallback> = {
                    let subscriptions = subscriptions.lock().unwrap();
                    match subscriptions.get(&object_id) {
                        Some(callbacks) => callbacks.values().cloned().collect(),
                        None => break,
                    }
                };
                match client.poll_locations(&owner, object_id, version).await {
                    Ok((new_version, mut update)) => {
                        version = new_version;
                        update.node_ids = live_nodes.filter(update.node_ids);
                        for callback in callbacks {
                            callback(update.clone());
                        }
                    }
                    Err(error) => {
                        debug!(%object_id, %error, "owner poll failed, stopping subscription");
                        subscriptions.lock().unwrap().remove(&object_id);
                        break;
                    }
                }
            }
            let mut refs = connection_refs.lock().unwrap();
            if let Some(count) = refs.get_mut(&owner) {
                *count -= 1;
                if *count == 0 {
                    refs.remove(&owner);
                    client.release_connection(&owner);
                }
            }
        });
    }
}

#[async_trait]
impl ObjectDirectory for OwnershipBasedObjectDirectory {
    async fn report_object_added(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
        info: &ObjectInfo,
    ) -> Result<()> {
        let owner = self.owner_of(&object_id)?;
        self.client
            .add_location(&owner, object_id, node_id, Some(info.total_size()))
            .await
    }

    async fn report_object_removed(&self, object_id: ObjectId, node_id: NodeId) -> Result<()> {
        let owner = self.owner_of(&object_id)?;
        self.client.remove_location(&owner, object_id, node_id).await
    }

    async fn subscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
        owner: Option<WorkerAddress>,
        callback: LocationSubscriptionCallback,
    ) -> Result<()> {
        let owner = match owner {
            Some(owner) => {
                self.register_owner(object_id, owner.clone());
                owner
            }
            None => self.owner_of(&object_id)?,
        };

        let start_poll_loop = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let callbacks = subscriptions.entry(object_id).or_default();
            let first = callbacks.is_empty();
            callbacks.insert(callback_id.to_string(), callback);
            first
        };

        if start_poll_loop {
            debug!(%object_id, callback_id, "starting owner poll loop");
            self.retain(&owner);
            Self::spawn_poll_loop(
                self.client.clone(),
                self.live_nodes.clone(),
                self.subscriptions.clone(),
                self.connection_refs.clone(),
                object_id,
                owner,
            );
        }
        Ok(())
    }

    async fn unsubscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(callbacks) = subscriptions.get_mut(&object_id) {
            callbacks.remove(callback_id);
            if callbacks.is_empty() {
                subscriptions.remove(&object_id);
            }
        }
        Ok(())
    }

    async fn lookup_locations(
        &self,
        object_id: ObjectId,
        owner: Option<WorkerAddress>,
    ) -> Result<ObjectLocationUpdate> {
        let owner = match owner {
            Some(owner) => owner,
            None => self.owner_of(&object_id)?,
        };
        self.retain(&owner);
        let result = self.client.poll_locations(&owner, object_id, 0).await;
        self.release(&owner);
        let (_, mut update) = result?;
        update.node_ids = self.live_nodes.filter(update.node_ids);
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::gcs::in_memory::InMemoryGcs;
    use async_trait::async_trait;
    use manta_common::error::MantaError;
    use manta_common::model::{JobId, TaskId, WorkerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    fn object(i: u32) -> ObjectId {
        let task = TaskId::for_driver(
            JobId::from_bytes([4, 4, 4, 4]),
            &WorkerId::from_bytes([4u8; 16]),
        );
        ObjectId::for_task_return(&task, i)
    }

    fn node(i: u8) -> NodeId {
        NodeId::from_bytes([i; 16])
    }

    fn info(object_id: ObjectId, size: u64) -> ObjectInfo {
        ObjectInfo {
            object_id,
            data_size: size,
            metadata_size: 0,
            content_hash: 0,
        }
    }

    fn owner() -> WorkerAddress {
        WorkerAddress {
            worker_id: WorkerId::from_bytes([9u8; 16]),
            node_id: node(9),
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }

    #[test]
    async fn gcs_directory_delivers_filtered_location_diffs() {
        let gcs: Arc<InMemoryGcs> = Arc::new(InMemoryGcs::new());
        let live_nodes = LiveNodeView::new();
        live_nodes.set_alive(node(1));
        // Node 2 is dead from the start and must never surface.
        let directory = GcsObjectDirectory::new(gcs.clone(), live_nodes.clone());

        let seen: Arc<Mutex<Vec<Vec<NodeId>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        directory
            .subscribe_object_locations(
                "test",
                object(0),
                None,
                Arc::new(move |update| {
                    seen_in_callback.lock().unwrap().push(update.node_ids);
                }),
            )
            .await
            .unwrap();

        directory
            .report_object_added(object(0), node(1), &info(object(0), 8))
            .await
            .unwrap();
        directory
            .report_object_added(object(0), node(2), &info(object(0), 8))
            .await
            .unwrap();
        directory
            .report_object_removed(object(0), node(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        // Seeded empty set, then the three diffs; dead node 2 never appears.
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], Vec::<NodeId>::new());
        assert_eq!(seen[1], vec![node(1)]);
        assert_eq!(seen[2], vec![node(1)]);
        assert_eq!(seen[3], Vec::<NodeId>::new());
    }

    #[test]
    async fn gcs_directory_unsubscribe_stops_delivery() {
        let gcs: Arc<InMemoryGcs> = Arc::new(InMemoryGcs::new());
        let live_nodes = LiveNodeView::new();
        live_nodes.set_alive(node(1));
        let directory = GcsObjectDirectory::new(gcs.clone(), live_nodes);

        let deliveries = Arc::new(AtomicUsize::new(0));
        let deliveries_in_callback = deliveries.clone();
        directory
            .subscribe_object_locations(
                "test",
                object(1),
                None,
                Arc::new(move |_| {
                    deliveries_in_callback.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        directory
            .unsubscribe_object_locations("test", object(1))
            .await
            .unwrap();
        directory
            .report_object_added(object(1), node(1), &info(object(1), 8))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the subscription seed was delivered.
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    }

    /// Owner transport over a watch channel, versioned like a real owner
    /// worker would serve it.
    struct ChannelOwnerClient {
        version: watch::Sender<u64>,
        locations: Mutex<Vec<NodeId>>,
        connections: AtomicUsize,
    }

    impl ChannelOwnerClient {
        fn new() -> Arc<Self> {
            Arc::new(ChannelOwnerClient {
                version: watch::channel(1).0,
                locations: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OwnerClient for ChannelOwnerClient {
        async fn add_location(
            &self,
            _owner: &WorkerAddress,
            _object_id: ObjectId,
            node_id: NodeId,
            _size: Option<u64>,
        ) -> Result<()> {
            self.locations.lock().unwrap().push(node_id);
            self.version.send_modify(|version| *version += 1);
            Ok(())
        }

        async fn remove_location(
            &self,
            _owner: &WorkerAddress,
            _object_id: ObjectId,
            node_id: NodeId,
        ) -> Result<()> {
            self.locations.lock().unwrap().retain(|n| *n != node_id);
            self.version.send_modify(|version| *version += 1);
            Ok(())
        }

        async fn poll_locations(
            &self,
            _owner: &WorkerAddress,
            object_id: ObjectId,
            last_version: u64,
        ) -> Result<(u64, ObjectLocationUpdate)> {
            let mut receiver = self.version.subscribe();
            let version = *receiver
                .wait_for(|version| *version > last_version)
                .await
                .map_err(|_| MantaError::io_error("owner gone"))?;
            Ok((
                version,
                ObjectLocationUpdate {
                    object_id,
                    node_ids: self.locations.lock().unwrap().clone(),
                    spilled_url: None,
                    size: Some(8),
                },
            ))
        }

        fn retain_connection(&self, _owner: &WorkerAddress) {
            self.connections.fetch_add(1, Ordering::SeqCst);
        }

        fn release_connection(&self, _owner: &WorkerAddress) {
            self.connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    async fn ownership_directory_pushes_through_the_poll_loop() {
        let client = ChannelOwnerClient::new();
        let live_nodes = LiveNodeView::new();
        live_nodes.set_alive(node(1));
        let directory = OwnershipBasedObjectDirectory::new(client.clone(), live_nodes);

        let seen: Arc<Mutex<Vec<Vec<NodeId>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        directory
            .subscribe_object_locations(
                "test",
                object(2),
                Some(owner()),
                Arc::new(move |update| {
                    seen_in_callback.lock().unwrap().push(update.node_ids);
                }),
            )
            .await
            .unwrap();
        assert_eq!(client.connections.load(Ordering::SeqCst), 1);

        directory
            .report_object_added(object(2), node(1), &info(object(2), 8))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let delivered = seen.lock().unwrap().clone();
        assert!(delivered.iter().any(|set| set == &vec![node(1)]));

        // Unsubscribing ends the poll loop and releases the pooled
        // connection once the next reply arrives.
        directory
            .unsubscribe_object_locations("test", object(2))
            .await
            .unwrap();
        directory
            .report_object_removed(object(2), node(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.connections.load(Ordering::SeqCst), 0);
    }

    #[test]
    async fn ownership_lookup_requires_a_known_owner() {
        let client = ChannelOwnerClient::new();
        let directory = OwnershipBasedObjectDirectory::new(client, LiveNodeView::new());
        let result = directory.lookup_locations(object(3), None).await;
        assert!(result.is_err());
    }
}
