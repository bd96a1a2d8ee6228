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
use manta_common::config::{NodeManagerConfig, ObjectManagerConfig, ObjectStoreConfig};
use manta_common::error::{MantaError, Result};
use manta_common::model::{
    JobId, Language, NodeAddress, NodeId, ObjectId, ObjectValue, ResourceSet, Task, TaskArg,
    TaskId, WorkerId, CPU_RESOURCE,
};
use manta_node::gcs::Gcs;
use manta_node::services::object_directory::{GcsObjectDirectory, LiveNodeView};
use manta_node::services::object_manager::PeerClientPool;
use manta_node::services::worker_pool::{WorkerHandle, WorkerProcessFactory};
use manta_node::NodeManager;
use manta_object_store::store::{PlasmaError, PlasmaStore, LOCAL_CLIENT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Routes peer RPCs between in-process node managers.
pub struct LocalPeerPool {
    nodes: Mutex<HashMap<NodeId, Arc<NodeManager>>>,
}

impl LocalPeerPool {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalPeerPool {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_node(&self, node: Arc<NodeManager>) {
        self.nodes.lock().unwrap().insert(node.node_id(), node);
    }

    fn node(&self, node_id: &NodeId) -> Result<Arc<NodeManager>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| MantaError::io_error(format!("unknown peer {node_id}")))
    }
}

#[async_trait]
impl PeerClientPool for LocalPeerPool {
    async fn send_pull_request(
        &self,
        to: NodeId,
        object_id: ObjectId,
        requester: NodeId,
    ) -> Result<()> {
        self.node(&to)?.handle_pull_request(object_id, requester).await
    }

    async fn send_push(
        &self,
        to: NodeId,
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    ) -> Result<()> {
        self.node(&to)?
            .handle_push(object_id, chunk_index, num_chunks, metadata_size, data);
        Ok(())
    }

    async fn send_free_objects(&self, to: NodeId, object_ids: Vec<ObjectId>) -> Result<()> {
        self.node(&to)?.handle_free_objects(object_ids);
        Ok(())
    }

    async fn forward_task(&self, to: NodeId, task: Task) -> Result<()> {
        self.node(&to)?.handle_forwarded_task(task).await
    }
}

/// Function table of the in-process test workers: descriptor name to a
/// closure over the raw argument payloads.
pub type TestFunction = Arc<dyn Fn(Vec<Vec<u8>>) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
pub struct FunctionRegistry {
    functions: Mutex<HashMap<String, TestFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(FunctionRegistry::default())
    }

    pub fn register(&self, name: &str, function: TestFunction) {
        self.functions
            .lock()
            .unwrap()
            .insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<TestFunction> {
        self.functions.lock().unwrap().get(name).cloned()
    }
}

/// Worker factory that runs worker loops as plain tasks against the owning
/// node manager, standing in for forked worker processes.
pub struct ThreadWorkerFactory {
    node: Mutex<Option<Arc<NodeManager>>>,
    registry: Arc<FunctionRegistry>,
}

struct NoopHandle;

#[async_trait]
impl WorkerHandle for NoopHandle {
    async fn shutdown(&self) {}
    async fn kill(&self) {}
}

impl ThreadWorkerFactory {
    pub fn new(registry: Arc<FunctionRegistry>) -> Arc<Self> {
        Arc::new(ThreadWorkerFactory {
            node: Mutex::new(None),
            registry,
        })
    }

    pub fn bind(&self, node: Arc<NodeManager>) {
        *self.node.lock().unwrap() = Some(node);
    }
}

#[async_trait]
impl WorkerProcessFactory for ThreadWorkerFactory {
    async fn start_worker(&self, language: Language) -> Result<Arc<dyn WorkerHandle>> {
        let node = self
            .node
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MantaError::invalid("factory not bound to a node"))?;
        let registry = self.registry.clone();
        let worker_id = WorkerId::new_random();
        node.register_worker(worker_id, language, false, JobId::nil())
            .await?;
        tokio::spawn(run_worker(node, worker_id, registry));
        Ok(Arc::new(NoopHandle))
    }
}

/// The execution loop of one test worker: poll for a task, resolve its
/// arguments from the local store, run the registered function, store the
/// results, report done.
pub async fn run_worker(
    node: Arc<NodeManager>,
    worker_id: WorkerId,
    registry: Arc<FunctionRegistry>,
) {
    loop {
        let task = match node.get_task(worker_id).await {
            Ok(task) => task,
            Err(_) => break,
        };
        execute_task(&node, worker_id, task, &registry).await;
    }
}

async fn execute_task(
    node: &Arc<NodeManager>,
    worker_id: WorkerId,
    task: Task,
    registry: &Arc<FunctionRegistry>,
) {
    let task_id = task.spec.task_id;
    let references = task.spec.dependencies();
    if !references.is_empty() {
        let _ = node
            .fetch_or_reconstruct(references.clone(), false, task_id)
            .await;
    }

    let mut args = Vec::new();
    for arg in &task.spec.arguments {
        match arg {
            TaskArg::Value(value) => args.push(value.clone()),
            TaskArg::Reference(object_id) => {
                let value = node
                    .store()
                    .get_wait(LOCAL_CLIENT, &[*object_id], Duration::from_secs(10))
                    .await
                    .pop()
                    .flatten()
                    .unwrap_or_else(|| panic!("argument {object_id} did not arrive"));
                args.push(value.data.to_vec());
                node.store().release(LOCAL_CLIENT, *object_id);
            }
        }
    }
    if !references.is_empty() {
        let _ = node.notify_unblocked(task_id).await;
    }

    let function = registry
        .get(&task.spec.function_descriptor.to_string())
        .unwrap_or_else(|| panic!("unknown function {}", task.spec.function_descriptor));
    let output = function(args);

    // The dummy return of actor methods is sealed by the node manager.
    let user_returns = if task.spec.is_actor_task() {
        task.spec.num_returns - 1
    } else {
        task.spec.num_returns
    };
    for index in 0..user_returns {
        store_result(
            node.store(),
            ObjectId::for_task_return(&task_id, index),
            ObjectValue::from_data(output.clone()),
        );
    }

    let _ = node.task_done(worker_id, task_id).await;
}

pub fn store_result(store: &Arc<PlasmaStore>, object_id: ObjectId, value: ObjectValue) {
    match store.create(
        LOCAL_CLIENT,
        object_id,
        value.data.len(),
        value.metadata.len(),
        true,
    ) {
        Ok(_) => {
            store
                .write(LOCAL_CLIENT, object_id, &value.data, &value.metadata)
                .expect("write after create");
            store.seal(LOCAL_CLIENT, object_id);
        }
        // A re-executed task found its result already present.
        Err(PlasmaError::ObjectExists) => {}
        Err(error) => panic!("failed to store result {object_id}: {error}"),
    }
}

pub struct TestCluster {
    pub gcs: Gcs,
    pub peers: Arc<LocalPeerPool>,
    pub live_nodes: LiveNodeView,
    pub registry: Arc<FunctionRegistry>,
    pub nodes: Vec<Arc<NodeManager>>,
}

impl TestCluster {
    /// Starts `num_nodes` in-process node managers with `cpus_per_node`,
    /// sharing one in-memory GCS and one function registry.
    pub async fn start(num_nodes: usize, cpus_per_node: i64) -> TestCluster {
        Self::start_with_reconstruction_timeout(num_nodes, cpus_per_node, Duration::from_millis(25))
            .await
    }

    pub async fn start_with_reconstruction_timeout(
        num_nodes: usize,
        cpus_per_node: i64,
        reconstruction_timeout: Duration,
    ) -> TestCluster {
        manta_common::tracing::init_tracing_for_tests();
        let gcs = Gcs::in_memory();
        let peers = LocalPeerPool::new();
        let live_nodes = LiveNodeView::new();
        let registry = FunctionRegistry::new();

        let mut nodes = Vec::new();
        for i in 0..num_nodes {
            let node_id = NodeId::new_random();
            let factory = ThreadWorkerFactory::new(registry.clone());
            let store = Arc::new(
                PlasmaStore::new(ObjectStoreConfig {
                    capacity_bytes: 16 * 1024 * 1024,
                    release_delay: 0,
                    ..ObjectStoreConfig::default()
                })
                .unwrap(),
            );
            let directory = GcsObjectDirectory::new(gcs.objects.clone(), live_nodes.clone());
            let node = NodeManager::new(
                node_id,
                NodeAddress {
                    host: "127.0.0.1".to_string(),
                    port: 20000 + i as u16,
                },
                NodeManagerConfig {
                    heartbeat_timeout: Duration::from_millis(10),
                    fetch_timeout: Duration::from_millis(20),
                    reconstruction_timeout,
                    spillback_backoff_min: Duration::from_millis(10),
                    ..NodeManagerConfig::default()
                },
                ObjectManagerConfig {
                    pull_timeout: Duration::from_millis(20),
                    ..ObjectManagerConfig::default()
                },
                ResourceSet::from_units(&[(CPU_RESOURCE, cpus_per_node)]),
                gcs.clone(),
                store,
                directory,
                live_nodes.clone(),
                peers.clone(),
                factory.clone(),
            );
            factory.bind(node.clone());
            node.start();
            peers.add_node(node.clone());
            nodes.push(node);
        }

        // Every node must see every other node's first heartbeat before
        // scheduling makes cross-node decisions.
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestCluster {
            gcs,
            peers,
            live_nodes,
            registry,
            nodes,
        }
    }

    pub fn driver_task(&self) -> TaskId {
        TaskId::for_driver(JobId::from_bytes([7, 7, 7, 7]), &WorkerId::from_bytes([9u8; 16]))
    }
}
