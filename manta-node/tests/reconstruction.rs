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

mod common;

use common::TestCluster;
use manta_common::model::{
    FunctionDescriptor, JobId, Language, ObjectId, ResourceSet, Task, TaskArg, TaskSpecBuilder,
    CPU_RESOURCE,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

test_r::enable!();

fn submit_spec(
    cluster: &TestCluster,
    descriptor: &str,
    arguments: Vec<TaskArg>,
    index: u32,
) -> Task {
    let driver = cluster.driver_task();
    let spec = TaskSpecBuilder::new(
        JobId::from_bytes([7, 7, 7, 7]),
        driver,
        index,
        driver,
        Language::Rust,
        FunctionDescriptor::new([descriptor]),
        arguments,
        1,
        ResourceSet::from_units(&[(CPU_RESOURCE, 1)]),
        ResourceSet::new(),
    )
    .build();
    Task::new(spec, vec![])
}

#[test]
async fn evicted_dependency_is_reconstructed_exactly_once() {
    let cluster = TestCluster::start(1, 2).await;
    let producer_runs = Arc::new(AtomicU32::new(0));
    let producer_counter = producer_runs.clone();
    cluster.registry.register(
        "produce",
        Arc::new(move |_args: Vec<Vec<u8>>| {
            producer_counter.fetch_add(1, Ordering::SeqCst);
            vec![21]
        }),
    );
    cluster.registry.register(
        "double",
        Arc::new(|args: Vec<Vec<u8>>| vec![args[0][0] * 2]),
    );

    let node = cluster.nodes[0].clone();
    let producer = submit_spec(&cluster, "produce", vec![], 0);
    let producer_id = producer.spec.task_id;
    let o = ObjectId::for_task_return(&producer_id, 0);
    node.submit_task(producer).await.unwrap();

    let (ready, _) = node.wait(vec![o], 1, Duration::from_secs(10)).await.unwrap();
    assert_eq!(ready, vec![o]);
    assert_eq!(producer_runs.load(Ordering::SeqCst), 1);

    // Lose the object before the consumer needs it.
    node.store().delete(&[o]);
    assert!(!node.store().contains(&o));

    let consumer = submit_spec(&cluster, "double", vec![TaskArg::Reference(o)], 1);
    let result_id = ObjectId::for_task_return(&consumer.spec.task_id, 0);
    node.submit_task(consumer).await.unwrap();

    let (ready, _) = node
        .wait(vec![result_id], 1, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ready, vec![result_id]);

    // The producer re-ran exactly once, decided by a single log record at
    // attempt index zero.
    assert_eq!(producer_runs.load(Ordering::SeqCst), 2);
    let entries = cluster
        .gcs
        .task_reconstruction_log
        .entries(&producer_id)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].num_reconstructions, 0);
    assert_eq!(entries[0].node_id, node.node_id());

    let value = node
        .store()
        .get(manta_object_store::store::LOCAL_CLIENT, &[result_id])
        .pop()
        .flatten()
        .unwrap();
    assert_eq!(&value.data[..], &[42]);
}

#[test]
async fn live_locations_suppress_reconstruction() {
    let cluster =
        TestCluster::start_with_reconstruction_timeout(2, 1, Duration::from_millis(500)).await;
    let producer_runs = Arc::new(AtomicU32::new(0));
    let producer_counter = producer_runs.clone();
    cluster.registry.register(
        "produce",
        Arc::new(move |_args: Vec<Vec<u8>>| {
            producer_counter.fetch_add(1, Ordering::SeqCst);
            vec![5]
        }),
    );
    cluster.registry.register(
        "consume",
        Arc::new(|args: Vec<Vec<u8>>| args[0].clone()),
    );

    // Produce on the first node, consume from the second: the object stays
    // alive on node one, so the consumer's node pulls instead of appending
    // to the reconstruction log.
    let producer = submit_spec(&cluster, "produce", vec![], 0);
    let producer_id = producer.spec.task_id;
    let o = ObjectId::for_task_return(&producer_id, 0);
    cluster.nodes[0].submit_task(producer).await.unwrap();
    let (ready, _) = cluster.nodes[0]
        .wait(vec![o], 1, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ready, vec![o]);

    let consumer = submit_spec(&cluster, "consume", vec![TaskArg::Reference(o)], 1);
    let result_id = ObjectId::for_task_return(&consumer.spec.task_id, 0);
    cluster.nodes[1]
        .handle_forwarded_task(consumer)
        .await
        .unwrap();

    let (ready, _) = cluster.nodes[1]
        .wait(vec![result_id], 1, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ready, vec![result_id]);

    assert_eq!(producer_runs.load(Ordering::SeqCst), 1);
    let entries = cluster
        .gcs
        .task_reconstruction_log
        .entries(&producer_id)
        .await
        .unwrap();
    assert!(entries.is_empty(), "no reconstruction should be logged");
}
