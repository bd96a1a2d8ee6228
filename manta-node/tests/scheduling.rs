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
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_r::test;

test_r::enable!();

fn job() -> JobId {
    JobId::from_bytes([7, 7, 7, 7])
}

fn submit_spec(
    cluster: &TestCluster,
    descriptor: &str,
    arguments: Vec<TaskArg>,
    cpus: i64,
    index: u32,
) -> Task {
    let driver = cluster.driver_task();
    let spec = TaskSpecBuilder::new(
        job(),
        driver,
        index,
        driver,
        Language::Rust,
        FunctionDescriptor::new([descriptor]),
        arguments,
        1,
        ResourceSet::from_units(&[(CPU_RESOURCE, cpus)]),
        ResourceSet::new(),
    )
    .build();
    Task::new(spec, vec![])
}

#[test]
async fn task_chain_runs_to_completion() {
    // Two chained increments: the second consumes the first's return.
    let cluster = TestCluster::start(1, 2).await;
    cluster.registry.register(
        "inc",
        Arc::new(|args: Vec<Vec<u8>>| {
            let input = args[0][0];
            vec![input + 1]
        }),
    );

    let node = cluster.nodes[0].clone();
    let first = submit_spec(&cluster, "inc", vec![TaskArg::Value(vec![42])], 1, 0);
    let o1 = ObjectId::for_task_return(&first.spec.task_id, 0);
    node.submit_task(first).await.unwrap();

    let second = submit_spec(&cluster, "inc", vec![TaskArg::Reference(o1)], 1, 1);
    let o2 = ObjectId::for_task_return(&second.spec.task_id, 0);
    node.submit_task(second).await.unwrap();

    let (ready, _) = node
        .wait(vec![o2], 1, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(ready, vec![o2]);
    let value = node
        .store()
        .get(manta_object_store::store::LOCAL_CLIENT, &[o2])
        .pop()
        .flatten()
        .unwrap();
    assert_eq!(&value.data[..], &[44]);
}

#[test]
async fn three_tasks_on_two_single_cpu_nodes_spill_back_once() {
    let cluster = TestCluster::start(2, 1).await;
    let concurrent = Arc::new(AtomicU32::new(0));
    let max_concurrent = Arc::new(AtomicU32::new(0));
    let sleeper_concurrent = concurrent.clone();
    let sleeper_max = max_concurrent.clone();
    cluster.registry.register(
        "busy",
        Arc::new(move |args: Vec<Vec<u8>>| {
            let now = sleeper_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            sleeper_max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            sleeper_concurrent.fetch_sub(1, Ordering::SeqCst);
            args[0].clone()
        }),
    );

    let node = cluster.nodes[0].clone();
    let mut returns = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..3 {
        let task = submit_spec(&cluster, "busy", vec![TaskArg::Value(vec![i as u8])], 1, i);
        returns.push(ObjectId::for_task_return(&task.spec.task_id, 0));
        tasks.push(task);
    }
    for task in tasks {
        node.submit_task(task).await.unwrap();
        // Give the pipeline a moment so placement decisions see the load.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let (ready, remaining) = node
        .wait(returns.clone(), 3, Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(remaining, Vec::<ObjectId>::new());
    assert_eq!(ready.len(), 3);

    // One CPU per node: never more than two tasks at once, and the second
    // node must have run at least one of them.
    assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    let on_second_node = returns
        .iter()
        .filter(|object_id| cluster.nodes[1].store().contains(object_id))
        .count();
    assert!(
        (1..=2).contains(&on_second_node),
        "expected spillback to the second node, got {on_second_node} results there"
    );

    // Every result matches a serial execution.
    for (i, object_id) in returns.iter().enumerate() {
        let holder = cluster
            .nodes
            .iter()
            .find(|node| node.store().contains(object_id))
            .expect("result must exist somewhere");
        let value = holder
            .store()
            .get(manta_object_store::store::LOCAL_CLIENT, &[*object_id])
            .pop()
            .flatten()
            .unwrap();
        assert_eq!(&value.data[..], &[i as u8]);
    }
}

#[test]
async fn capacity_equation_holds_during_execution() {
    let cluster = TestCluster::start(1, 2).await;
    let running = Arc::new(Mutex::new(Vec::new()));
    let running_in_function = running.clone();
    cluster.registry.register(
        "hold",
        Arc::new(move |args: Vec<Vec<u8>>| {
            running_in_function.lock().unwrap().push(args[0][0]);
            std::thread::sleep(Duration::from_millis(100));
            args[0].clone()
        }),
    );

    let node = cluster.nodes[0].clone();
    let mut returns = Vec::new();
    for i in 0..4 {
        let task = submit_spec(&cluster, "hold", vec![TaskArg::Value(vec![i as u8])], 1, i);
        returns.push(ObjectId::for_task_return(&task.spec.task_id, 0));
        node.submit_task(task).await.unwrap();
    }

    let (ready, _) = node
        .wait(returns.clone(), 4, Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(ready.len(), 4);
    assert_eq!(running.lock().unwrap().len(), 4);
}

#[test]
async fn cancellation_before_dispatch_prevents_execution() {
    let cluster = TestCluster::start(1, 1).await;
    let executed = Arc::new(AtomicU32::new(0));
    let executed_in_function = executed.clone();
    cluster.registry.register(
        "count",
        Arc::new(move |args: Vec<Vec<u8>>| {
            executed_in_function.fetch_add(1, Ordering::SeqCst);
            args[0].clone()
        }),
    );

    let node = cluster.nodes[0].clone();
    // A task waiting on an argument that never appears stays cancelable.
    let missing = ObjectId::for_task_return(&cluster.driver_task(), 77);
    let parked = submit_spec(&cluster, "count", vec![TaskArg::Reference(missing)], 1, 0);
    let parked_id = parked.spec.task_id;
    node.submit_task(parked).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(node.cancel_task(parked_id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executed.load(Ordering::SeqCst), 0);
}

#[test]
async fn wire_protocol_round_trips_through_the_node_server() {
    use manta_node::protocol::{NodeReply, NodeRequest};
    use manta_node::server::{NodeServer, SocketPeerPool};

    let cluster = TestCluster::start(1, 2).await;
    cluster.registry.register(
        "echo",
        Arc::new(|args: Vec<Vec<u8>>| args[0].clone()),
    );
    let node = cluster.nodes[0].clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(NodeServer::new(node.clone()).run(listener));

    // A framed driver connection: register, submit, wait.
    use futures::{SinkExt, StreamExt};
    use manta_common::frame::FrameCodec;
    use tokio_util::codec::Framed;
    let stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec);

    let request = NodeRequest::RegisterClient {
        worker_id: manta_common::model::WorkerId::new_random(),
        language: Language::Rust,
        is_driver: true,
        job_id: job(),
    };
    framed.send(request.to_frame().unwrap()).await.unwrap();
    let reply = NodeReply::from_frame(&framed.next().await.unwrap().unwrap()).unwrap();
    assert!(matches!(reply, NodeReply::Registered { .. }));

    let task = submit_spec(&cluster, "echo", vec![TaskArg::Value(vec![9])], 1, 50);
    let result_id = ObjectId::for_task_return(&task.spec.task_id, 0);
    framed
        .send(NodeRequest::SubmitTask { task }.to_frame().unwrap())
        .await
        .unwrap();
    let reply = NodeReply::from_frame(&framed.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply, NodeReply::Ack);

    framed
        .send(
            NodeRequest::Wait {
                object_ids: vec![result_id],
                num_ready: 1,
                timeout_ms: 10000,
            }
            .to_frame()
            .unwrap(),
        )
        .await
        .unwrap();
    let reply = NodeReply::from_frame(&framed.next().await.unwrap().unwrap()).unwrap();
    match reply {
        NodeReply::WaitReply { ready, remaining } => {
            assert_eq!(ready, vec![result_id]);
            assert!(remaining.is_empty());
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    // The peer pool speaks the same protocol; a pull request for a local
    // object is acknowledged.
    let addresses = Arc::new(dashmap::DashMap::new());
    let pool = SocketPeerPool::new(addresses);
    pool.set_address(
        node.node_id(),
        manta_common::model::NodeAddress {
            host: "127.0.0.1".to_string(),
            port: address.port(),
        },
    );
    use manta_node::services::object_manager::PeerClientPool;
    pool.send_pull_request(node.node_id(), result_id, node.node_id())
        .await
        .unwrap();
}

#[test]
async fn finished_jobs_fail_their_queued_tasks() {
    use manta_node::gcs::JobData;

    let cluster = TestCluster::start(1, 1).await;
    cluster.registry.register(
        "never",
        Arc::new(|args: Vec<Vec<u8>>| args[0].clone()),
    );

    let node = cluster.nodes[0].clone();
    // Parked forever on an argument that does not exist.
    let missing = ObjectId::for_task_return(&cluster.driver_task(), 88);
    let parked = submit_spec(&cluster, "never", vec![TaskArg::Reference(missing)], 1, 60);
    let return_id = ObjectId::for_task_return(&parked.spec.task_id, 0);
    node.submit_task(parked).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The driver registered its job; its death marks the job finished.
    cluster
        .gcs
        .jobs
        .put(JobData {
            job_id: job(),
            driver_node_id: node.node_id(),
            is_dead: false,
        })
        .await
        .unwrap();
    cluster.gcs.jobs.delete_by_job_id(&job()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if node.store().contains(&return_id) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queued task of the finished job was never failed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let value = node
        .store()
        .get(manta_object_store::store::LOCAL_CLIENT, &[return_id])
        .pop()
        .flatten()
        .unwrap();
    assert_eq!(
        value.error_tag(),
        Some(manta_common::model::ErrorTag::TaskFailed)
    );
}
