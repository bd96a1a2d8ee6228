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

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    static ref TASKS_SCHEDULED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "manta_tasks_scheduled_total",
        "Number of tasks that passed node selection, by placement",
        &["placement"]
    )
    .unwrap();
    static ref TASKS_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        "manta_tasks_dispatched_total",
        "Number of tasks handed to a worker"
    )
    .unwrap();
    static ref TASKS_SPILLED_BACK_TOTAL: IntCounter = register_int_counter!(
        "manta_tasks_spilled_back_total",
        "Number of tasks forwarded to another node"
    )
    .unwrap();
    static ref OBJECTS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "manta_objects_created_total",
        "Number of objects created in the local store"
    )
    .unwrap();
    static ref OBJECTS_EVICTED_TOTAL: IntCounter = register_int_counter!(
        "manta_objects_evicted_total",
        "Number of objects evicted from the local store"
    )
    .unwrap();
    static ref OBJECTS_PULLED_TOTAL: IntCounter = register_int_counter!(
        "manta_objects_pulled_total",
        "Number of objects fetched from a peer or restored from spill"
    )
    .unwrap();
    static ref RECONSTRUCTIONS_TRIGGERED_TOTAL: IntCounter = register_int_counter!(
        "manta_reconstructions_triggered_total",
        "Number of task re-executions this node won"
    )
    .unwrap();
    static ref STORE_BYTES_IN_USE: IntGauge = register_int_gauge!(
        "manta_object_store_bytes_in_use",
        "Bytes currently allocated in the local object store"
    )
    .unwrap();
    static ref WORKERS_IDLE: IntGauge =
        register_int_gauge!("manta_workers_idle", "Idle workers in the local pool").unwrap();
    static ref WORKERS_LEASED: IntGauge =
        register_int_gauge!("manta_workers_leased", "Leased workers in the local pool").unwrap();
}

pub fn record_task_scheduled(local: bool) {
    let placement = if local { "local" } else { "remote" };
    TASKS_SCHEDULED_TOTAL.with_label_values(&[placement]).inc();
}

pub fn record_task_dispatched() {
    TASKS_DISPATCHED_TOTAL.inc();
}

pub fn record_task_spilled_back() {
    TASKS_SPILLED_BACK_TOTAL.inc();
}

pub fn record_object_created() {
    OBJECTS_CREATED_TOTAL.inc();
}

pub fn record_object_evicted() {
    OBJECTS_EVICTED_TOTAL.inc();
}

pub fn record_object_pulled() {
    OBJECTS_PULLED_TOTAL.inc();
}

pub fn record_reconstruction_triggered() {
    RECONSTRUCTIONS_TRIGGERED_TOTAL.inc();
}

pub fn set_store_bytes_in_use(bytes: u64) {
    STORE_BYTES_IN_USE.set(bytes as i64);
}

pub fn set_idle_workers(count: usize) {
    WORKERS_IDLE.set(count as i64);
}

pub fn set_leased_workers(count: usize) {
    WORKERS_LEASED.set(count as i64);
}
