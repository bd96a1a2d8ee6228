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

use dashmap::DashMap;
use manta_common::model::{ActorId, ActorState};
use manta_node::gcs::{ActorData, ActorTable};
use std::sync::Arc;
use tracing::{info, warn};

/// Callback fired when an actor is finalized; submissions against it are
/// dead letters from then on.
pub type ActorDeadCallback = Arc<dyn Fn(ActorId) + Send + Sync>;

/// Submission-side view of actor liveness, fed by the actor table
/// subscription. Calls on a reconstructing actor queue up behind its
/// recovery; calls on a dead actor fail fast.
pub struct ActorManager {
    states: Arc<DashMap<ActorId, ActorData>>,
}

impl ActorManager {
    pub fn new(actors: Arc<dyn ActorTable>, on_dead: Option<ActorDeadCallback>) -> Arc<Self> {
        let states: Arc<DashMap<ActorId, ActorData>> = Arc::new(DashMap::new());

        let listener_states = states.clone();
        let mut events = actors.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(data) => {
                        match data.state {
                            ActorState::Alive => {
                                info!(actor_id = %data.actor_id, restarts = data.num_restarts, "actor alive")
                            }
                            ActorState::Reconstructing => {
                                info!(actor_id = %data.actor_id, "actor reconstructing")
                            }
                            ActorState::Dead => {
                                warn!(actor_id = %data.actor_id, "actor dead");
                                if let Some(callback) = &on_dead {
                                    callback(data.actor_id);
                                }
                            }
                        }
                        listener_states.insert(data.actor_id, data);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(ActorManager { states })
    }

    pub fn state(&self, actor_id: &ActorId) -> Option<ActorState> {
        self.states.get(actor_id).map(|entry| entry.state)
    }

    pub fn is_dead(&self, actor_id: &ActorId) -> bool {
        self.state(actor_id) == Some(ActorState::Dead)
    }

    pub fn num_restarts(&self, actor_id: &ActorId) -> u32 {
        self.states
            .get(actor_id)
            .map(|entry| entry.num_restarts)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::{JobId, NodeId, TaskId, WorkerId};
    use manta_node::gcs::in_memory::InMemoryGcs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn actor() -> ActorId {
        let creation =
            TaskId::for_driver(JobId::from_bytes([8, 8, 8, 8]), &WorkerId::from_bytes([2u8; 16]));
        ActorId::from_creation_task(&creation)
    }

    fn data(actor_id: ActorId, state: ActorState) -> ActorData {
        ActorData {
            actor_id,
            state,
            node_id: NodeId::from_bytes([1u8; 16]),
            worker_id: WorkerId::from_bytes([1u8; 16]),
            job_id: JobId::from_bytes([8, 8, 8, 8]),
            num_restarts: 0,
        }
    }

    #[test]
    async fn tracks_state_transitions() {
        let gcs: Arc<InMemoryGcs> = Arc::new(InMemoryGcs::new());
        let manager = ActorManager::new(gcs.clone(), None);
        let actor_id = actor();

        gcs.register(data(actor_id, ActorState::Alive)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(&actor_id), Some(ActorState::Alive));

        gcs.update(data(actor_id, ActorState::Reconstructing))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(&actor_id), Some(ActorState::Reconstructing));
        assert!(!manager.is_dead(&actor_id));
    }

    #[test]
    async fn dead_actors_fire_the_dead_letter_callback() {
        let gcs: Arc<InMemoryGcs> = Arc::new(InMemoryGcs::new());
        let dead_count = Arc::new(AtomicUsize::new(0));
        let dead_in_callback = dead_count.clone();
        let manager = ActorManager::new(
            gcs.clone(),
            Some(Arc::new(move |_actor_id| {
                dead_in_callback.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let actor_id = actor();

        gcs.register(data(actor_id, ActorState::Alive)).await.unwrap();
        gcs.update(data(actor_id, ActorState::Dead)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_dead(&actor_id));
        assert_eq!(dead_count.load(Ordering::SeqCst), 1);
    }
}
