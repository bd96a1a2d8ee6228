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

use crate::create_queue::{CreateRequestQueue, GlobalGcCallback, SpillObjectsCallback};
use crate::protocol::{PlasmaReply, PlasmaRequest};
use crate::store::{ClientId, PlasmaError, PlasmaObject, PlasmaStore, StoreNotification};
use futures::{SinkExt, StreamExt};
use manta_common::frame::FrameCodec;
use manta_common::model::ObjectId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Serves the store socket: framed requests from workers and the node
/// manager, plus the push-only notification channel for subscribers.
pub struct PlasmaServer {
    store: Arc<PlasmaStore>,
    queue: Mutex<CreateRequestQueue>,
    /// Signalled whenever space may have been freed, waking queued creates.
    space_freed: Notify,
    next_client_id: AtomicU64,
}

impl PlasmaServer {
    pub fn new(
        store: Arc<PlasmaStore>,
        spill_objects_callback: SpillObjectsCallback,
        trigger_global_gc: Option<GlobalGcCallback>,
    ) -> Self {
        let evict_if_full_default = store.config().evict_if_full_default;
        PlasmaServer {
            store,
            queue: Mutex::new(CreateRequestQueue::new(
                evict_if_full_default,
                spill_objects_callback,
                trigger_global_gc,
            )),
            space_freed: Notify::new(),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<PlasmaStore> {
        &self.store
    }

    pub async fn run(self: Arc<Self>, listener: UnixListener) -> std::io::Result<()> {
        info!("object store listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let client = server.next_client_id.fetch_add(1, Ordering::SeqCst);
                if let Err(error) = server.handle_connection(client, stream).await {
                    debug!(client, %error, "store connection closed with error");
                }
            });
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        client: ClientId,
        stream: UnixStream,
    ) -> std::io::Result<()> {
        let mut framed = Framed::new(stream, FrameCodec);
        // Pins this connection holds through Get, to be dropped on
        // disconnect.
        let mut held: HashMap<ObjectId, usize> = HashMap::new();

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let request = match PlasmaRequest::from_frame(&frame) {
                Ok(request) => request,
                Err(error) => {
                    warn!(client, %error, "undecodable store request");
                    let reply = PlasmaReply::Error { error };
                    framed.send(reply.to_frame().unwrap()).await?;
                    continue;
                }
            };

            if matches!(request, PlasmaRequest::Subscribe) {
                framed.send(PlasmaReply::Subscribed.to_frame().unwrap()).await?;
                return self.stream_notifications(framed).await;
            }

            let reply = self.handle_request(client, request, &mut held).await;
            framed.send(reply.to_frame().unwrap()).await?;
        }

        let held_ids: Vec<ObjectId> = held
            .iter()
            .flat_map(|(object_id, count)| std::iter::repeat_n(*object_id, *count))
            .collect();
        self.store.disconnect_client(client, &held_ids);
        self.queue
            .lock()
            .unwrap()
            .remove_disconnected_client_requests(client);
        self.space_freed.notify_waiters();
        Ok(())
    }

    async fn handle_request(
        self: &Arc<Self>,
        client: ClientId,
        request: PlasmaRequest,
        held: &mut HashMap<ObjectId, usize>,
    ) -> PlasmaReply {
        match request {
            PlasmaRequest::Create {
                object_id,
                data_size,
                metadata_size,
            } => PlasmaReply::Create {
                result: self
                    .create_through_queue(client, object_id, data_size as usize, metadata_size as usize)
                    .await,
            },
            PlasmaRequest::Seal { object_id, value } => {
                let result = self
                    .store
                    .write(client, object_id, &value.data, &value.metadata)
                    .map(|_| self.store.seal(client, object_id));
                PlasmaReply::Seal { result }
            }
            PlasmaRequest::Get {
                object_ids,
                timeout_ms,
            } => {
                let results = self
                    .store
                    .get_wait(client, &object_ids, Duration::from_millis(timeout_ms))
                    .await;
                for (object_id, result) in object_ids.iter().zip(&results) {
                    if result.is_some() {
                        *held.entry(*object_id).or_insert(0) += 1;
                    }
                }
                PlasmaReply::Get { results }
            }
            PlasmaRequest::Release { object_id } => {
                match held.get_mut(&object_id) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        held.remove(&object_id);
                    }
                    None => {
                        warn!(client, %object_id, "release without a matching get");
                        return PlasmaReply::Release;
                    }
                }
                self.store.release(client, object_id);
                self.space_freed.notify_waiters();
                PlasmaReply::Release
            }
            PlasmaRequest::Delete { object_ids } => {
                self.store.delete(&object_ids);
                self.space_freed.notify_waiters();
                PlasmaReply::Delete
            }
            PlasmaRequest::Evict { num_bytes } => {
                let bytes_freed = self.store.evict(num_bytes as usize) as u64;
                self.space_freed.notify_waiters();
                PlasmaReply::Evict { bytes_freed }
            }
            PlasmaRequest::Wait {
                object_ids,
                num_ready,
                timeout_ms,
            } => self.handle_wait(object_ids, num_ready, timeout_ms).await,
            PlasmaRequest::Subscribe => unreachable!("handled by the connection loop"),
        }
    }

    /// Queued create: the request goes through the admission queue and this
    /// connection task waits for its one-shot result, re-driving the queue
    /// whenever space may have been freed.
    async fn create_through_queue(
        self: &Arc<Self>,
        client: ClientId,
        object_id: ObjectId,
        data_size: usize,
        metadata_size: usize,
    ) -> Result<PlasmaObject, PlasmaError> {
        let store = self.store.clone();
        let request_id = {
            let mut queue = self.queue.lock().unwrap();
            let request_id = queue.add_request(
                object_id,
                client,
                Box::new(move |evict_if_full| {
                    store.create(client, object_id, data_size, metadata_size, evict_if_full)
                }),
            );
            let _ = queue.process_requests();
            request_id
        };

        loop {
            let space_freed = self.space_freed.notified();
            if let Some(result) = self.queue.lock().unwrap().get_request_result(request_id) {
                return result;
            }
            // Wake on freed space, or periodically in case an external spill
            // finished without touching this store.
            let _ = tokio::time::timeout(Duration::from_millis(100), space_freed).await;
            let _ = self.queue.lock().unwrap().process_requests();
        }
    }

    /// Lets the embedding process re-drive queued creates after it freed
    /// space out of band (external spill, global GC).
    pub fn notify_space_freed(&self) {
        self.space_freed.notify_waiters();
    }

    async fn handle_wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout_ms: u64,
    ) -> PlasmaReply {
        if num_ready as usize > object_ids.len() {
            return PlasmaReply::Error {
                error: manta_common::error::MantaError::invalid(
                    "num_ready exceeds the number of object ids",
                ),
            };
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut subscription = self.store.subscribe();
        loop {
            let ready: Vec<ObjectId> = object_ids
                .iter()
                .filter(|object_id| self.store.contains(object_id))
                .copied()
                .collect();
            if ready.len() >= num_ready as usize {
                let remaining = object_ids
                    .iter()
                    .filter(|object_id| !ready.contains(object_id))
                    .copied()
                    .collect();
                return PlasmaReply::Wait { ready, remaining };
            }
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Ok(StoreNotification::ObjectAdded(_))) => continue,
                Ok(Ok(StoreNotification::ObjectRemoved(_))) => continue,
                Ok(Err(_)) | Err(_) => {
                    let remaining = object_ids
                        .iter()
                        .filter(|object_id| !ready.contains(object_id))
                        .copied()
                        .collect();
                    return PlasmaReply::Wait { ready, remaining };
                }
            }
        }
    }

    async fn stream_notifications(
        &self,
        mut framed: Framed<UnixStream, FrameCodec>,
    ) -> std::io::Result<()> {
        let mut subscription = self.store.subscribe();
        loop {
            match subscription.recv().await {
                Ok(StoreNotification::ObjectAdded(info)) => {
                    let reply = PlasmaReply::Notification { info };
                    framed.send(reply.to_frame().unwrap()).await?;
                }
                Ok(StoreNotification::ObjectRemoved(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification subscriber lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
