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

use crate::protocol::{PlasmaReply, PlasmaRequest};
use crate::store::{PlasmaError, PlasmaObject};
use futures::{SinkExt, StreamExt};
use manta_common::error::MantaError;
use manta_common::frame::FrameCodec;
use manta_common::model::{ObjectId, ObjectInfo, ObjectValue};
use std::path::Path;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::warn;

/// Async client for the store socket. One request is in flight per client at
/// a time, matching the per-connection reply ordering of the server.
pub struct PlasmaClient {
    framed: Mutex<Framed<UnixStream, FrameCodec>>,
}

impl PlasmaClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, MantaError> {
        let stream = UnixStream::connect(path).await?;
        Ok(PlasmaClient {
            framed: Mutex::new(Framed::new(stream, FrameCodec)),
        })
    }

    async fn request(&self, request: PlasmaRequest) -> Result<PlasmaReply, MantaError> {
        let mut framed = self.framed.lock().await;
        framed.send(request.to_frame()?).await?;
        loop {
            match framed.next().await {
                Some(Ok(frame)) => {
                    let reply = PlasmaReply::from_frame(&frame)?;
                    if matches!(reply, PlasmaReply::Notification { .. }) {
                        // Notifications only flow on subscribed connections.
                        warn!("unexpected notification on a request connection");
                        continue;
                    }
                    return Ok(reply);
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Err(MantaError::io_error("store connection closed")),
            }
        }
    }

    pub async fn create(
        &self,
        object_id: ObjectId,
        data_size: u64,
        metadata_size: u64,
    ) -> Result<Result<PlasmaObject, PlasmaError>, MantaError> {
        match self
            .request(PlasmaRequest::Create {
                object_id,
                data_size,
                metadata_size,
            })
            .await?
        {
            PlasmaReply::Create { result } => Ok(result),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Create", &other)),
        }
    }

    pub async fn seal(
        &self,
        object_id: ObjectId,
        value: ObjectValue,
    ) -> Result<Result<ObjectInfo, PlasmaError>, MantaError> {
        match self
            .request(PlasmaRequest::Seal { object_id, value })
            .await?
        {
            PlasmaReply::Seal { result } => Ok(result),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Seal", &other)),
        }
    }

    /// Convenience path used by workers storing a finished value: create the
    /// buffer (queueing under pressure) and seal it with the payload.
    pub async fn create_and_seal(
        &self,
        object_id: ObjectId,
        value: ObjectValue,
    ) -> Result<Result<ObjectInfo, PlasmaError>, MantaError> {
        match self
            .create(object_id, value.data.len() as u64, value.metadata.len() as u64)
            .await?
        {
            Ok(_) => self.seal(object_id, value).await,
            Err(error) => Ok(Err(error)),
        }
    }

    pub async fn get(
        &self,
        object_ids: Vec<ObjectId>,
        timeout_ms: u64,
    ) -> Result<Vec<Option<ObjectValue>>, MantaError> {
        match self
            .request(PlasmaRequest::Get {
                object_ids,
                timeout_ms,
            })
            .await?
        {
            PlasmaReply::Get { results } => Ok(results),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Get", &other)),
        }
    }

    pub async fn release(&self, object_id: ObjectId) -> Result<(), MantaError> {
        match self.request(PlasmaRequest::Release { object_id }).await? {
            PlasmaReply::Release => Ok(()),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Release", &other)),
        }
    }

    pub async fn delete(&self, object_ids: Vec<ObjectId>) -> Result<(), MantaError> {
        match self.request(PlasmaRequest::Delete { object_ids }).await? {
            PlasmaReply::Delete => Ok(()),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Delete", &other)),
        }
    }

    pub async fn evict(&self, num_bytes: u64) -> Result<u64, MantaError> {
        match self.request(PlasmaRequest::Evict { num_bytes }).await? {
            PlasmaReply::Evict { bytes_freed } => Ok(bytes_freed),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Evict", &other)),
        }
    }

    pub async fn wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout_ms: u64,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>), MantaError> {
        match self
            .request(PlasmaRequest::Wait {
                object_ids,
                num_ready,
                timeout_ms,
            })
            .await?
        {
            PlasmaReply::Wait { ready, remaining } => Ok((ready, remaining)),
            PlasmaReply::Error { error } => Err(error),
            other => Err(unexpected("Wait", &other)),
        }
    }

    /// Opens the push channel: a dedicated connection on which the store
    /// streams every sealed object's info record.
    pub async fn subscribe(
        path: impl AsRef<Path>,
    ) -> Result<mpsc::UnboundedReceiver<ObjectInfo>, MantaError> {
        let stream = UnixStream::connect(path).await?;
        let mut framed = Framed::new(stream, FrameCodec);
        framed.send(PlasmaRequest::Subscribe.to_frame()?).await?;
        match framed.next().await {
            Some(Ok(frame)) => match PlasmaReply::from_frame(&frame)? {
                PlasmaReply::Subscribed => {}
                other => return Err(unexpected("Subscribe", &other)),
            },
            Some(Err(error)) => return Err(error.into()),
            None => return Err(MantaError::io_error("store connection closed")),
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = framed.next().await {
                match PlasmaReply::from_frame(&frame) {
                    Ok(PlasmaReply::Notification { info }) => {
                        if sender.send(info).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "dropping undecodable store notification");
                    }
                }
            }
        });
        Ok(receiver)
    }
}

fn unexpected(operation: &str, reply: &PlasmaReply) -> MantaError {
    MantaError::io_error(format!("unexpected reply to {operation}: {reply:?}"))
}
