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

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Bounded concurrency pool for async actor method calls: at most
/// `max_concurrency` calls run at once, the rest queue on the semaphore.
/// Shutdown is a signalled event; calls submitted afterwards are dropped.
pub struct FiberPool {
    semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
}

impl FiberPool {
    pub fn new(max_concurrency: usize) -> Arc<Self> {
        Arc::new(FiberPool {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            shutdown: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Runs `call` under the concurrency cap. Returns `None` when the pool
    /// was shut down before the call could start.
    pub async fn run<F, T>(&self, call: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.ok()?,
            _ = self.shutdown.notified() => return None,
        };
        let result = call.await;
        drop(permit);
        Some(result)
    }

    pub fn shut_down(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}
