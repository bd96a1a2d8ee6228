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

use crate::config::RetryConfig;
use crate::error::MantaError;
use std::future::Future;
use tracing::warn;

/// Runs `action` until it succeeds, the error is no longer transient, or the
/// retry budget is exhausted. The last error is returned in the failure case.
pub async fn with_retries<T, F, Fut>(
    description: &str,
    config: &RetryConfig,
    mut action: F,
) -> Result<T, MantaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MantaError>>,
{
    let mut attempt = 1;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => match config.delay_for_attempt(attempt) {
                Some(delay) => {
                    warn!(%error, attempt, "{description} failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            },
            Err(error) => return Err(error),
        }
    }
}
