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

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_directive.parse().expect("invalid directive"))
        .from_env_lossy()
}

/// Console subscriber for binaries.
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter(default_directive)))
        .init();
}

/// Pretty, time-less subscriber for tests; safe to call more than once.
pub fn init_tracing_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(tracing_subscriber::fmt::format().without_time().pretty())
                .with_ansi(true)
                .with_filter(env_filter("debug")),
        )
        .try_init();
}
