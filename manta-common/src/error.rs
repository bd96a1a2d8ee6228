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

use serde::{Deserialize, Serialize};

/// Errors surfaced at the runtime core's boundary. Wire replies carry these
/// verbatim, so the type is serializable and self-contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum MantaError {
    #[error("out of memory: {details}")]
    OutOfMemory { details: String },
    #[error("object store full: {details}")]
    ObjectStoreFull { details: String },
    #[error("key error: {details}")]
    KeyError { details: String },
    #[error("type error: {details}")]
    TypeError { details: String },
    #[error("invalid argument: {details}")]
    Invalid { details: String },
    #[error("io error: {details}")]
    IoError { details: String },
    #[error("object already exists: {details}")]
    ObjectExists { details: String },
    #[error("gcs error: {details}")]
    GcsError { details: String },
    #[error("timed out: {details}")]
    TimedOut { details: String },
    #[error("interrupted: {details}")]
    Interrupted { details: String },
    #[error("intentional system exit")]
    IntentionalSystemExit,
    #[error("unexpected system exit")]
    UnexpectedSystemExit,
    #[error("not implemented: {details}")]
    NotImplemented { details: String },
}

impl MantaError {
    pub fn out_of_memory(details: impl Into<String>) -> Self {
        MantaError::OutOfMemory {
            details: details.into(),
        }
    }

    pub fn object_store_full(details: impl Into<String>) -> Self {
        MantaError::ObjectStoreFull {
            details: details.into(),
        }
    }

    pub fn key_error(details: impl Into<String>) -> Self {
        MantaError::KeyError {
            details: details.into(),
        }
    }

    pub fn type_error(details: impl Into<String>) -> Self {
        MantaError::TypeError {
            details: details.into(),
        }
    }

    pub fn invalid(details: impl Into<String>) -> Self {
        MantaError::Invalid {
            details: details.into(),
        }
    }

    pub fn io_error(details: impl Into<String>) -> Self {
        MantaError::IoError {
            details: details.into(),
        }
    }

    pub fn object_exists(details: impl Into<String>) -> Self {
        MantaError::ObjectExists {
            details: details.into(),
        }
    }

    pub fn gcs_error(details: impl Into<String>) -> Self {
        MantaError::GcsError {
            details: details.into(),
        }
    }

    pub fn timed_out(details: impl Into<String>) -> Self {
        MantaError::TimedOut {
            details: details.into(),
        }
    }

    pub fn interrupted(details: impl Into<String>) -> Self {
        MantaError::Interrupted {
            details: details.into(),
        }
    }

    pub fn not_implemented(details: impl Into<String>) -> Self {
        MantaError::NotImplemented {
            details: details.into(),
        }
    }

    /// Whether the caller may retry the producing operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MantaError::OutOfMemory { .. }
                | MantaError::IoError { .. }
                | MantaError::GcsError { .. }
        )
    }
}

impl From<std::io::Error> for MantaError {
    fn from(err: std::io::Error) -> Self {
        MantaError::io_error(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MantaError>;
