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

use crate::error::MantaError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wire and handle payloads are bincode; failures surface as type errors and
/// never unwind across a connection handler.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, MantaError> {
    bincode::serialize(value).map_err(|err| MantaError::type_error(format!("serialize: {err}")))
}

pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, MantaError> {
    bincode::deserialize(data).map_err(|err| MantaError::type_error(format!("deserialize: {err}")))
}
