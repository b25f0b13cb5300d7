/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Component interface values: typed values bound to interface slots.
//!
//! A value is immutable once created — producing a new result means
//! creating a new value, never mutating an existing one. Construction
//! enforces that the payload matches the interface's declared kind.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::interface::{ComponentInterface, InterfaceKind};
use crate::error::ComponentError;

/// The concrete payload bound to an interface slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValuePayload {
    /// Storage-backed file content (used by file and image kinds).
    File { path: PathBuf },
    /// An inline JSON document.
    Json { value: serde_json::Value },
}

impl ValuePayload {
    fn kind_name(&self) -> &'static str {
        match self {
            ValuePayload::File { .. } => "file",
            ValuePayload::Json { .. } => "json",
        }
    }

    fn matches(&self, kind: InterfaceKind) -> bool {
        matches!(
            (self, kind),
            (ValuePayload::File { .. }, InterfaceKind::File)
                | (ValuePayload::File { .. }, InterfaceKind::Image)
                | (ValuePayload::Json { .. }, InterfaceKind::Json)
        )
    }
}

/// A typed value bound to a named interface slot, used as job input or
/// output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInterfaceValue {
    pub id: Uuid,
    pub interface: ComponentInterface,
    payload: ValuePayload,
    pub created_at: DateTime<Utc>,
}

impl ComponentInterfaceValue {
    /// Binds a payload to an interface slot.
    ///
    /// Fails with [`ComponentError::KindMismatch`] when the payload does not
    /// match the interface's declared kind.
    pub fn new(
        interface: ComponentInterface,
        payload: ValuePayload,
    ) -> Result<Self, ComponentError> {
        if !payload.matches(interface.kind) {
            return Err(ComponentError::KindMismatch {
                interface: interface.slug.clone(),
                expected: interface.kind.to_string(),
                actual: payload.kind_name().to_string(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            interface,
            payload,
            created_at: Utc::now(),
        })
    }

    /// The bound payload. Read-only: values are immutable once created.
    pub fn payload(&self) -> &ValuePayload {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_interface() -> ComponentInterface {
        ComponentInterface::new("metrics-json", InterfaceKind::Json, "results.json").unwrap()
    }

    fn image_interface() -> ComponentInterface {
        ComponentInterface::new("ct-image", InterfaceKind::Image, "images/ct.mha").unwrap()
    }

    #[test]
    fn json_payload_binds_to_json_interface() {
        let civ = ComponentInterfaceValue::new(
            json_interface(),
            ValuePayload::Json {
                value: json!({"dice": 0.91}),
            },
        )
        .unwrap();
        assert!(matches!(civ.payload(), ValuePayload::Json { .. }));
    }

    #[test]
    fn file_payload_binds_to_image_interface() {
        let civ = ComponentInterfaceValue::new(
            image_interface(),
            ValuePayload::File {
                path: PathBuf::from("/data/ct.mha"),
            },
        )
        .unwrap();
        assert_eq!(civ.interface.slug, "ct-image");
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let err = ComponentInterfaceValue::new(
            json_interface(),
            ValuePayload::File {
                path: PathBuf::from("/data/ct.mha"),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ComponentError::KindMismatch { .. }));

        let err = ComponentInterfaceValue::new(
            image_interface(),
            ValuePayload::Json { value: json!(1) },
        )
        .unwrap_err();
        assert!(matches!(err, ComponentError::KindMismatch { .. }));
    }
}
