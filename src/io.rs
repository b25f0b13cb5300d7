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

//! Value resolution between persisted interface values and the execution
//! sandbox.
//!
//! On the way in, [`materialize_inputs`] turns a job's bound values into
//! [`InputBinding`]s — concrete content the backend stages at each
//! interface's relative path under the sandbox input root (`/input` by
//! container convention). On the way out, [`materialize_outputs`] validates
//! what the container wrote under `/output` against the expected interfaces
//! and constructs new immutable values.
//!
//! Output validation is strict by policy: a malformed JSON document — wrong
//! shape for the declared schema, or non-finite numbers where JSON allows
//! none — is a fatal error, never a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::ComponentError;
use crate::models::interface::{ComponentInterface, InterfaceKind};
use crate::models::value::{ComponentInterfaceValue, ValuePayload};

/// Content staged into the sandbox for one input slot.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundSource {
    /// Stream from storage-backed content on the host.
    File { path: PathBuf },
    /// Write these bytes verbatim.
    Inline { bytes: Vec<u8> },
}

/// One resolved input: content plus where it goes in the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub interface_slug: String,
    /// Destination relative to the sandbox input root.
    pub relative_path: String,
    pub source: BoundSource,
}

/// One output slot a backend must collect.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub interface_slug: String,
    /// Location relative to the sandbox output root.
    pub relative_path: String,
}

impl From<&ComponentInterface> for OutputSpec {
    fn from(interface: &ComponentInterface) -> Self {
        Self {
            interface_slug: interface.slug.clone(),
            relative_path: interface.relative_path.clone(),
        }
    }
}

/// Raw bytes a backend collected for one expected output slot.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub interface_slug: String,
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

/// Resolves a job's input values to stageable bindings.
///
/// Fails with [`ComponentError::UnresolvedReference`] when a value's backing
/// storage is missing — before any infrastructure is provisioned.
pub fn materialize_inputs(
    civs: &[ComponentInterfaceValue],
) -> Result<Vec<InputBinding>, ComponentError> {
    civs.iter()
        .map(|civ| {
            let source = match civ.payload() {
                ValuePayload::File { path } => {
                    if !path.is_file() {
                        return Err(ComponentError::UnresolvedReference {
                            interface: civ.interface.slug.clone(),
                            message: format!("backing file {} does not exist", path.display()),
                        });
                    }
                    BoundSource::File { path: path.clone() }
                }
                ValuePayload::Json { value } => BoundSource::Inline {
                    bytes: serde_json::to_vec_pretty(value).map_err(|e| {
                        ComponentError::UnresolvedReference {
                            interface: civ.interface.slug.clone(),
                            message: format!("value could not be serialized: {e}"),
                        }
                    })?,
                },
            };

            Ok(InputBinding {
                interface_slug: civ.interface.slug.clone(),
                relative_path: civ.interface.relative_path.clone(),
                source,
            })
        })
        .collect()
}

/// Validates collected outputs against the expected interfaces and
/// constructs new immutable values.
///
/// File and image payloads are persisted under `storage_root`. Outputs the
/// container produced beyond the expected set are ignored; expected outputs
/// that are absent fail with [`ComponentError::OutputMissing`].
pub fn materialize_outputs(
    raw_outputs: &[RawOutput],
    expected: &[ComponentInterface],
    storage_root: &Path,
) -> Result<Vec<ComponentInterfaceValue>, ComponentError> {
    let by_slug: HashMap<&str, &RawOutput> = raw_outputs
        .iter()
        .map(|raw| (raw.interface_slug.as_str(), raw))
        .collect();

    for raw in raw_outputs {
        if !expected.iter().any(|i| i.slug == raw.interface_slug) {
            debug!(interface = %raw.interface_slug, "Ignoring unexpected output");
        }
    }

    expected
        .iter()
        .map(|interface| {
            let raw = by_slug.get(interface.slug.as_str()).ok_or_else(|| {
                ComponentError::OutputMissing {
                    interface: interface.slug.clone(),
                }
            })?;

            let payload = match interface.kind {
                InterfaceKind::Json => validate_json_output(interface, &raw.bytes)?,
                InterfaceKind::File | InterfaceKind::Image => {
                    persist_file_output(interface, raw, storage_root)?
                }
            };

            ComponentInterfaceValue::new(interface.clone(), payload)
        })
        .collect()
}

fn validate_json_output(
    interface: &ComponentInterface,
    bytes: &[u8],
) -> Result<ValuePayload, ComponentError> {
    // serde_json rejects NaN and Infinity outright, which enforces the
    // finite-numbers policy as part of parsing.
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ComponentError::OutputMalformed {
            interface: interface.slug.clone(),
            message: format!("invalid JSON: {e}"),
        })?;

    if let Some(schema) = &interface.schema {
        validate_schema(&value, schema, "$").map_err(|message| {
            ComponentError::OutputMalformed {
                interface: interface.slug.clone(),
                message,
            }
        })?;
    }

    Ok(ValuePayload::Json { value })
}

fn persist_file_output(
    interface: &ComponentInterface,
    raw: &RawOutput,
    storage_root: &Path,
) -> Result<ValuePayload, ComponentError> {
    if raw.bytes.is_empty() {
        return Err(ComponentError::OutputMalformed {
            interface: interface.slug.clone(),
            message: "output file is empty".into(),
        });
    }

    let destination = storage_root.join(&interface.relative_path);
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComponentError::Store {
            message: format!("could not create {}: {e}", parent.display()),
        })?;
    }
    std::fs::write(&destination, &raw.bytes).map_err(|e| ComponentError::Store {
        message: format!("could not write {}: {e}", destination.display()),
    })?;

    Ok(ValuePayload::File { path: destination })
}

/// Structural JSON-schema validation for the subset interfaces declare:
/// `type`, `properties`, `required`, `additionalProperties`, `items`,
/// `enum`, `minimum`, `maximum`.
fn validate_schema(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected_type) = schema_obj.get("type") {
        let matches_type = |name: &str| match name {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => false,
        };
        let ok = match expected_type {
            Value::String(name) => matches_type(name),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(matches_type),
            _ => true,
        };
        if !ok {
            return Err(format!("{path}: expected type {expected_type}"));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Some(minimum) = schema_obj.get("minimum").and_then(Value::as_f64) {
        if let Some(number) = value.as_f64() {
            if number < minimum {
                return Err(format!("{path}: {number} is below minimum {minimum}"));
            }
        }
    }
    if let Some(maximum) = schema_obj.get("maximum").and_then(Value::as_f64) {
        if let Some(number) = value.as_f64() {
            if number > maximum {
                return Err(format!("{path}: {number} is above maximum {maximum}"));
            }
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        if let Some(object) = value.as_object() {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(format!("{path}: missing required property \"{name}\""));
                }
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some(object) = value.as_object() {
            for (name, property_schema) in properties {
                if let Some(property_value) = object.get(name) {
                    validate_schema(property_value, property_schema, &format!("{path}.{name}"))?;
                }
            }

            if schema_obj.get("additionalProperties") == Some(&Value::Bool(false)) {
                for name in object.keys() {
                    if !properties.contains_key(name) {
                        return Err(format!("{path}: unexpected property \"{name}\""));
                    }
                }
            }
        }
    }

    if let Some(item_schema) = schema_obj.get("items") {
        if let Some(items) = value.as_array() {
            for (index, item) in items.iter().enumerate() {
                validate_schema(item, item_schema, &format!("{path}[{index}]"))?;
            }
        }
    }

    Ok(())
}
