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

//! Component interfaces: named, typed I/O slots.
//!
//! An interface declares a slot that jobs bind values to — a screenshot
//! image, a segmentation overlay, a metrics JSON document. The interface
//! fixes the slot's kind, its relative path inside the execution sandbox,
//! and (for JSON kinds) an optional schema that output values must satisfy.
//!
//! Interfaces are owned by the configuration side (an algorithm, a challenge
//! phase) and referenced — never owned — by jobs and their values.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ComponentError;

/// The kind of value an interface slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// A medical image artifact (e.g. MHA, NIfTI, TIFF).
    Image,
    /// An arbitrary file artifact.
    File,
    /// An inline JSON document, optionally schema-constrained.
    Json,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::Image => write!(f, "image"),
            InterfaceKind::File => write!(f, "file"),
            InterfaceKind::Json => write!(f, "json"),
        }
    }
}

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static pattern"))
}

/// A named, typed I/O slot declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInterface {
    /// Stable identifier, e.g. `metrics-json` or `ct-image`.
    pub slug: String,
    pub kind: InterfaceKind,
    /// Path of the bound value relative to the sandbox input or output root.
    pub relative_path: String,
    /// Structural schema for [`InterfaceKind::Json`] values. Ignored for
    /// file and image kinds.
    pub schema: Option<serde_json::Value>,
}

impl ComponentInterface {
    /// Creates an interface, validating the slug and relative path.
    pub fn new(
        slug: impl Into<String>,
        kind: InterfaceKind,
        relative_path: impl Into<String>,
    ) -> Result<Self, ComponentError> {
        let slug = slug.into();
        let relative_path = relative_path.into();

        if !slug_pattern().is_match(&slug) {
            return Err(ComponentError::UnresolvedReference {
                interface: slug.clone(),
                message: "slug must be lowercase alphanumeric with dashes".into(),
            });
        }
        validate_relative_path(&slug, &relative_path)?;

        Ok(Self {
            slug,
            kind,
            relative_path,
            schema: None,
        })
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// File extension of the declared relative path, if any.
    pub fn extension(&self) -> Option<&str> {
        std::path::Path::new(&self.relative_path)
            .extension()
            .and_then(|ext| ext.to_str())
    }
}

fn validate_relative_path(slug: &str, relative_path: &str) -> Result<(), ComponentError> {
    let invalid = relative_path.is_empty()
        || relative_path.starts_with('/')
        || relative_path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        return Err(ComponentError::UnresolvedReference {
            interface: slug.to_string(),
            message: format!("\"{relative_path}\" is not a safe relative path"),
        });
    }
    Ok(())
}
