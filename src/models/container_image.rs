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

//! Container image artifacts.
//!
//! A [`ContainerImage`] is an immutable, content-addressed record of a
//! container artifact ready for execution. Images are validated once, marked
//! [`ImageStatus::Ready`] and never mutated afterwards; many jobs reference
//! the same image concurrently. The pair `(owner_scope, digest)` is unique —
//! the store enforces it at creation time.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::ComponentError;

/// A sha256 content digest, formatted `sha256:<64 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageDigest(String);

fn digest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("static pattern"))
}

impl ImageDigest {
    pub fn parse(raw: &str) -> Result<Self, ComponentError> {
        if !digest_pattern().is_match(raw) {
            return Err(ComponentError::ImageInvalid {
                message: format!("\"{raw}\" is not a sha256 digest"),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Computes the digest of raw artifact bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("sha256:{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation lifecycle of a container image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// Uploaded but not yet validated.
    Pending,
    /// Validated and executable. Immutable from here on.
    Ready,
    /// Failed validation; never executable.
    Invalid,
}

/// An immutable, content-addressed container artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerImage {
    pub id: Uuid,
    /// The scope that owns this image (an algorithm or challenge phase).
    pub owner_scope: String,
    /// Registry location, e.g. `registry.example.org/algorithms/lung-seg`.
    pub registry_uri: String,
    pub digest: ImageDigest,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl ContainerImage {
    pub fn new(
        owner_scope: impl Into<String>,
        registry_uri: impl Into<String>,
        digest: ImageDigest,
    ) -> Result<Self, ComponentError> {
        let registry_uri = registry_uri.into();

        // Registry URIs are scheme-less; prepend one for structural checks.
        Url::parse(&format!("docker://{registry_uri}")).map_err(|e| {
            ComponentError::ImageInvalid {
                message: format!("registry URI \"{registry_uri}\": {e}"),
            }
        })?;

        Ok(Self {
            id: Uuid::new_v4(),
            owner_scope: owner_scope.into(),
            registry_uri,
            digest,
            status: ImageStatus::Pending,
            created_at: Utc::now(),
            validated_at: None,
        })
    }

    /// The pinned reference backends execute: `<registry_uri>@<digest>`.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.registry_uri, self.digest)
    }

    /// Marks the image executable. Only valid from [`ImageStatus::Pending`];
    /// a ready image is immutable.
    pub fn mark_ready(&mut self) -> Result<(), ComponentError> {
        if self.status != ImageStatus::Pending {
            return Err(ComponentError::ImageInvalid {
                message: format!("image {} is already {:?}", self.id, self.status),
            });
        }
        self.status = ImageStatus::Ready;
        self.validated_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the image as failed validation.
    pub fn mark_invalid(&mut self) -> Result<(), ComponentError> {
        if self.status != ImageStatus::Pending {
            return Err(ComponentError::ImageInvalid {
                message: format!("image {} is already {:?}", self.id, self.status),
            });
        }
        self.status = ImageStatus::Invalid;
        self.validated_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.status == ImageStatus::Ready
    }
}
