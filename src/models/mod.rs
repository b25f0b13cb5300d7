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

//! Data models for the job-execution control plane.

pub mod container_image;
pub mod execution_event;
pub mod interface;
pub mod job;
pub mod value;

pub use container_image::{ContainerImage, ImageDigest, ImageStatus};
pub use execution_event::{ExecutionEvent, ExecutionEventType};
pub use interface::{ComponentInterface, InterfaceKind};
pub use job::{Job, JobStatus, JobUtilization};
pub use value::{ComponentInterfaceValue, ValuePayload};
