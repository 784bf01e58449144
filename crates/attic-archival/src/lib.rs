// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The archival engine: verify-then-delete batches driven through a
//! state machine, durable watermarks and manifests in object storage,
//! distributed locking, compliance gating, and run orchestration.

pub mod audit;
pub mod checkpoint;
pub mod compliance;
pub mod error;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod pipeline;
pub mod run;
pub mod sizer;
pub mod table;
pub mod types;
pub mod verify;
pub mod watermark;

pub use error::{ArchiveError, ErrorContext};
pub use types::{BatchArtifact, BatchPlan, TableId, Watermark};

/// Version stamped into every metadata record and audit event.
pub const ARCHIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
