// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared component-status board backing the `/health` endpoint.
/// Components report in as they come up and whenever their state changes.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, component: &str, status: ComponentStatus, detail: Option<String>) {
        self.components
            .write()
            .insert(component.to_string(), ComponentHealth { status, detail });
    }

    pub fn report(&self) -> HealthReport {
        let components = self.components.read().clone();
        let healthy = components
            .values()
            .all(|c| matches!(c.status, ComponentStatus::Healthy | ComponentStatus::Unknown));
        HealthReport {
            healthy,
            components,
        }
    }
}
