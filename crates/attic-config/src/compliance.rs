// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Allowed retention window, globally and per classification label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetentionBounds {
    pub min_days: u32,
    pub max_days: u32,
    /// Narrower windows for specific classification labels.
    pub per_classification: BTreeMap<String, (u32, u32)>,
}

impl Default for RetentionBounds {
    fn default() -> Self {
        Self {
            min_days: 1,
            max_days: 3_650,
            per_classification: BTreeMap::new(),
        }
    }
}

impl RetentionBounds {
    /// Checks an effective retention against the applicable window.
    pub fn check(&self, retention_days: u32, classification: Option<&str>) -> Result<(), String> {
        let (min, max) = classification
            .and_then(|label| self.per_classification.get(label).copied())
            .unwrap_or((self.min_days, self.max_days));
        if retention_days < min || retention_days > max {
            return Err(format!(
                "retention of {retention_days} days outside allowed [{min}, {max}]{}",
                classification
                    .map(|c| format!(" for classification {c:?}"))
                    .unwrap_or_default()
            ));
        }
        Ok(())
    }
}

/// Where legal holds are looked up before a table runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LegalHoldSourceConfig {
    /// No legal-hold integration configured.
    #[default]
    None,
    /// JSON file shipped with the deployment.
    StaticFile { path: PathBuf },
    /// Table in the source database holding hold rows.
    Table { table: String },
    /// HTTP endpoint returning active holds as JSON.
    Http { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ComplianceConfig {
    pub retention_bounds: RetentionBounds,
    pub legal_hold: LegalHoldSourceConfig,
    pub require_encryption_for_critical: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            retention_bounds: RetentionBounds::default(),
            legal_hold: LegalHoldSourceConfig::default(),
            require_encryption_for_critical: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_bounds_apply_without_classification() {
        let bounds = RetentionBounds {
            min_days: 30,
            max_days: 365,
            per_classification: BTreeMap::new(),
        };
        assert!(bounds.check(90, None).is_ok());
        assert!(bounds.check(10, None).is_err());
        assert!(bounds.check(400, None).is_err());
    }

    #[test]
    fn classification_narrows_the_window() {
        let mut per = BTreeMap::new();
        per.insert("pii".to_string(), (30, 90));
        let bounds = RetentionBounds {
            min_days: 1,
            max_days: 3650,
            per_classification: per,
        };
        assert!(bounds.check(2000, None).is_ok());
        assert!(bounds.check(2000, Some("pii")).is_err());
        assert!(bounds.check(60, Some("pii")).is_ok());
    }

    #[test]
    fn legal_hold_source_parses_variants() {
        let yaml = "static-file:\n  path: /etc/attic/holds.json\n";
        let source: LegalHoldSourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(source, LegalHoldSourceConfig::StaticFile { .. }));
    }
}
