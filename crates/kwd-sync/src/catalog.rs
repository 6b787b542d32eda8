//! Static configuration: `categories.yaml` and `certification.yaml`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use kwd_core::CategoryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::calibration::CalibrationPolicy;
use crate::certification::{CertificationPolicy, HydrationThresholds};
use crate::growth::GrowthSettings;
use crate::guard::{GuardFilter, GuardTables};
use crate::metrics::MetricsConfig;
use crate::seeds::{SeedGenerator, SeedTemplates};

pub const CATEGORIES_FILE: &str = "categories.yaml";
pub const CERTIFICATION_FILE: &str = "certification.yaml";

/// Configuration that loaded but does not make sense.
#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("no categories configured")]
    Empty,

    #[error("category {0} is defined more than once")]
    DuplicateCategory(String),

    #[error("category {0} has no anchors")]
    NoAnchors(String),

    #[error("category {category_id} repeats anchor {anchor_id}")]
    DuplicateAnchor {
        category_id: String,
        anchor_id: String,
    },

    /// The lite tier must be strictly looser than full.
    #[error("certification thresholds out of order: {0}")]
    ThresholdOrder(String),

    #[error("calibration alpha {0} is outside [0, 1]")]
    AlphaOutOfRange(f64),

    #[error("guard year range {min}..={max} is empty")]
    YearRange { min: u16, max: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCatalog {
    #[serde(default)]
    pub guard: GuardTables,
    #[serde(default)]
    pub seeds: SeedTemplates,
    pub categories: Vec<CategoryConfig>,
}

impl CategoryCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalog: Self = serde_yaml::from_str(text).context("parsing category catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(CATEGORIES_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let catalog: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        catalog
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.categories.is_empty() {
            return Err(CatalogError::Empty);
        }
        let range = self.guard.year_range;
        if range.min > range.max {
            return Err(CatalogError::YearRange {
                min: range.min,
                max: range.max,
            });
        }
        let mut ids = HashSet::new();
        for category in &self.categories {
            if !ids.insert(category.id.as_str()) {
                return Err(CatalogError::DuplicateCategory(category.id.clone()));
            }
            if category.anchors.is_empty() {
                return Err(CatalogError::NoAnchors(category.id.clone()));
            }
            let mut anchors = HashSet::new();
            for anchor in &category.anchors {
                if !anchors.insert(anchor.anchor_id.as_str()) {
                    return Err(CatalogError::DuplicateAnchor {
                        category_id: category.id.clone(),
                        anchor_id: anchor.anchor_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn category(&self, id: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.id.clone()).collect()
    }

    pub fn guard_filter(&self) -> GuardFilter {
        GuardFilter::new(self.guard.clone(), &self.categories)
    }

    pub fn seed_generator(&self) -> SeedGenerator {
        SeedGenerator::new(self.seeds.clone())
    }
}

/// Tunable thresholds for the pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub certification: CertificationPolicy,
    pub hydration: HydrationThresholds,
    pub growth: GrowthSettings,
    pub metrics: MetricsConfig,
    pub calibration: CalibrationPolicy,
}

impl PipelineSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(text).context("parsing pipeline settings")?;
        settings.finish()
    }

    /// Reads `certification.yaml`; a missing file means defaults.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(CERTIFICATION_FILE);
        if !path.exists() {
            warn!(path = %path.display(), "no certification settings found; using defaults");
            return Self::default().finish();
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        settings
            .finish()
            .with_context(|| format!("validating {}", path.display()))
    }

    fn finish(mut self) -> Result<Self> {
        self.validate()?;
        // Partial-quality flag follows the lite certification minimum.
        self.metrics.min_valid_keywords = self.certification.lite.min_valid_keywords_total;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        self.certification
            .lite_is_looser()
            .map_err(CatalogError::ThresholdOrder)?;
        if let CalibrationPolicy::Blend { alpha } = self.calibration {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(CatalogError::AlphaOutOfRange(alpha));
            }
        }
        Ok(())
    }
}
