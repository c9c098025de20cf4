//! Per-model output profiles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// How a model's token rate typically behaves over a response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateProfile {
    /// Roughly constant rate, no special handling
    #[default]
    Steady,
    /// Fast early output, usually short responses
    Burst,
    /// Slow, very even output
    Gradual,
}

/// Typical response shape for one model family
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Mean response length in tokens
    pub avg_tokens: u64,
    /// Typical deviation from `avg_tokens`
    #[serde(default)]
    pub variance: u64,
    /// Rate behavior
    #[serde(default)]
    pub rate_profile: RateProfile,
}

impl ModelProfile {
    /// Create a profile
    #[must_use]
    pub fn new(avg_tokens: u64, variance: u64, rate_profile: RateProfile) -> Self {
        Self {
            avg_tokens,
            variance,
            rate_profile,
        }
    }

    /// Check the profile is usable as an estimate seed
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if `avg_tokens` is zero.
    pub fn validate(&self, model: &str) -> Result<(), ConfigError> {
        if self.avg_tokens == 0 {
            return Err(ConfigError::ValidationError(format!(
                "estimator.profiles.{model}.avg_tokens must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Lookup table from model name to [`ModelProfile`]
///
/// A model matches its exact key first, then the longest key it starts with,
/// so `gpt-4o-mini` falls under a `gpt-4` entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelProfiles {
    profiles: HashMap<String, ModelProfile>,
}

impl ModelProfiles {
    /// An empty table
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The table shipped with the crate
    #[must_use]
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.insert("gpt-4", ModelProfile::new(800, 300, RateProfile::Gradual));
        table.insert("gpt-3.5", ModelProfile::new(400, 150, RateProfile::Burst));
        table.insert("claude", ModelProfile::new(1000, 400, RateProfile::Steady));
        table.insert("llama", ModelProfile::new(600, 250, RateProfile::Steady));
        table.insert("mistral", ModelProfile::new(500, 200, RateProfile::Burst));
        table.insert("qwen", ModelProfile::new(700, 300, RateProfile::Gradual));
        table
    }

    /// Add or replace a profile
    pub fn insert(&mut self, model: impl Into<String>, profile: ModelProfile) {
        self.profiles.insert(model.into(), profile);
    }

    /// Add or replace every profile from `other`
    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, ModelProfile)>) {
        self.profiles.extend(other);
    }

    /// Find the profile for `model`
    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelProfile> {
        if let Some(profile) = self.profiles.get(model) {
            return Some(profile);
        }
        self.profiles
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, profile)| profile)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Validate every entry
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::ValidationError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.profiles
            .iter()
            .try_for_each(|(model, profile)| profile.validate(model))
    }
}
