//! Reference profiles
//!
//! Genre profiles are bundled TOML, parsed once. A reference profile can also be derived
//! from a captured report, in which case the report's own measurements become the targets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::report::TechnicalReport;
use crate::pipeline::spectral::Band;

const GENRES_TOML: &str = include_str!("../../profiles/genres.toml");

pub const DEFAULT_GENRE: &str = "default";

/// Tolerances applied to a profile captured from a reference report
pub const REFERENCE_LUFS_TOLERANCE: f64 = 1.0;
pub const REFERENCE_TRUE_PEAK_TOLERANCE: f64 = 0.3;
pub const REFERENCE_DR_TOLERANCE: f64 = 1.5;
pub const REFERENCE_LRA_TOLERANCE: f64 = 2.0;
pub const REFERENCE_CORRELATION_TOLERANCE: f64 = 0.1;
pub const REFERENCE_BAND_TOLERANCE: f64 = 2.0;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown genre profile '{0}'")]
    UnknownGenre(String),

    #[error("bundled genre profiles are invalid: {0}")]
    Parse(String),

    #[error("reference report has no usable measurements")]
    EmptyReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub target: f64,
    pub tolerance: f64,
}

impl Target {
    pub fn new(target: f64, tolerance: f64) -> Self {
        Self { target, tolerance }
    }
}

/// Per-metric and per-band targets. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub lufs: Option<Target>,
    /// Upper bound: measurements below the target are never penalized
    #[serde(default)]
    pub true_peak: Option<Target>,
    #[serde(default)]
    pub dynamic_range: Option<Target>,
    #[serde(default)]
    pub lra: Option<Target>,
    #[serde(default)]
    pub stereo_correlation: Option<Target>,
    #[serde(default)]
    pub bands: BTreeMap<Band, Target>,
}

fn catalog() -> &'static Result<BTreeMap<String, ReferenceProfile>, String> {
    static CATALOG: OnceLock<Result<BTreeMap<String, ReferenceProfile>, String>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        #[derive(Deserialize)]
        struct Entry {
            #[serde(default)]
            display_name: Option<String>,
            #[serde(default)]
            lufs: Option<Target>,
            #[serde(default)]
            true_peak: Option<Target>,
            #[serde(default)]
            dynamic_range: Option<Target>,
            #[serde(default)]
            lra: Option<Target>,
            #[serde(default)]
            stereo_correlation: Option<Target>,
            #[serde(default)]
            bands: BTreeMap<String, Target>,
        }

        let entries: BTreeMap<String, Entry> =
            toml::from_str(GENRES_TOML).map_err(|e| e.to_string())?;
        entries
            .into_iter()
            .map(|(name, e)| {
                let bands = e
                    .bands
                    .into_iter()
                    .map(|(key, target)| {
                        Band::from_key(&key)
                            .map(|band| (band, target))
                            .ok_or_else(|| format!("profile '{}': unknown band '{}'", name, key))
                    })
                    .collect::<Result<BTreeMap<Band, Target>, String>>()?;
                let profile = ReferenceProfile {
                    name: name.clone(),
                    display_name: e.display_name,
                    lufs: e.lufs,
                    true_peak: e.true_peak,
                    dynamic_range: e.dynamic_range,
                    lra: e.lra,
                    stereo_correlation: e.stereo_correlation,
                    bands,
                };
                Ok((name, profile))
            })
            .collect()
    })
}

impl ReferenceProfile {
    /// Bundled genre profile by key
    pub fn genre(key: &str) -> Result<Self, ProfileError> {
        let profiles = catalog().as_ref().map_err(|e| ProfileError::Parse(e.clone()))?;
        profiles
            .get(key)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownGenre(key.to_string()))
    }

    pub fn genre_keys() -> Vec<String> {
        match catalog() {
            Ok(profiles) => profiles.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Targets taken from a captured reference report
    pub fn from_report(name: impl Into<String>, report: &TechnicalReport) -> Result<Self, ProfileError> {
        let with = |value: Option<f64>, tolerance: f64| value.map(|v| Target::new(v, tolerance));

        let bands: BTreeMap<Band, Target> = report
            .spectral
            .bands
            .iter()
            .filter_map(|b| b.energy_db.map(|db| (b.band, Target::new(db, REFERENCE_BAND_TOLERANCE))))
            .collect();

        let profile = Self {
            name: name.into(),
            display_name: report.file.display_name.clone(),
            lufs: with(report.loudness.integrated_lufs, REFERENCE_LUFS_TOLERANCE),
            true_peak: with(report.true_peak.max_dbtp, REFERENCE_TRUE_PEAK_TOLERANCE),
            dynamic_range: with(
                report.dynamics.as_ref().and_then(|d| d.dynamic_range_db),
                REFERENCE_DR_TOLERANCE,
            ),
            lra: with(report.loudness.lra_lu, REFERENCE_LRA_TOLERANCE),
            stereo_correlation: with(
                report.stereo.as_ref().and_then(|s| s.correlation),
                REFERENCE_CORRELATION_TOLERANCE,
            ),
            bands,
        };

        if profile.lufs.is_none() && profile.true_peak.is_none() && profile.bands.is_empty() {
            return Err(ProfileError::EmptyReference);
        }
        Ok(profile)
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_genres_parse_and_cover_all_bands() {
        let keys = ReferenceProfile::genre_keys();
        for expected in [
            "default",
            "funk_automotivo",
            "eletrofunk",
            "tech_house",
            "techno",
            "house",
            "trap",
            "trance",
            "phonk",
        ] {
            assert!(keys.iter().any(|k| k == expected), "missing {}", expected);
        }

        for key in keys {
            let profile = ReferenceProfile::genre(&key).unwrap();
            assert_eq!(profile.bands.len(), Band::ALL.len(), "{}", key);
            assert!(profile.lufs.is_some());
            assert!(profile.bands.values().all(|t| t.tolerance > 0.0));
        }
    }

    #[test]
    fn test_unknown_genre() {
        assert!(matches!(
            ReferenceProfile::genre("polka"),
            Err(ProfileError::UnknownGenre(_))
        ));
    }
}
