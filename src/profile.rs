use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
        }
    }

    pub fn knobs(self) -> Knobs {
        match self {
            QualityPreset::Low => Knobs {
                position_bits: 11,
                texture_quality: 60,
                simplify_ratio: None,
                simplify_error: None,
                lod_levels: 0,
            },
            QualityPreset::Medium => Knobs {
                position_bits: 14,
                texture_quality: 80,
                simplify_ratio: Some(Ratio::clamped(0.5)),
                simplify_error: Some(Ratio::clamped(0.01)),
                lod_levels: 2,
            },
            QualityPreset::High => Knobs {
                position_bits: 16,
                texture_quality: 92,
                simplify_ratio: Some(Ratio::clamped(0.75)),
                simplify_error: Some(Ratio::clamped(0.001)),
                lod_levels: 3,
            },
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fraction in `0.0..=1.0`, the only non-integer value a tool argument may carry.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    pub(crate) fn clamped(value: f64) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self(1.0)
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Fixed-precision rendering so argument vectors are reproducible.
    pub fn render(self) -> String {
        format!("{:.4}", self.0)
    }
}

/// Tool tuning derived from the preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Knobs {
    pub position_bits: u32,
    pub texture_quality: u32,
    pub simplify_ratio: Option<Ratio>,
    pub simplify_error: Option<Ratio>,
    pub lod_levels: u32,
}

impl Knobs {
    /// Ratios for LOD level 1..=n: 1/2, 1/4, 1/8, ...
    pub fn lod_ratios(&self) -> Vec<Ratio> {
        (1..=self.lod_levels)
            .map(|level| Ratio::clamped(0.5f64.powi(level as i32)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "enabled")]
    pub lod: bool,
    #[serde(default = "enabled")]
    pub simplification: bool,
    #[serde(default = "enabled")]
    pub texture_compression: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl FeatureFlags {
    pub fn all() -> Self {
        Self {
            lod: true,
            simplification: true,
            texture_compression: true,
        }
    }

    pub fn none() -> Self {
        Self {
            lod: false,
            simplification: false,
            texture_compression: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Geometry,
    Texture,
    Simplification,
    Lod,
    Packaging,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Geometry,
        StageKind::Texture,
        StageKind::Simplification,
        StageKind::Lod,
        StageKind::Packaging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Geometry => "geometry",
            StageKind::Texture => "texture",
            StageKind::Simplification => "simplification",
            StageKind::Lod => "lod",
            StageKind::Packaging => "packaging",
        }
    }

    /// Critical stages abort the run on failure; the rest may pass through.
    pub fn is_critical(self) -> bool {
        matches!(self, StageKind::Geometry | StageKind::Packaging)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preset plus feature flags; fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityProfile {
    #[serde(default)]
    pub preset: QualityPreset,
    #[serde(flatten)]
    pub features: FeatureFlags,
}

impl QualityProfile {
    pub fn new(preset: QualityPreset, features: FeatureFlags) -> Self {
        Self { preset, features }
    }

    pub fn knobs(&self) -> Knobs {
        self.preset.knobs()
    }

    pub fn stage_enabled(&self, kind: StageKind) -> bool {
        let knobs = self.knobs();
        match kind {
            StageKind::Geometry | StageKind::Packaging => true,
            StageKind::Texture => self.features.texture_compression,
            StageKind::Simplification => {
                self.features.simplification && knobs.simplify_ratio.is_some()
            }
            StageKind::Lod => self.features.lod && knobs.lod_levels > 0,
        }
    }

    pub fn enabled_stages(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.stage_enabled(*kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_preset_skips_simplification_and_lod() {
        let profile = QualityProfile::new(QualityPreset::Low, FeatureFlags::all());
        assert_eq!(
            profile.enabled_stages(),
            vec![StageKind::Geometry, StageKind::Texture, StageKind::Packaging]
        );
    }

    #[test]
    fn high_preset_with_all_features_runs_every_stage() {
        let profile = QualityProfile::new(QualityPreset::High, FeatureFlags::all());
        assert_eq!(profile.enabled_stages(), StageKind::ALL.to_vec());
        assert_eq!(profile.knobs().lod_ratios().len(), 3);
    }

    #[test]
    fn flags_gate_optional_stages() {
        let profile = QualityProfile::new(QualityPreset::High, FeatureFlags::none());
        assert_eq!(
            profile.enabled_stages(),
            vec![StageKind::Geometry, StageKind::Packaging]
        );
    }

    #[test]
    fn ratio_rejects_out_of_range_values() {
        assert!(Ratio::new(1.5).is_none());
        assert!(Ratio::new(f64::NAN).is_none());
        assert_eq!(Ratio::new(0.25).unwrap().render(), "0.2500");
    }

    #[test]
    fn profile_deserializes_from_yaml() {
        let profile: QualityProfile =
            serde_yaml::from_str("preset: low\nlod: false\n").unwrap();
        assert_eq!(profile.preset, QualityPreset::Low);
        assert!(!profile.features.lod);
        assert!(profile.features.texture_compression);
    }

    #[test]
    fn omitted_preset_is_medium() {
        assert_eq!(QualityPreset::default(), QualityPreset::Medium);
        let profile: QualityProfile = serde_yaml::from_str("lod: false\n").unwrap();
        assert_eq!(profile.preset, QualityPreset::Medium);
        assert_eq!(profile.knobs().position_bits, 14);
    }
}
