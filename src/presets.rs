use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::manifest::{
    InputSpec, LimitsSpec, MANIFEST_VERSION, Manifest, OutputSpec, PolicySpec, ToolsSpec,
};
use crate::pipeline::{FallbackPolicy, SizePolicy};
use crate::profile::{FeatureFlags, QualityPreset, QualityProfile};

/// Starter manifest tuned for `preset`.
pub fn preset_manifest(preset: QualityPreset) -> Manifest {
    let (limits, policy) = match preset {
        QualityPreset::Low => (
            LimitsSpec {
                stage_timeout_secs: 120,
                texture_timeout_secs: 30,
                memory_mb: 1024,
                cpu_secs: 240,
                ..LimitsSpec::default()
            },
            PolicySpec {
                size: SizePolicy::FallbackToOriginal,
                fallback: FallbackPolicy::Passthrough,
            },
        ),
        QualityPreset::Medium => (LimitsSpec::default(), PolicySpec::default()),
        QualityPreset::High => (
            LimitsSpec {
                stage_timeout_secs: 600,
                texture_timeout_secs: 120,
                memory_mb: 4096,
                cpu_secs: 1200,
                ..LimitsSpec::default()
            },
            PolicySpec {
                size: SizePolicy::FallbackToOriginal,
                fallback: FallbackPolicy::Fail,
            },
        ),
    };
    let features = match preset {
        QualityPreset::Low => FeatureFlags {
            lod: false,
            simplification: false,
            texture_compression: true,
        },
        _ => FeatureFlags::all(),
    };

    Manifest {
        version: MANIFEST_VERSION,
        input_dir: PathBuf::from("./incoming"),
        inputs: vec![InputSpec {
            path: "**/*.glb".into(),
        }],
        output: OutputSpec {
            directory: PathBuf::from(format!("./published/{preset}")),
            structure: "{stem}.min.glb".into(),
        },
        work_dir: PathBuf::from("./work"),
        profile: QualityProfile::new(preset, features),
        tools: ToolsSpec {
            gltf_transform: PathBuf::from("/usr/local/bin/gltf-transform"),
            magick: PathBuf::from("/usr/bin/magick"),
        },
        limits,
        policy,
        env_passthrough: Vec::new(),
    }
}

pub fn generate_manifest(preset: QualityPreset, destination: &Path) -> Result<PathBuf> {
    let rendered = serde_yaml::to_string(&preset_manifest(preset))?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write manifest: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}
