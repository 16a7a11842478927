use std::path::{Component, Path};

use serde::Serialize;

use crate::manifest::{MANIFEST_VERSION, Manifest};
use crate::profile::{QualityPreset, StageKind};
use crate::sandbox::ToolPath;
use crate::scheduler::host_parallelism;

/// Variables the sandbox always sets itself; passing them through would override that.
const RESERVED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "TMPDIR",
    "LANG",
    "LC_ALL",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_manifest(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != MANIFEST_VERSION {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }

    report.merge(validate_inputs(manifest));
    report.merge(validate_directories(manifest));
    report.merge(validate_tools(manifest));
    report.merge(validate_limits(manifest));
    report.merge(validate_env(&manifest.env_passthrough));
    report.merge(validate_profile(manifest));

    report
}

fn escapes(path: &Path) -> bool {
    path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::RootDir))
}

fn validate_inputs(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    if manifest.inputs.is_empty() {
        report
            .errors
            .push("At least one input pattern is required".into());
    }
    for (idx, input) in manifest.inputs.iter().enumerate() {
        if input.path.trim().is_empty() {
            report
                .errors
                .push("Input path patterns cannot be empty".into());
            continue;
        }
        if let Err(err) = glob::Pattern::new(&input.path) {
            report.errors.push(format!(
                "Input pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                input.path,
                err
            ));
        }
        if escapes(Path::new(&input.path)) {
            report.errors.push(format!(
                "Input pattern {} ('{}') must stay inside input_dir",
                idx + 1,
                input.path
            ));
        }
    }
    report
}

fn validate_directories(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    if !manifest.input_dir.is_dir() {
        report.errors.push(format!(
            "Input directory does not exist: {}",
            manifest.input_dir.display()
        ));
    }
    if manifest.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    } else if same_dir(&manifest.output.directory, &manifest.input_dir) {
        report
            .errors
            .push("Output directory must differ from the input directory".into());
    }
    if same_dir(&manifest.work_dir, &manifest.output.directory) {
        report
            .errors
            .push("Work directory must differ from the output directory".into());
    }

    let structure = &manifest.output.structure;
    if structure.trim().is_empty() {
        report
            .errors
            .push("Output structure cannot be empty".into());
    } else {
        if escapes(Path::new(structure)) {
            report.errors.push(format!(
                "Output structure '{structure}' must stay inside the output directory"
            ));
        }
        if !structure.contains("{stem}") {
            report.warnings.push(format!(
                "Output structure '{structure}' has no {{stem}}; multiple inputs will overwrite each other"
            ));
        }
        if !structure.ends_with(".glb") {
            report
                .warnings
                .push(format!("Output structure '{structure}' does not end in .glb"));
        }
    }
    report
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn validate_tools(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    let texture_enabled = manifest.profile.stage_enabled(StageKind::Texture);
    for (label, path, required) in [
        ("gltf_transform", &manifest.tools.gltf_transform, true),
        ("magick", &manifest.tools.magick, texture_enabled),
    ] {
        if let Err(err) = ToolPath::new(path) {
            let message = format!("Tool '{label}' ({}) is unusable: {err}", path.display());
            if required {
                report.errors.push(message);
            } else {
                report.warnings.push(message);
            }
        }
    }
    report
}

fn validate_limits(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    let limits = &manifest.limits;
    if limits.stage_timeout_secs == 0 || limits.texture_timeout_secs == 0 {
        report
            .errors
            .push("Stage and texture timeouts must be greater than zero".into());
    }
    if limits.max_output_mb == 0 {
        report
            .errors
            .push("max_output_mb must be greater than zero".into());
    }
    if limits.max_concurrency == 0 {
        report
            .errors
            .push("max_concurrency must be at least 1".into());
    } else if limits.max_concurrency > host_parallelism() {
        report.warnings.push(format!(
            "max_concurrency {} exceeds available cores ({}); it will be clamped",
            limits.max_concurrency,
            host_parallelism()
        ));
    }
    if limits.memory_mb == 0 {
        report
            .warnings
            .push("memory_mb is 0; tools run without an address-space ceiling".into());
    }
    report
}

fn validate_env(names: &[String]) -> ValidationReport {
    let mut report = ValidationReport::default();
    for name in names {
        let mut chars = name.chars();
        let well_formed = chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            report
                .errors
                .push(format!("env_passthrough entry '{name}' is not a variable name"));
        } else if RESERVED_ENV.contains(&name.as_str()) {
            report.errors.push(format!(
                "env_passthrough entry '{name}' is controlled by the sandbox"
            ));
        }
    }
    report
}

fn validate_profile(manifest: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    let profile = &manifest.profile;
    if profile.preset == QualityPreset::Low
        && (profile.features.lod || profile.features.simplification)
    {
        report
            .warnings
            .push("Preset 'low' skips simplification and LOD regardless of flags".into());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_are_checked() {
        let report = validate_env(&[
            "AWS_REGION".into(),
            "1BAD".into(),
            "LD_PRELOAD".into(),
            "A-B".into(),
        ]);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn escaping_patterns_are_detected() {
        assert!(escapes(Path::new("../*.glb")));
        assert!(escapes(Path::new("/abs/*.glb")));
        assert!(!escapes(Path::new("nested/**/*.glb")));
    }
}
