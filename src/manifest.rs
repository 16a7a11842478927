use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::pipeline::{
    FallbackPolicy, Limits, PipelineConfig, SizePolicy, ToolSet, default_output_structure,
};
use crate::profile::QualityProfile;
use crate::sandbox::{EnvPolicy, ResourceLimits, ToolPath};

pub const MANIFEST_VERSION: u32 = 1;

/// YAML job description: where inputs come from, how they are processed, where results go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    pub inputs: Vec<InputSpec>,
    pub output: OutputSpec,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub profile: QualityProfile,
    pub tools: ToolsSpec,
    #[serde(default)]
    pub limits: LimitsSpec,
    #[serde(default)]
    pub policy: PolicySpec,
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
    #[serde(default = "default_output_structure")]
    pub structure: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSpec {
    pub gltf_transform: PathBuf,
    pub magick: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSpec {
    pub stage_timeout_secs: u64,
    pub texture_timeout_secs: u64,
    /// `0` leaves the address space unlimited.
    pub memory_mb: u64,
    /// `0` leaves CPU time unlimited.
    pub cpu_secs: u64,
    pub max_output_mb: u64,
    pub max_concurrency: usize,
}

impl Default for LimitsSpec {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 300,
            texture_timeout_secs: 60,
            memory_mb: 2048,
            cpu_secs: 600,
            max_output_mb: 512,
            max_concurrency: 4,
        }
    }
}

impl LimitsSpec {
    pub fn to_limits(&self) -> Limits {
        const MIB: u64 = 1024 * 1024;
        Limits {
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            texture_timeout: Duration::from_secs(self.texture_timeout_secs),
            resources: ResourceLimits {
                memory_bytes: (self.memory_mb > 0).then(|| self.memory_mb.saturating_mul(MIB)),
                cpu_seconds: (self.cpu_secs > 0).then_some(self.cpu_secs),
                max_output_bytes: self.max_output_mb.saturating_mul(MIB),
            },
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    pub size: SizePolicy,
    pub fallback: FallbackPolicy,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("bunker-mesh")
}

impl Manifest {
    /// Load and parse `path`; relative directories are anchored at the manifest's folder.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        let mut manifest: Manifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))?;
        if let Some(base) = path.parent() {
            manifest.anchor(base);
        }
        Ok(manifest)
    }

    fn anchor(&mut self, base: &Path) {
        let anchor = |dir: &mut PathBuf| {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        };
        anchor(&mut self.input_dir);
        anchor(&mut self.output.directory);
        anchor(&mut self.work_dir);
    }

    /// Input names relative to `input_dir`, in glob order, without duplicates.
    pub fn expand_inputs(&self) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        for input in &self.inputs {
            let pattern = self.input_dir.join(&input.path);
            let pattern = pattern.to_string_lossy();
            let matches =
                glob(&pattern).with_context(|| format!("Invalid glob pattern: {}", input.path))?;
            let mut found = false;
            for entry in matches {
                let path = entry?;
                if !path.is_file() {
                    continue;
                }
                let relative = path.strip_prefix(&self.input_dir).with_context(|| {
                    format!("Input '{}' is outside the input directory", path.display())
                })?;
                let name = relative.to_string_lossy().into_owned();
                found = true;
                if !resolved.contains(&name) {
                    resolved.push(name);
                }
            }
            if !found {
                bail!("No inputs matched pattern: {}", input.path);
            }
        }
        Ok(resolved)
    }

    pub fn into_config(&self) -> Result<PipelineConfig> {
        let tools = ToolSet {
            gltf_transform: ToolPath::new(&self.tools.gltf_transform).with_context(|| {
                format!("Invalid gltf-transform tool: {}", self.tools.gltf_transform.display())
            })?,
            magick: ToolPath::new(&self.tools.magick)
                .with_context(|| format!("Invalid magick tool: {}", self.tools.magick.display()))?,
        };
        let mut config = PipelineConfig::new(
            &self.input_dir,
            &self.output.directory,
            &self.work_dir,
            tools,
        );
        config.output_structure = self.output.structure.clone();
        config.limits = self.limits.to_limits();
        config.size_policy = self.policy.size;
        config.fallback_policy = self.policy.fallback;
        config.env = EnvPolicy::default().with_passthrough(self.env_passthrough.iter().cloned());
        Ok(config)
    }
}
