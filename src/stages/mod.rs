use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, StageError};
use crate::glb::{self, SizeBounds};
use crate::guard::{EntryClass, GuardedPath, PathGuard};
use crate::pipeline::{
    FallbackPolicy, Limits, SizeDecision, SizePolicy, StageMethod, StageResult, ToolSet,
};
use crate::profile::{Knobs, StageKind};
use crate::sandbox::{ArgToken, Sandbox, StageSpec, ToolPath};
use crate::scheduler::ParallelCompressionScheduler;

mod geometry;
mod lod;
mod packaging;
mod texture;

pub use geometry::{GeometryStage, SimplificationStage};
pub use lod::LodStage;
pub use packaging::PackagingStage;
pub use texture::TextureStage;

/// Everything a stage may touch during one run.
pub struct StageContext<'a> {
    pub run_id: &'a str,
    pub index: usize,
    pub knobs: Knobs,
    pub input: &'a GuardedPath,
    pub original: &'a GuardedPath,
    pub workdir: &'a PathGuard,
    pub tools: &'a ToolSet,
    pub limits: &'a Limits,
    pub sandbox: &'a Sandbox,
    pub scheduler: &'a ParallelCompressionScheduler,
    pub fallback: FallbackPolicy,
    pub size_policy: SizePolicy,
    pub bounds: SizeBounds,
    pub cancel: &'a CancellationToken,
}

impl StageContext<'_> {
    /// Run-unique file name for an intermediate produced by this stage.
    pub fn scratch_name(&self, kind: StageKind, suffix: &str) -> String {
        format!("{:02}-{}{}", self.index + 1, kind.as_str(), suffix)
    }

    /// Fresh, guarded output path that must not exist yet.
    pub fn new_output(&self, name: &str) -> Result<GuardedPath, StageError> {
        let output = self.workdir.resolve_new(name)?;
        if output.class() != EntryClass::Missing {
            return Err(StageError::new(
                ErrorKind::PathViolation,
                format!("intermediate '{name}' already exists"),
            ));
        }
        Ok(output)
    }

    /// Private subdirectory used as HOME/TMPDIR for one invocation.
    pub fn task_dir(&self, name: &str) -> Result<GuardedPath, StageError> {
        let dir = self.new_output(name)?;
        fs::create_dir(dir.as_path())?;
        Ok(self.workdir.resolve(name)?)
    }

    pub fn spec(
        &self,
        name: impl Into<String>,
        program: &ToolPath,
        args: Vec<ArgToken>,
        timeout: Duration,
    ) -> StageSpec {
        StageSpec::new(name, program.clone(), args)
            .with_timeout(timeout)
            .with_limits(self.limits.resources)
    }

    pub fn input_size(&self) -> u64 {
        fs::metadata(self.input.as_path())
            .map(|meta| meta.len())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LodArtifact {
    pub level: u32,
    pub path: GuardedPath,
}

/// Stage result plus whatever the stage hands to the next one.
#[derive(Debug)]
pub struct StageOutput {
    pub result: StageResult,
    /// New intermediate; `None` carries the input forward.
    pub output: Option<GuardedPath>,
    pub lods: Vec<LodArtifact>,
    pub size_decision: Option<SizeDecision>,
}

impl StageOutput {
    pub fn new(result: StageResult) -> Self {
        Self {
            result,
            output: None,
            lods: Vec::new(),
            size_decision: None,
        }
    }

    pub fn with_output(mut self, output: GuardedPath) -> Self {
        self.output = Some(output);
        self
    }

    pub fn failed(kind: StageKind, started: Instant, input_size: u64, error: StageError) -> Self {
        Self::new(StageResult::failure(
            kind.as_str(),
            started.elapsed(),
            input_size,
            error,
        ))
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    fn describe(&self) -> &'static str;
    fn run(&self, ctx: &StageContext<'_>) -> StageOutput;
}

#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: impl Stage + 'static) {
        self.stages.insert(stage.kind(), Arc::new(stage));
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    /// Registered stages in execution order.
    pub fn known_stages(&self) -> Vec<(StageKind, &'static str)> {
        StageKind::ALL
            .into_iter()
            .filter_map(|kind| self.stages.get(&kind).map(|stage| (kind, stage.describe())))
            .collect()
    }
}

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register(GeometryStage);
    registry.register(TextureStage);
    registry.register(SimplificationStage);
    registry.register(LodStage);
    registry.register(PackagingStage);
}

/// Single-invocation stages: run the tool, then require a structurally valid GLB.
fn run_tool(
    ctx: &StageContext<'_>,
    kind: StageKind,
    program: &ToolPath,
    args: Vec<ArgToken>,
) -> StageOutput {
    let started = Instant::now();
    let input_size = ctx.input_size();
    let output = match ctx.new_output(&ctx.scratch_name(kind, ".glb")) {
        Ok(output) => output,
        Err(error) => return StageOutput::failed(kind, started, input_size, error),
    };
    let spec = ctx.spec(kind.as_str(), program, args, ctx.limits.stage_timeout);
    let result = ctx
        .sandbox
        .run(&spec, ctx.input, &output, ctx.workdir.root(), ctx.cancel);
    if !result.success {
        return StageOutput::new(result);
    }
    if let Err(err) = glb::validate_file(output.as_path(), ctx.bounds) {
        let result = StageResult {
            success: false,
            error: Some(StageError::new(
                ErrorKind::InvalidOutput,
                format!("{} produced an invalid GLB: {err}", kind.as_str()),
            )),
            ..result
        };
        return StageOutput::new(result);
    }
    StageOutput::new(result).with_output(output)
}

/// Apply the degraded-result policy to a finished batch.
///
/// Returns the stage-level method, or the error that fails the stage.
fn settle_batch(
    subtasks: &[StageResult],
    fallback: FallbackPolicy,
) -> Result<StageMethod, StageError> {
    let failures: Vec<&StageError> = subtasks
        .iter()
        .filter(|task| !task.success)
        .filter_map(|task| task.error.as_ref())
        .collect();
    if let Some(fatal) = failures.iter().find(|error| error.kind.always_fatal()) {
        return Err((*fatal).clone());
    }
    match failures.first() {
        None => Ok(StageMethod::Batch),
        Some(first) if fallback == FallbackPolicy::Fail => Err(StageError::new(
            first.kind,
            format!(
                "{} of {} sub-tasks failed; first: {}",
                failures.len(),
                subtasks.len(),
                first.detail
            ),
        )),
        Some(_) if failures.len() == subtasks.len() => Ok(StageMethod::Passthrough),
        Some(_) => Ok(StageMethod::Partial),
    }
}

fn first_error(subtasks: &[StageResult]) -> Option<StageError> {
    subtasks
        .iter()
        .find(|task| !task.success)
        .and_then(|task| task.error.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str) -> StageResult {
        StageResult::success(name, StageMethod::Tool, Duration::ZERO, 10, 5)
    }

    fn err(name: &str, kind: ErrorKind) -> StageResult {
        StageResult::failure(name, Duration::ZERO, 10, StageError::new(kind, "boom"))
    }

    #[test]
    fn clean_batch_is_batch() {
        let tasks = [ok("a"), ok("b")];
        assert_eq!(
            settle_batch(&tasks, FallbackPolicy::Passthrough),
            Ok(StageMethod::Batch)
        );
    }

    #[test]
    fn partial_failure_follows_policy() {
        let tasks = [ok("a"), err("b", ErrorKind::ProcessFailure), ok("c")];
        assert_eq!(
            settle_batch(&tasks, FallbackPolicy::Passthrough),
            Ok(StageMethod::Partial)
        );
        let failed = settle_batch(&tasks, FallbackPolicy::Fail).unwrap_err();
        assert_eq!(failed.kind, ErrorKind::ProcessFailure);
        assert!(failed.detail.starts_with("1 of 3"));
    }

    #[test]
    fn total_failure_is_passthrough() {
        let tasks = [err("a", ErrorKind::ProcessTimeout)];
        assert_eq!(
            settle_batch(&tasks, FallbackPolicy::Passthrough),
            Ok(StageMethod::Passthrough)
        );
    }

    #[test]
    fn fatal_kinds_ignore_policy() {
        let tasks = [ok("a"), err("b", ErrorKind::ResourceExceeded)];
        let error = settle_batch(&tasks, FallbackPolicy::Passthrough).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ResourceExceeded);
    }

    #[test]
    fn defaults_cover_every_stage() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry);
        let kinds: Vec<_> = registry.known_stages().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
    }
}
