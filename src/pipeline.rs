use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug_span, info, info_span, warn};

use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, PipelineError, PublishError, StageError};
use crate::glb::{self, SizeBounds};
use crate::guard::{GuardedPath, PathGuard};
use crate::observability::MetricsCollector;
use crate::profile::{QualityProfile, StageKind};
use crate::publish::{AtomicPublisher, PublishedArtifact, RevertibleCommit};
use crate::sandbox::{EnvPolicy, ResourceLimits, Sandbox, ToolPath};
use crate::scheduler::ParallelCompressionScheduler;
use crate::stages::{LodArtifact, StageContext, StageOutput, StageRegistry};

const INPUT_NAME: &str = "input.glb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMethod {
    Tool,
    Batch,
    Partial,
    Passthrough,
    Original,
    Validated,
}

/// Immutable record of one stage (or one sub-task of a batch stage).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub success: bool,
    pub method: StageMethod,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub input_size: u64,
    pub output_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1_000.0)
}

impl StageResult {
    pub fn success(
        stage: impl Into<String>,
        method: StageMethod,
        duration: Duration,
        input_size: u64,
        output_size: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            success: true,
            method,
            duration,
            input_size,
            output_size,
            error: None,
            note: None,
            subtasks: Vec::new(),
            exit_code: None,
        }
    }

    pub fn failure(
        stage: impl Into<String>,
        duration: Duration,
        input_size: u64,
        error: StageError,
    ) -> Self {
        Self {
            stage: stage.into(),
            success: false,
            method: StageMethod::Tool,
            duration,
            input_size,
            output_size: 0,
            error: Some(error),
            note: None,
            subtasks: Vec::new(),
            exit_code: None,
        }
    }

    pub fn with_method(mut self, method: StageMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_error(mut self, error: StageError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<StageResult>) -> Self {
        self.subtasks = subtasks;
        self
    }

    /// The stage failed but the run continues with the stage's input.
    pub fn into_passthrough(self) -> Self {
        Self {
            success: true,
            method: StageMethod::Passthrough,
            output_size: self.input_size,
            note: Some("previous output carried forward".into()),
            ..self
        }
    }

    /// True when this result or one of its sub-tasks fell back.
    pub fn is_degraded(&self) -> bool {
        self.method == StageMethod::Passthrough || self.subtasks.iter().any(|task| !task.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizePolicy {
    PublishAnyway,
    #[default]
    FallbackToOriginal,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    #[default]
    Passthrough,
    Fail,
}

/// What packaging decided after comparing the result with the original input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeDecision {
    /// The result is no larger than the original.
    Smaller,
    KeptLarger,
    FellBackToOriginal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Validating,
    Geometry,
    Texture,
    Simplification,
    Lod,
    Packaging,
    Publishing,
    Published,
    Failed,
}

impl RunState {
    fn rank(self) -> u8 {
        match self {
            RunState::Created => 0,
            RunState::Validating => 1,
            RunState::Geometry => 2,
            RunState::Texture => 3,
            RunState::Simplification => 4,
            RunState::Lod => 5,
            RunState::Packaging => 6,
            RunState::Publishing => 7,
            RunState::Published => 8,
            RunState::Failed => 9,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Published | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunState::Failed => true,
            RunState::Created => false,
            RunState::Validating => self == RunState::Created,
            RunState::Publishing => self == RunState::Packaging,
            RunState::Published => self == RunState::Publishing,
            _ => self != RunState::Created && next.rank() > self.rank(),
        }
    }
}

impl From<StageKind> for RunState {
    fn from(kind: StageKind) -> Self {
        match kind {
            StageKind::Geometry => RunState::Geometry,
            StageKind::Texture => RunState::Texture,
            StageKind::Simplification => RunState::Simplification,
            StageKind::Lod => RunState::Lod,
            StageKind::Packaging => RunState::Packaging,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunState::Created => "created",
            RunState::Validating => "validating",
            RunState::Geometry => "geometry",
            RunState::Texture => "texture",
            RunState::Simplification => "simplification",
            RunState::Lod => "lod",
            RunState::Packaging => "packaging",
            RunState::Publishing => "publishing",
            RunState::Published => "published",
            RunState::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal run state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub stage_index: usize,
    pub stage: String,
    pub percent: u8,
    pub message: String,
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Logs every progress event at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, event: &ProgressEvent) {
        info!(
            run_id = event.run_id.as_str(),
            stage_index = event.stage_index,
            stage = event.stage.as_str(),
            percent = event.percent,
            "{}",
            event.message
        );
    }
}

/// Per-run mutable state, owned by whichever worker executes the run.
#[derive(Debug)]
pub struct PipelineRun {
    run_id: String,
    profile: QualityProfile,
    stem: String,
    workdir: TempDir,
    guard: PathGuard,
    original: GuardedPath,
    original_size: u64,
    current: GuardedPath,
    results: Vec<StageResult>,
    lods: Vec<LodArtifact>,
    size_decision: Option<SizeDecision>,
    degraded: bool,
    state: RunState,
    progress: u8,
}

impl PipelineRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn profile(&self) -> QualityProfile {
        self.profile
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    pub fn current(&self) -> &GuardedPath {
        &self.current
    }

    fn transition(&mut self, next: RunState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn record(&mut self, result: StageResult) {
        self.results.push(result);
    }

    /// Progress never moves backwards.
    fn advance(&mut self, percent: u8) -> u8 {
        self.progress = self.progress.max(percent.min(100));
        self.progress
    }
}

/// A validated, prepared run waiting for [`Pipeline::execute`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    run: PipelineRun,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        run_id: String,
        output_path: PathBuf,
        lod_paths: Vec<PathBuf>,
        stats: Vec<StageResult>,
        degraded: bool,
        size_decision: SizeDecision,
        sha256: String,
    },
    Failed {
        run_id: String,
        stage: String,
        kind: ErrorKind,
        detail: String,
        stats: Vec<StageResult>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Failed { run_id, .. } => run_id,
        }
    }

    pub fn stats(&self) -> &[StageResult] {
        match self {
            RunOutcome::Completed { stats, .. } | RunOutcome::Failed { stats, .. } => stats,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSet {
    pub gltf_transform: ToolPath,
    pub magick: ToolPath,
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub stage_timeout: Duration,
    pub texture_timeout: Duration,
    pub resources: ResourceLimits,
    pub max_concurrency: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            texture_timeout: Duration::from_secs(60),
            resources: ResourceLimits::default(),
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_structure: String,
    pub tools: ToolSet,
    pub limits: Limits,
    pub size_policy: SizePolicy,
    pub fallback_policy: FallbackPolicy,
    pub env: EnvPolicy,
}

impl PipelineConfig {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        tools: ToolSet,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            work_dir: work_dir.into(),
            output_structure: default_output_structure(),
            tools,
            limits: Limits::default(),
            size_policy: SizePolicy::default(),
            fallback_policy: FallbackPolicy::default(),
            env: EnvPolicy::default(),
        }
    }

    pub fn bounds(&self) -> SizeBounds {
        SizeBounds::with_max(self.limits.resources.max_output_bytes)
    }

    /// Final artifact name relative to the output directory.
    pub fn output_name(&self, stem: &str, profile: &QualityProfile) -> String {
        self.output_structure
            .replace("{stem}", stem)
            .replace("{preset}", profile.preset.as_str())
    }
}

pub fn default_output_structure() -> String {
    "{stem}.min.glb".to_string()
}

/// Undo LOD commits newest first, restoring whatever they replaced.
fn revert_all(committed: Vec<RevertibleCommit<'_>>) {
    for commit in committed.into_iter().rev() {
        let path = commit.artifact().path.clone();
        if let Err(err) = commit.revert() {
            warn!(path = %path.display(), error = %err, "Failed to restore previous artifact");
        }
    }
}

fn lod_name(final_name: &str, stem: &str, level: u32) -> String {
    let file = format!("{stem}.lod{level}.glb");
    match Path::new(final_name).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(file).to_string_lossy().into_owned()
        }
        _ => file,
    }
}

fn next_run_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

struct Failure {
    stage: String,
    error: StageError,
}

impl Failure {
    fn new(stage: impl Into<String>, error: impl Into<StageError>) -> Self {
        Self {
            stage: stage.into(),
            error: error.into(),
        }
    }
}

/// Shared, thread-safe stage sequencer. One instance serves many runs.
pub struct Pipeline {
    config: PipelineConfig,
    input_guard: PathGuard,
    work_root: PathBuf,
    publisher: AtomicPublisher,
    sandbox: Sandbox,
    scheduler: ParallelCompressionScheduler,
    registry: StageRegistry,
    metrics: MetricsCollector,
    sink: Arc<dyn ProgressSink>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let input_guard = PathGuard::new(&config.input_dir)?;
        fs::create_dir_all(&config.work_dir)?;
        let work_root = PathGuard::new(&config.work_dir)?.root().to_path_buf();
        let publisher = AtomicPublisher::new(&config.output_dir, config.bounds()).map_err(
            |err| match err {
                PublishError::Path(violation) => PipelineError::Path(violation),
                PublishError::Io(io) => PipelineError::Io(io),
                PublishError::InvalidOutput(format) => PipelineError::InvalidInput(format),
            },
        )?;
        let sandbox = Sandbox::new(config.env.clone());
        let scheduler =
            ParallelCompressionScheduler::new(sandbox.clone(), config.limits.max_concurrency);
        let mut registry = StageRegistry::new();
        crate::stages::register_defaults(&mut registry);
        Ok(Self {
            config,
            input_guard,
            work_root,
            publisher,
            sandbox,
            scheduler,
            registry,
            metrics: MetricsCollector::new(),
            sink: Arc::new(TracingProgressSink),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Validate the input and prepare an exclusive working directory.
    ///
    /// Nothing external runs here; a malformed input is rejected before any
    /// stage is scheduled.
    pub fn start_run(
        &self,
        input_name: &str,
        profile: QualityProfile,
    ) -> Result<RunHandle, PipelineError> {
        let input = self.input_guard.resolve_file(input_name)?;
        let summary = glb::validate_file(input.as_path(), self.config.bounds())?;

        let run_id = next_run_id();
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{run_id}-"))
            .tempdir_in(&self.work_root)?;
        let guard = PathGuard::new(workdir.path())?;
        let staged = guard.resolve_new(INPUT_NAME)?;
        self.input_guard.revalidate(&input)?;
        let copied = fs::copy(input.as_path(), staged.as_path())?;
        let original = guard.observe(&staged)?;
        // Re-check the copy so a swap between validation and copy is caught.
        glb::validate_file(original.as_path(), self.config.bounds())?;

        let stem = input
            .as_path()
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());

        let mut run = PipelineRun {
            run_id: run_id.clone(),
            profile,
            stem,
            workdir,
            guard,
            current: original.clone(),
            original,
            original_size: copied,
            results: Vec::new(),
            lods: Vec::new(),
            size_decision: None,
            degraded: false,
            state: RunState::Created,
            progress: 0,
        };
        run.transition(RunState::Validating)
            .map_err(|err| PipelineError::Io(std::io::Error::other(err)))?;
        info!(
            run_id = run_id.as_str(),
            input = %input.as_path().display(),
            size = copied,
            meshes = summary.mesh_count,
            images = summary.image_count,
            "Input accepted"
        );
        self.progress(&mut run, 0, "validating", 5, "input validated");

        Ok(RunHandle {
            run_id,
            cancel: CancellationToken::new(),
            run,
        })
    }

    /// Drive a prepared run to `Published` or `Failed`.
    pub fn execute(&self, handle: RunHandle) -> RunOutcome {
        let RunHandle {
            run_id,
            cancel,
            mut run,
        } = handle;
        let span = info_span!("run", run_id = run_id.as_str(), preset = %run.profile.preset);
        let _entered = span.enter();
        let started = Instant::now();

        let outcome = match self.drive(&mut run, &cancel) {
            Ok(outcome) => outcome,
            Err(failure) => self.fail(&mut run, failure),
        };
        self.metrics.record_total_duration(started.elapsed());
        outcome
    }

    /// `start_run` followed by `execute`.
    pub fn run(
        &self,
        input_name: &str,
        profile: QualityProfile,
    ) -> Result<RunOutcome, PipelineError> {
        let handle = self.start_run(input_name, profile).inspect_err(|err| {
            warn!(input = input_name, kind = %err.kind(), error = %err, "Input rejected");
            self.metrics.record_rejected();
        })?;
        Ok(self.execute(handle))
    }

    fn drive(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Failure> {
        let stages = run.profile.enabled_stages();
        let total = stages.len();
        let percent_at = |done: usize| (5 + 90 * done / total.max(1)) as u8;

        for (index, kind) in stages.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                return Err(Failure::new(
                    kind.as_str(),
                    StageError::new(ErrorKind::Cancelled, "run cancelled"),
                ));
            }
            run.transition(RunState::from(kind))
                .map_err(|err| Failure::new(kind.as_str(), StageError::new(ErrorKind::Io, err.to_string())))?;
            self.progress(run, index + 1, kind.as_str(), percent_at(index), "stage started");

            let stage_span = debug_span!("stage", stage = kind.as_str());
            let _entered = stage_span.enter();
            let stage = self.registry.get(kind).ok_or_else(|| {
                Failure::new(
                    kind.as_str(),
                    StageError::new(ErrorKind::Io, format!("no stage registered for '{kind}'")),
                )
            })?;
            let output = {
                let _timer = self.metrics.start_stage(kind.as_str());
                let ctx = StageContext {
                    run_id: &run.run_id,
                    index,
                    knobs: run.profile.knobs(),
                    input: &run.current,
                    original: &run.original,
                    workdir: &run.guard,
                    tools: &self.config.tools,
                    limits: &self.config.limits,
                    sandbox: &self.sandbox,
                    scheduler: &self.scheduler,
                    fallback: self.config.fallback_policy,
                    size_policy: self.config.size_policy,
                    bounds: self.config.bounds(),
                    cancel,
                };
                stage.run(&ctx)
            };
            self.settle(run, kind, output)?;
            self.progress(run, index + 1, kind.as_str(), percent_at(index + 1), "stage finished");
        }

        self.publish(run, cancel)
    }

    fn settle(
        &self,
        run: &mut PipelineRun,
        kind: StageKind,
        output: StageOutput,
    ) -> Result<(), Failure> {
        let StageOutput {
            result,
            output,
            lods,
            size_decision,
        } = output;
        self.metrics
            .record_bytes(kind.as_str(), result.input_size, result.output_size);

        if result.success {
            if let Some(next) = output {
                run.current = run
                    .guard
                    .observe(&next)
                    .map_err(|err| Failure::new(kind.as_str(), err))?;
            }
            run.lods.extend(lods);
            if size_decision.is_some() {
                run.size_decision = size_decision;
            }
            if result.is_degraded() {
                run.degraded = true;
                self.metrics.record_passthrough(kind.as_str());
            }
            run.record(result);
            return Ok(());
        }

        let error = result.error.clone().unwrap_or_else(|| {
            StageError::new(ErrorKind::ProcessFailure, "stage failed without detail")
        });
        if kind.is_critical()
            || error.kind.always_fatal()
            || self.config.fallback_policy == FallbackPolicy::Fail
        {
            run.record(result);
            return Err(Failure::new(kind.as_str(), error));
        }

        warn!(
            stage = kind.as_str(),
            kind = %error.kind,
            detail = error.detail.as_str(),
            "Stage failed, carrying previous output forward"
        );
        run.degraded = true;
        self.metrics.record_passthrough(kind.as_str());
        run.record(result.into_passthrough());
        Ok(())
    }

    fn publish(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Failure> {
        const STAGE: &str = "publishing";
        let stage_index = run.results.len() + 1;
        run.transition(RunState::Publishing)
            .map_err(|err| Failure::new(STAGE, StageError::new(ErrorKind::Io, err.to_string())))?;
        self.progress(run, stage_index, STAGE, 95, "staging artifacts");

        let size_decision = run.size_decision.ok_or_else(|| {
            Failure::new(
                STAGE,
                StageError::new(ErrorKind::InvalidOutput, "packaging produced no size decision"),
            )
        })?;
        let final_name = self.config.output_name(&run.stem, &run.profile);
        let main = self
            .publisher
            .stage(run.current.as_path(), &final_name)
            .map_err(|err| Failure::new(STAGE, err))?;
        let mut lod_candidates = Vec::with_capacity(run.lods.len());
        for lod in &run.lods {
            let name = lod_name(&final_name, &run.stem, lod.level);
            let candidate = self
                .publisher
                .stage(lod.path.as_path(), &name)
                .map_err(|err| Failure::new(STAGE, err))?;
            lod_candidates.push(candidate);
        }
        if cancel.is_cancelled() {
            return Err(Failure::new(
                STAGE,
                StageError::new(ErrorKind::Cancelled, "run cancelled before publish"),
            ));
        }

        // LODs go first; until the main artifact lands they can be put back.
        let mut committed: Vec<RevertibleCommit<'_>> = Vec::with_capacity(lod_candidates.len());
        for candidate in lod_candidates {
            match candidate.commit_revertible() {
                Ok(commit) => committed.push(commit),
                Err(err) => {
                    revert_all(committed);
                    return Err(Failure::new(STAGE, err));
                }
            }
        }
        let artifact = match main.commit() {
            Ok(artifact) => artifact,
            Err(err) => {
                revert_all(committed);
                return Err(Failure::new(STAGE, err));
            }
        };
        let lods: Vec<PublishedArtifact> =
            committed.into_iter().map(RevertibleCommit::keep).collect();

        run.transition(RunState::Published)
            .map_err(|err| Failure::new(STAGE, StageError::new(ErrorKind::Io, err.to_string())))?;
        self.progress(run, stage_index, STAGE, 100, "published");
        self.metrics.record_published(run.original_size, artifact.size);
        info!(
            output = %artifact.path.display(),
            lods = lods.len(),
            degraded = run.degraded,
            decision = ?size_decision,
            "Run published"
        );

        Ok(RunOutcome::Completed {
            run_id: run.run_id.clone(),
            output_path: artifact.path,
            lod_paths: lods.into_iter().map(|lod| lod.path).collect(),
            stats: run.results.clone(),
            degraded: run.degraded,
            size_decision,
            sha256: artifact.sha256,
        })
    }

    fn fail(&self, run: &mut PipelineRun, failure: Failure) -> RunOutcome {
        let Failure { stage, error } = failure;
        if error.kind == ErrorKind::ResourceExceeded {
            warn!(stage = stage.as_str(), detail = error.detail.as_str(), "Resource ceiling breached");
        }
        if let Err(err) = run.transition(RunState::Failed) {
            warn!(error = %err, "Run already terminal");
        }
        let percent = run.progress;
        let stage_index = run.results.len();
        self.progress(
            run,
            stage_index,
            &stage,
            percent,
            &format!("failed: {}", error.kind),
        );
        self.metrics.record_failed(error.kind);
        warn!(
            stage = stage.as_str(),
            kind = %error.kind,
            detail = error.detail.as_str(),
            "Run failed"
        );
        RunOutcome::Failed {
            run_id: run.run_id.clone(),
            stage,
            kind: error.kind,
            detail: error.detail,
            stats: run.results.clone(),
        }
    }

    fn progress(
        &self,
        run: &mut PipelineRun,
        stage_index: usize,
        stage: &str,
        percent: u8,
        message: &str,
    ) {
        let percent = run.advance(percent);
        self.sink.emit(&ProgressEvent {
            run_id: run.run_id.clone(),
            stage_index,
            stage: stage.to_string(),
            percent,
            message: message.to_string(),
        });
    }
}
