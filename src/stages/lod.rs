use std::time::Instant;

use crate::error::{ErrorKind, StageError};
use crate::glb;
use crate::pipeline::{StageMethod, StageResult};
use crate::profile::StageKind;
use crate::sandbox::ArgToken;
use crate::scheduler::CompressionTask;

use super::{LodArtifact, Stage, StageContext, StageOutput, first_error, settle_batch};

/// Level-of-detail meshes at halving ratios; the main intermediate is untouched.
pub struct LodStage;

impl Stage for LodStage {
    fn kind(&self) -> StageKind {
        StageKind::Lod
    }

    fn describe(&self) -> &'static str {
        "Level-of-detail generation (gltf-transform simplify per level)"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageOutput {
        let started = Instant::now();
        let input_size = ctx.input_size();
        generate(ctx, started, input_size)
            .unwrap_or_else(|error| StageOutput::failed(self.kind(), started, input_size, error))
    }
}

fn generate(
    ctx: &StageContext<'_>,
    started: Instant,
    input_size: u64,
) -> Result<StageOutput, StageError> {
    let kind = StageKind::Lod;
    let ratios = ctx.knobs.lod_ratios();
    let error_bound = ctx
        .knobs
        .simplify_error
        .unwrap_or_else(|| crate::profile::Ratio::clamped(0.01));

    let mut tasks = Vec::with_capacity(ratios.len());
    for (offset, ratio) in ratios.iter().enumerate() {
        let level = offset + 1;
        let name = ctx.scratch_name(kind, &format!("{level}"));
        tasks.push(CompressionTask {
            spec: ctx.spec(
                format!("lod[{level}]"),
                &ctx.tools.gltf_transform,
                vec![
                    ArgToken::Literal("simplify"),
                    ArgToken::Input,
                    ArgToken::Output,
                    ArgToken::Literal("--ratio"),
                    ArgToken::Ratio(*ratio),
                    ArgToken::Literal("--error"),
                    ArgToken::Ratio(error_bound),
                ],
                ctx.limits.stage_timeout,
            ),
            input: ctx.input.clone(),
            output: ctx.new_output(&format!("{name}.glb"))?,
            workdir: ctx.task_dir(&format!("{name}.home"))?.as_path().to_path_buf(),
        });
    }

    let mut subtasks = ctx.scheduler.run_batch(&tasks, ctx.cancel);
    let mut lods = Vec::new();
    for ((level, task), result) in (1u32..).zip(&tasks).zip(subtasks.iter_mut()) {
        if !result.success {
            continue;
        }
        let checked = ctx
            .workdir
            .observe(&task.output)
            .map_err(StageError::from)
            .and_then(|path| {
                glb::validate_file(path.as_path(), ctx.bounds)
                    .map(|_| path)
                    .map_err(|err| StageError::new(ErrorKind::InvalidOutput, err.to_string()))
            });
        match checked {
            Ok(path) => lods.push(LodArtifact { level, path }),
            Err(error) => {
                result.success = false;
                result.error = Some(error);
            }
        }
    }

    let method = match settle_batch(&subtasks, ctx.fallback) {
        Ok(method) => method,
        Err(error) => {
            return Ok(StageOutput::new(
                StageResult::failure(kind.as_str(), started.elapsed(), input_size, error)
                    .with_method(StageMethod::Batch)
                    .with_subtasks(subtasks),
            ));
        }
    };
    let produced: u64 = subtasks
        .iter()
        .filter(|task| task.success)
        .map(|task| task.output_size)
        .sum();
    let mut result = StageResult::success(
        kind.as_str(),
        method,
        started.elapsed(),
        input_size,
        produced,
    )
    .with_note(format!("{} of {} levels generated", lods.len(), ratios.len()));
    result.error = first_error(&subtasks);
    let result = result.with_subtasks(subtasks);

    let mut output = StageOutput::new(result);
    output.lods = lods;
    Ok(output)
}
