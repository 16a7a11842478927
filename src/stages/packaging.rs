use std::time::Instant;

use tracing::{info, warn};

use crate::error::{ErrorKind, StageError};
use crate::glb;
use crate::pipeline::{SizeDecision, SizePolicy, StageMethod, StageResult};
use crate::profile::StageKind;

use super::{Stage, StageContext, StageOutput};

/// Final structural check and the size policy.
pub struct PackagingStage;

impl Stage for PackagingStage {
    fn kind(&self) -> StageKind {
        StageKind::Packaging
    }

    fn describe(&self) -> &'static str {
        "Structural validation and size policy"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageOutput {
        let started = Instant::now();
        let kind = self.kind();
        let input_size = ctx.input_size();

        if let Err(err) = glb::validate_file(ctx.input.as_path(), ctx.bounds) {
            return StageOutput::failed(
                kind,
                started,
                input_size,
                StageError::new(ErrorKind::InvalidOutput, err.to_string()),
            );
        }
        let original_size = std::fs::metadata(ctx.original.as_path())
            .map(|meta| meta.len())
            .unwrap_or(0);

        if input_size <= original_size {
            info!(original_size, result_size = input_size, "Result is not larger than input");
            let mut output = StageOutput::new(StageResult::success(
                kind.as_str(),
                StageMethod::Validated,
                started.elapsed(),
                input_size,
                input_size,
            ));
            output.size_decision = Some(SizeDecision::Smaller);
            return output;
        }

        let note = format!("result {input_size} bytes, original {original_size} bytes");
        match ctx.size_policy {
            SizePolicy::PublishAnyway => {
                warn!(original_size, result_size = input_size, "Publishing result that is larger than input");
                let mut output = StageOutput::new(
                    StageResult::success(
                        kind.as_str(),
                        StageMethod::Validated,
                        started.elapsed(),
                        input_size,
                        input_size,
                    )
                    .with_note(note),
                );
                output.size_decision = Some(SizeDecision::KeptLarger);
                output
            }
            SizePolicy::FallbackToOriginal => {
                warn!(original_size, result_size = input_size, "Result is larger than input, publishing original");
                let mut output = StageOutput::new(
                    StageResult::success(
                        kind.as_str(),
                        StageMethod::Original,
                        started.elapsed(),
                        input_size,
                        original_size,
                    )
                    .with_note(note),
                )
                .with_output(ctx.original.clone());
                output.size_decision = Some(SizeDecision::FellBackToOriginal);
                output
            }
            SizePolicy::Fail => StageOutput::failed(
                kind,
                started,
                input_size,
                StageError::new(ErrorKind::InvalidOutput, format!("larger than input: {note}")),
            ),
        }
    }
}
