use std::time::Instant;

use crate::error::{ErrorKind, StageError};
use crate::profile::StageKind;
use crate::sandbox::ArgToken;

use super::{Stage, StageContext, StageOutput, run_tool};

/// Draco mesh compression through `gltf-transform draco`.
pub struct GeometryStage;

impl Stage for GeometryStage {
    fn kind(&self) -> StageKind {
        StageKind::Geometry
    }

    fn describe(&self) -> &'static str {
        "Draco geometry compression (gltf-transform draco, edgebreaker)"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageOutput {
        let args = vec![
            ArgToken::Literal("draco"),
            ArgToken::Input,
            ArgToken::Output,
            ArgToken::Literal("--method"),
            ArgToken::Literal("edgebreaker"),
            ArgToken::Literal("--quantize-position"),
            ArgToken::Integer(ctx.knobs.position_bits),
        ];
        run_tool(ctx, self.kind(), &ctx.tools.gltf_transform, args)
    }
}

/// Mesh decimation through `gltf-transform simplify`.
pub struct SimplificationStage;

impl Stage for SimplificationStage {
    fn kind(&self) -> StageKind {
        StageKind::Simplification
    }

    fn describe(&self) -> &'static str {
        "Mesh simplification (gltf-transform simplify)"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageOutput {
        let (Some(ratio), Some(error)) = (ctx.knobs.simplify_ratio, ctx.knobs.simplify_error)
        else {
            return StageOutput::failed(
                self.kind(),
                Instant::now(),
                ctx.input_size(),
                StageError::new(ErrorKind::InvalidInput, "preset has no simplification settings"),
            );
        };
        let args = vec![
            ArgToken::Literal("simplify"),
            ArgToken::Input,
            ArgToken::Output,
            ArgToken::Literal("--ratio"),
            ArgToken::Ratio(ratio),
            ArgToken::Literal("--error"),
            ArgToken::Ratio(error),
        ];
        run_tool(ctx, self.kind(), &ctx.tools.gltf_transform, args)
    }
}
