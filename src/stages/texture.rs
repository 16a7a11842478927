use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::time::Instant;

use image::{ImageFormat, ImageReader};
use tracing::debug;

use crate::error::{ErrorKind, StageError};
use crate::glb::{self, EmbeddedImage, GlbDocument};
use crate::guard::GuardedPath;
use crate::pipeline::{StageMethod, StageResult};
use crate::profile::StageKind;
use crate::sandbox::ArgToken;
use crate::scheduler::CompressionTask;

use super::{Stage, StageContext, StageOutput, first_error, settle_batch};

/// Recompress every embedded PNG/JPEG/WebP image with ImageMagick, in parallel.
pub struct TextureStage;

impl Stage for TextureStage {
    fn kind(&self) -> StageKind {
        StageKind::Texture
    }

    fn describe(&self) -> &'static str {
        "Embedded texture recompression (magick, one task per image)"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageOutput {
        let started = Instant::now();
        let input_size = ctx.input_size();
        compress(ctx, started, input_size)
            .unwrap_or_else(|error| StageOutput::failed(self.kind(), started, input_size, error))
    }
}

struct Candidate {
    image: EmbeddedImage,
    format: ImageFormat,
    dimensions: (u32, u32),
    bytes: Vec<u8>,
}

fn extension(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

fn probe(bytes: &[u8]) -> Option<(ImageFormat, (u32, u32))> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    let dimensions = reader.into_dimensions().ok()?;
    Some((format, dimensions))
}

/// A recompressed texture is kept only if it fully decodes to the same
/// format and size and is strictly smaller.
fn accept(
    ctx: &StageContext<'_>,
    output: &GuardedPath,
    candidate: &Candidate,
) -> Result<Vec<u8>, String> {
    let output = ctx.workdir.observe(output).map_err(|err| err.to_string())?;
    let bytes = glb::read_bounded(output.as_path(), ctx.limits.resources.max_output_bytes)
        .map_err(|err| err.to_string())?;
    if bytes.len() >= candidate.bytes.len() {
        return Err(format!(
            "not smaller ({} >= {} bytes)",
            bytes.len(),
            candidate.bytes.len()
        ));
    }
    let decoded = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|err| err.to_string())?;
    if decoded.format() != Some(candidate.format) {
        return Err(format!("format changed to {:?}", decoded.format()));
    }
    let image = decoded.decode().map_err(|err| err.to_string())?;
    if (image.width(), image.height()) != candidate.dimensions {
        return Err(format!(
            "dimensions changed to {}x{}",
            image.width(),
            image.height()
        ));
    }
    Ok(bytes)
}

fn compress(
    ctx: &StageContext<'_>,
    started: Instant,
    input_size: u64,
) -> Result<StageOutput, StageError> {
    let kind = StageKind::Texture;
    let invalid = |err: glb::FormatError| StageError::new(ErrorKind::InvalidInput, err.to_string());
    let bytes = glb::read_bounded(ctx.input.as_path(), ctx.bounds.max).map_err(invalid)?;
    let mut doc = GlbDocument::parse(&bytes).map_err(invalid)?;

    let mut candidates = Vec::new();
    let mut skipped = 0usize;
    for image in doc.embedded_images() {
        let data = doc.view_bytes(image.view_index).map_err(invalid)?;
        match probe(data) {
            Some((format, dimensions)) if extension(format).is_some() => {
                candidates.push(Candidate {
                    image,
                    format,
                    dimensions,
                    bytes: data.to_vec(),
                });
            }
            _ => skipped += 1,
        }
    }
    if candidates.is_empty() {
        return Ok(StageOutput::new(
            StageResult::success(
                kind.as_str(),
                StageMethod::Batch,
                started.elapsed(),
                input_size,
                input_size,
            )
            .with_note(format!("no recompressible textures ({skipped} skipped)")),
        ));
    }

    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let index = candidate.image.image_index;
        let ext = extension(candidate.format).unwrap_or("bin");
        let stem = ctx.scratch_name(kind, &format!("-{index}"));
        let source = ctx.new_output(&format!("{stem}.src.{ext}"))?;
        fs::write(source.as_path(), &candidate.bytes)?;
        tasks.push(CompressionTask {
            spec: ctx.spec(
                format!("texture[{index}]"),
                &ctx.tools.magick,
                vec![
                    ArgToken::Input,
                    ArgToken::Literal("-strip"),
                    ArgToken::Literal("-quality"),
                    ArgToken::Integer(ctx.knobs.texture_quality),
                    ArgToken::Output,
                ],
                ctx.limits.texture_timeout,
            ),
            input: ctx.workdir.observe(&source)?,
            output: ctx.new_output(&format!("{stem}.out.{ext}"))?,
            workdir: ctx.task_dir(&format!("{stem}.home"))?.as_path().to_path_buf(),
        });
    }

    let mut subtasks = ctx.scheduler.run_batch(&tasks, ctx.cancel);
    let mut replacements = BTreeMap::new();
    for ((task, candidate), result) in tasks.iter().zip(&candidates).zip(subtasks.iter_mut()) {
        if !result.success {
            continue;
        }
        match accept(ctx, &task.output, candidate) {
            Ok(bytes) => {
                result.output_size = bytes.len() as u64;
                replacements.insert(candidate.image.view_index, bytes);
            }
            Err(reason) => {
                debug!(task = task.spec.name.as_str(), reason = reason.as_str(), "Keeping original texture");
                result.note = Some(format!("kept original: {reason}"));
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
    let replaced = replacements.len();
    let failed = subtasks.iter().filter(|task| !task.success).count();
    let fallback_error = first_error(&subtasks);

    if replacements.is_empty() {
        let mut result = StageResult::success(
            kind.as_str(),
            method,
            started.elapsed(),
            input_size,
            input_size,
        )
        .with_note(format!("no texture improved; {failed} failed, {skipped} skipped"))
        .with_subtasks(subtasks);
        result.error = fallback_error;
        return Ok(StageOutput::new(result));
    }

    doc.replace_views(&replacements).map_err(invalid)?;
    let rebuilt = doc.to_bytes().map_err(invalid)?;
    let output = ctx.new_output(&ctx.scratch_name(kind, ".glb"))?;
    fs::write(output.as_path(), &rebuilt)?;
    glb::validate_file(output.as_path(), ctx.bounds)
        .map_err(|err| StageError::new(ErrorKind::InvalidOutput, err.to_string()))?;

    let mut result = StageResult::success(
        kind.as_str(),
        method,
        started.elapsed(),
        input_size,
        rebuilt.len() as u64,
    )
    .with_note(format!(
        "{replaced} of {} textures replaced; {failed} failed, {skipped} skipped",
        candidates.len()
    ))
    .with_subtasks(subtasks);
    result.error = fallback_error;
    Ok(StageOutput::new(result).with_output(output))
}
