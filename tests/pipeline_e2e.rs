#![cfg(unix)]

mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bunker_mesh::digest::compute_sha256;
use bunker_mesh::error::{ErrorKind, PipelineError};
use bunker_mesh::glb::{self, GlbDocument, SizeBounds};
use bunker_mesh::observability::MetricsCollector;
use bunker_mesh::pipeline::{
    FallbackPolicy, Pipeline, ProgressEvent, RunOutcome, SizeDecision, SizePolicy, StageMethod,
};
use bunker_mesh::profile::{FeatureFlags, QualityPreset, QualityProfile};
use common::{Workspace, forged_length, glb_files, textured_glb};
use serde_json::json;
use tempfile::tempdir;

fn recording_sink() -> (Arc<Mutex<Vec<ProgressEvent>>>, impl Fn(&ProgressEvent) + Send + Sync) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink = move |event: &ProgressEvent| sink_events.lock().unwrap().push(event.clone());
    (events, sink)
}

fn high() -> QualityProfile {
    QualityProfile::new(QualityPreset::High, FeatureFlags::all())
}

#[test]
fn high_preset_publishes_smaller_artifact_with_lods() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    let input = ws.write_input("chair.glb", &textured_glb(&[1, 2]));
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let (events, sink) = recording_sink();
    let pipeline = Pipeline::new(config)
        .unwrap()
        .with_progress_sink(Arc::new(sink));

    let outcome = pipeline.run("chair.glb", high()).unwrap();
    let RunOutcome::Completed {
        output_path,
        lod_paths,
        stats,
        degraded,
        size_decision,
        sha256,
        ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };

    let stages: Vec<&str> = stats.iter().map(|result| result.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["geometry", "texture", "simplification", "lod", "packaging"]
    );
    assert!(stats.iter().all(|result| result.success));
    assert!(!degraded);
    assert_eq!(size_decision, SizeDecision::Smaller);

    assert_ne!(output_path, input);
    assert!(output_path.starts_with(ws.output_dir.canonicalize().unwrap()));
    let published = fs::read(&output_path).unwrap();
    let summary = glb::validate(&published, SizeBounds::default()).unwrap();
    assert_eq!(summary.declared_length, published.len() as u64);
    assert_eq!(summary.image_count, 2);
    assert!(published.len() < fs::metadata(&input).unwrap().len() as usize);
    assert_eq!(sha256, compute_sha256(&output_path).unwrap());

    assert_eq!(lod_paths.len(), 3);
    for (level, path) in (1..).zip(&lod_paths) {
        assert!(path.ends_with(format!("chair.lod{level}.glb")));
        glb::validate_file(path, SizeBounds::default()).unwrap();
    }

    let events = events.lock().unwrap();
    let percents: Vec<u8> = events.iter().map(|event| event.percent).collect();
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percents.last(), Some(&100));

    // Working directories are scratch space only.
    assert_eq!(fs::read_dir(&ws.work_dir).unwrap().count(), 0);
    assert!(glb_files(&ws.work_dir).is_empty());
}

#[test]
fn forged_length_is_rejected_before_any_stage() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("forged.glb", &forged_length(textured_glb(&[3])));
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let (events, sink) = recording_sink();
    let metrics = MetricsCollector::new();
    let pipeline = Pipeline::new(config)
        .unwrap()
        .with_metrics(metrics.clone())
        .with_progress_sink(Arc::new(sink));

    let err = pipeline.run("forged.glb", high()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(events.lock().unwrap().is_empty());
    assert!(glb_files(&ws.output_dir).is_empty());
    assert_eq!(metrics.snapshot().inputs_rejected, 1);
}

#[test]
fn inputs_outside_the_input_directory_are_refused() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    fs::write(ws.root.join("secret.glb"), textured_glb(&[4])).unwrap();
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let err = pipeline.run("../secret.glb", high()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathViolation);
    let err = pipeline.run("/etc/passwd", high()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathViolation);
}

#[test]
fn failed_texture_task_is_carried_forward_as_partial() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("lamp.glb", &textured_glb(&[5, 6]));
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(Some("*texture-1.*")));
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("lamp.glb", high()).unwrap();
    let RunOutcome::Completed {
        stats,
        degraded,
        size_decision,
        ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };
    assert!(degraded);
    assert_eq!(size_decision, SizeDecision::Smaller);

    let texture = stats.iter().find(|result| result.stage == "texture").unwrap();
    assert!(texture.success);
    assert_eq!(texture.method, StageMethod::Partial);
    assert_eq!(texture.subtasks.len(), 2);
    let failed: Vec<_> = texture.subtasks.iter().filter(|task| !task.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage, "texture[1]");
    assert_eq!(failed[0].exit_code, Some(1));
    assert_eq!(
        texture.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::ProcessFailure)
    );
}

#[test]
fn failed_texture_task_fails_the_run_under_strict_policy() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("lamp.glb", &textured_glb(&[7, 8]));
    let mut config = ws.config(&ws.copying_gltf_transform(), &ws.magick(Some("*texture-1.*")));
    config.fallback_policy = FallbackPolicy::Fail;
    let metrics = MetricsCollector::new();
    let pipeline = Pipeline::new(config).unwrap().with_metrics(metrics.clone());

    let outcome = pipeline.run("lamp.glb", high()).unwrap();
    let RunOutcome::Failed {
        stage, kind, stats, ..
    } = outcome
    else {
        panic!("expected failed run, got {outcome:?}");
    };
    assert_eq!(stage, "texture");
    assert_eq!(kind, ErrorKind::ProcessFailure);
    assert_eq!(stats.len(), 2);
    assert!(glb_files(&ws.output_dir).is_empty());
    assert_eq!(metrics.snapshot().runs_failed, 1);
}

#[test]
fn geometry_failure_is_fatal() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("broken.glb", &textured_glb(&[9]));
    let config = ws.config(&ws.failing_gltf_transform(3), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("broken.glb", high()).unwrap();
    let RunOutcome::Failed {
        stage,
        kind,
        detail,
        stats,
        ..
    } = outcome
    else {
        panic!("expected failed run, got {outcome:?}");
    };
    assert_eq!(stage, "geometry");
    assert_eq!(kind, ErrorKind::ProcessFailure);
    assert!(detail.contains("mesh is broken"), "{detail}");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].exit_code, Some(3));
    assert!(glb_files(&ws.output_dir).is_empty());
}

fn geometry_only() -> QualityProfile {
    QualityProfile::new(QualityPreset::Medium, FeatureFlags::none())
}

fn low() -> QualityProfile {
    QualityProfile::new(QualityPreset::Low, FeatureFlags::all())
}

#[test]
fn result_equal_to_original_is_published_under_strict_size_policy() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    let original = textured_glb(&[11]);
    ws.write_input("same.glb", &original);
    let mut config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    config.size_policy = SizePolicy::Fail;
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("same.glb", geometry_only()).unwrap();
    let RunOutcome::Completed {
        output_path,
        size_decision,
        stats,
        ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };
    assert_eq!(size_decision, SizeDecision::Smaller);
    assert_eq!(fs::read(&output_path).unwrap(), original);
    let packaging = stats.last().unwrap();
    assert_eq!(packaging.method, StageMethod::Validated);
    assert_eq!(packaging.output_size, original.len() as u64);
}

#[test]
fn larger_result_falls_back_to_original() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    let original = GlbDocument::minimal().to_bytes().unwrap();
    ws.write_input("empty.glb", &original);
    let gltf = ws.emitting_gltf_transform(&textured_glb(&[12]));
    let config = ws.config(&gltf, &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("empty.glb", geometry_only()).unwrap();
    let RunOutcome::Completed {
        output_path,
        size_decision,
        stats,
        ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };
    assert_eq!(size_decision, SizeDecision::FellBackToOriginal);
    assert_eq!(fs::read(&output_path).unwrap(), original);
    let packaging = stats.last().unwrap();
    assert_eq!(packaging.method, StageMethod::Original);
    assert!(packaging.input_size > original.len() as u64);
}

#[test]
fn larger_result_fails_under_strict_size_policy() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("empty.glb", &GlbDocument::minimal().to_bytes().unwrap());
    let gltf = ws.emitting_gltf_transform(&textured_glb(&[13]));
    let mut config = ws.config(&gltf, &ws.magick(None));
    config.size_policy = SizePolicy::Fail;
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("empty.glb", geometry_only()).unwrap();
    let RunOutcome::Failed {
        stage, kind, detail, ..
    } = outcome
    else {
        panic!("expected failed run, got {outcome:?}");
    };
    assert_eq!(stage, "packaging");
    assert_eq!(kind, ErrorKind::InvalidOutput);
    assert!(detail.contains("larger than input"), "{detail}");
    assert!(glb_files(&ws.output_dir).is_empty());
}

#[test]
fn timed_out_texture_task_passes_through() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    let original = textured_glb(&[14]);
    ws.write_input("slow.glb", &original);
    let mut config = ws.config(&ws.copying_gltf_transform(), &ws.sleeping_magick());
    config.limits.texture_timeout = Duration::from_millis(300);
    let pipeline = Pipeline::new(config).unwrap();

    let started = Instant::now();
    let outcome = pipeline.run("slow.glb", low()).unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));
    let RunOutcome::Completed {
        output_path,
        stats,
        degraded,
        ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };
    assert!(degraded);
    assert_eq!(fs::read(&output_path).unwrap(), original);

    let texture = stats.iter().find(|result| result.stage == "texture").unwrap();
    assert!(texture.success);
    assert_eq!(texture.method, StageMethod::Passthrough);
    assert_eq!(texture.subtasks.len(), 1);
    assert_eq!(
        texture.subtasks[0].error.as_ref().map(|error| error.kind),
        Some(ErrorKind::ProcessTimeout)
    );
}

#[test]
fn texture_output_past_the_ceiling_fails_the_run_under_passthrough() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("flood.glb", &textured_glb(&[15]));
    let mut config = ws.config(&ws.copying_gltf_transform(), &ws.flooding_magick(1024 * 1024));
    config.limits.resources.max_output_bytes = 64 * 1024;
    assert_eq!(config.fallback_policy, FallbackPolicy::Passthrough);
    let metrics = MetricsCollector::new();
    let pipeline = Pipeline::new(config).unwrap().with_metrics(metrics.clone());

    let outcome = pipeline.run("flood.glb", low()).unwrap();
    let RunOutcome::Failed {
        stage, kind, stats, ..
    } = outcome
    else {
        panic!("expected failed run, got {outcome:?}");
    };
    assert_eq!(stage, "texture");
    assert_eq!(kind, ErrorKind::ResourceExceeded);
    let texture = stats.last().unwrap();
    assert_eq!(
        texture.subtasks[0].error.as_ref().map(|error| error.kind),
        Some(ErrorKind::ResourceExceeded)
    );
    assert!(glb_files(&ws.output_dir).is_empty());
    assert_eq!(metrics.snapshot().runs_failed, 1);
}

#[test]
fn hostile_buffer_view_degrades_the_texture_stage() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    let hostile = GlbDocument::new(
        json!({
            "asset": { "version": "2.0" },
            "buffers": [{ "byteLength": 8 }],
            "bufferViews": [{ "buffer": 0, "byteOffset": u64::MAX, "byteLength": 8 }],
            "images": [{ "bufferView": 0, "mimeType": "image/png" }]
        }),
        Some(vec![0u8; 8]),
    )
    .to_bytes()
    .unwrap();
    ws.write_input("hostile.glb", &hostile);
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let outcome = pipeline.run("hostile.glb", low()).unwrap();
    let RunOutcome::Completed {
        stats, degraded, ..
    } = outcome
    else {
        panic!("expected completed run, got {outcome:?}");
    };
    assert!(degraded);
    let texture = stats.iter().find(|result| result.stage == "texture").unwrap();
    assert_eq!(texture.method, StageMethod::Passthrough);
    assert_eq!(
        texture.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::InvalidInput)
    );
}

#[test]
fn rerun_replaces_lods_without_leaving_backups() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("chair.glb", &textured_glb(&[16]));
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let first = pipeline.run("chair.glb", high()).unwrap();
    let second = pipeline.run("chair.glb", high()).unwrap();
    assert!(first.is_completed() && second.is_completed());
    let RunOutcome::Completed { lod_paths, .. } = second else {
        unreachable!();
    };
    assert_eq!(lod_paths.len(), 3);

    let published = glb_files(&ws.output_dir);
    assert_eq!(published.len(), 4, "{published:?}");
    let hidden: Vec<_> = fs::read_dir(lod_paths[0].parent().unwrap())
        .unwrap()
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(hidden.is_empty(), "{hidden:?}");
}

#[test]
fn cancelled_run_publishes_nothing() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    ws.write_input("chair.glb", &textured_glb(&[10]));
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();

    let handle = pipeline.start_run("chair.glb", high()).unwrap();
    assert!(!handle.run_id().is_empty());
    handle.cancel_token().cancel();
    let outcome = pipeline.execute(handle);

    let RunOutcome::Failed { kind, stats, .. } = outcome else {
        panic!("expected failed run, got {outcome:?}");
    };
    assert_eq!(kind, ErrorKind::Cancelled);
    assert!(stats.is_empty());
    assert!(glb_files(&ws.output_dir).is_empty());
}

#[test]
fn concurrent_runs_share_one_pipeline() {
    let temp = tempdir().unwrap();
    let ws = Workspace::new(temp.path());
    for index in 0..4u32 {
        ws.write_input(&format!("asset{index}.glb"), &textured_glb(&[index + 20]));
    }
    let config = ws.config(&ws.copying_gltf_transform(), &ws.magick(None));
    let pipeline = Pipeline::new(config).unwrap();
    let profile = QualityProfile::new(QualityPreset::Medium, FeatureFlags::none());

    let outcomes: Vec<RunOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|index| {
                let pipeline = &pipeline;
                scope.spawn(move || pipeline.run(&format!("asset{index}.glb"), profile).unwrap())
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut run_ids: Vec<&str> = outcomes.iter().map(RunOutcome::run_id).collect();
    run_ids.sort();
    run_ids.dedup();
    assert_eq!(run_ids.len(), 4);
    assert!(outcomes.iter().all(RunOutcome::is_completed));
    assert_eq!(glb_files(&ws.output_dir).len(), 4);
}
