//! Full workflow integration tests
//!
//! Settings → document resolution → captioning → job compilation → training

use super::fixtures::*;
use super::init_test_logging;
use fluxlora::{
    CaptionModel, CaptionPipeline, Error, JobSpec, Result, ToolkitRunner, TrainingEngine,
    TrainingSession,
};
use fluxlora_cli::cli::{commands::train::resolve_document, CliError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Answers with a mapping keyed by task tag, like the Florence-2 worker
struct StemCaptioner;

impl CaptionModel for StemCaptioner {
    fn caption(&mut self, image: &Path, task: &str) -> Result<Value> {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(json!({ task: format!("The image shows a {}", stem) }))
    }
}

#[derive(Clone, Default)]
struct RecordingEngine {
    jobs: Arc<Mutex<Vec<JobSpec>>>,
}

impl TrainingEngine for RecordingEngine {
    fn run(&self, job: &JobSpec) -> Result<()> {
        self.jobs.lock().push(job.clone());
        Ok(())
    }
}

#[test]
fn test_train_workflow_uses_settings_defaults() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);
    create_dataset(&config.paths.data_folder, &["cat.png", "dog.jpg", "fox.jpeg"]);
    fs::write(&config.paths.config_document, "prompts:\n  - a cat\n").unwrap();

    let resolved = resolve_document(
        None,
        Some("sks".to_string()),
        Some("pets_v1".to_string()),
        &config,
    )
    .unwrap();
    assert_eq!(resolved.data_folder, config.paths.data_folder);
    assert_eq!(resolved.training_folder, config.paths.output_folder);

    let engine = RecordingEngine::default();
    let session = TrainingSession::new(resolved, engine.clone());
    let mut captioner = CaptionPipeline::with_model(Box::new(StemCaptioner));
    let prepared = session.run(&mut captioner).unwrap();

    assert_eq!(prepared.captions.captioned.len(), 3);
    for (stem, caption) in [("cat", "A cat"), ("dog", "A dog"), ("fox", "A fox")] {
        let text = fs::read_to_string(config.paths.data_folder.join(format!("{}.txt", stem))).unwrap();
        assert_eq!(text, caption);
    }

    let process = prepared.job.process();
    assert_eq!(prepared.job.config.name, "pets_v1");
    assert_eq!(process.trigger_word.as_deref(), Some("sks"));
    assert_eq!(process.train.steps, 300);
    assert_eq!(process.sample.prompts, vec!["a cat".to_string()]);
    assert_eq!(process.model.name_or_path, "black-forest-labs/FLUX.1-dev");
    assert_eq!(process.datasets[0].folder_path, config.paths.data_folder);
    assert_eq!(*engine.jobs.lock(), vec![prepared.job.clone()]);
}

#[test]
fn test_second_run_skips_existing_captions() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);
    create_dataset(&config.paths.data_folder, &["cat.png", "dog.png"]);
    fs::write(config.paths.data_folder.join("cat.txt"), "hand written").unwrap();
    fs::write(&config.paths.config_document, "prompts: [p]\n").unwrap();

    let resolved = resolve_document(None, None, None, &config).unwrap();
    let session = TrainingSession::new(resolved, RecordingEngine::default());
    let mut captioner = CaptionPipeline::with_model(Box::new(StemCaptioner));
    let prepared = session.prepare(&mut captioner).unwrap();

    assert_eq!(prepared.captions.skipped.len(), 1);
    assert_eq!(prepared.captions.captioned.len(), 1);
    assert_eq!(
        fs::read_to_string(config.paths.data_folder.join("cat.txt")).unwrap(),
        "hand written"
    );
    assert_eq!(prepared.job.process().train.steps, 200);
}

#[test]
fn test_explicit_document_overrides_settings_path() {
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);
    let data = root.join("elsewhere");
    create_dataset(&data, &["a.png"]);
    let document = root.join("custom.yaml");
    fs::write(
        &document,
        format!("prompts: [p]\ndata_folder: {}\nsteps: 42\n", data.display()),
    )
    .unwrap();

    let resolved = resolve_document(Some(&document), None, None, &config).unwrap();
    assert_eq!(resolved.data_folder, data);

    let prepared = TrainingSession::new(resolved, RecordingEngine::default())
        .compile()
        .unwrap();
    assert_eq!(prepared.job.process().train.steps, 42);
}

#[test]
fn test_missing_document_is_a_config_error() {
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);

    let err = resolve_document(None, None, None, &config).unwrap_err();
    assert!(matches!(err, CliError::Core(Error::Config(_))));
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_empty_dataset_stops_before_captioning() {
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);
    fs::create_dir_all(&config.paths.data_folder).unwrap();
    fs::write(&config.paths.config_document, "prompts: [p]\n").unwrap();

    let resolved = resolve_document(None, None, None, &config).unwrap();
    let session = TrainingSession::new(resolved, RecordingEngine::default());
    let err = session.compile().unwrap_err();
    assert!(err.to_string().contains("No images found"));
}

#[cfg(unix)]
#[test]
fn test_toolkit_receives_written_job() {
    use fluxlora::credentials::HfToken;

    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let config = test_config(&root);
    create_dataset(&config.paths.data_folder, &["a.png", "b.png"]);
    fs::write(&config.paths.config_document, "prompts: [a portrait]\n").unwrap();

    // `sh run.py job.yaml` stands in for the python toolkit
    fs::create_dir_all(&config.toolkit.dir).unwrap();
    fs::write(
        config.toolkit.dir.join("run.py"),
        "test \"$HF_TOKEN\" = hf_test || exit 3\n\
         test \"$HF_HUB_ENABLE_HF_TRANSFER\" = 1 || exit 4\n\
         cp \"$1\" captured.yaml\n",
    )
    .unwrap();

    let token = HfToken::resolve(Some("hf_test".to_string()), &config.paths.token_file).unwrap();
    let runner = ToolkitRunner::new(&config.toolkit.dir)
        .with_python("sh")
        .with_token(token);

    let resolved = resolve_document(None, None, Some("portrait".to_string()), &config).unwrap();
    let session = TrainingSession::new(resolved, runner);
    let prepared = session.compile().unwrap();
    session.train(&prepared).unwrap();

    let captured = fs::read_to_string(config.toolkit.dir.join("captured.yaml")).unwrap();
    let job: serde_yaml::Value = serde_yaml::from_str(&captured).unwrap();
    assert_eq!(job["job"].as_str(), Some("extension"));
    assert_eq!(job["config"]["name"].as_str(), Some("portrait"));
    assert_eq!(job["config"]["process"][0]["train"]["steps"].as_u64(), Some(200));
    assert!(config.paths.output_folder.join("portrait.job.yaml").is_file());
}
