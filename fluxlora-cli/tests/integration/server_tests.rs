//! HTTP surface of the image server

use super::fixtures::*;
use super::init_test_logging;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fluxlora::{AdapterRegistry, GenerationPipeline, GenerationService};
use fluxlora_cli::cli::commands::serve::{build_router, AppState};
use serde_json::{json, Value};
use std::path::Path;
use tower::ServiceExt;

fn app(root: &Path, pipeline: FakePipeline) -> Router {
    let pipeline: Box<dyn GenerationPipeline> = Box::new(pipeline);
    let service = GenerationService::new(
        pipeline,
        AdapterRegistry::new(root.join("lora")),
        root.join("images"),
    );
    build_router(AppState::new(service))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read(response).await
}

async fn post(app: Router, uri: &str, body: String) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_reports_unloaded_pipeline() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();

    let (status, body) = get(app(&root, FakePipeline::default()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_requests"], 0);
    assert_eq!(body["adapter"], json!({ "state": "unloaded" }));
}

#[tokio::test]
async fn test_adapters_lists_sorted_with_default() {
    let (_temp_dir, root) = create_test_dir();
    write_adapter(&root.join("lora"), "zebra.safetensors", 8);
    write_adapter(&root.join("lora"), "alpha.safetensors", 16);
    std::fs::write(root.join("lora/notes.txt"), "ignored").unwrap();
    std::fs::write(root.join("lora/broken.safetensors"), b"garbage").unwrap();

    let (status, body) = get(app(&root, FakePipeline::default()), "/adapters").await;
    assert_eq!(status, StatusCode::OK);

    let ids: Vec<&str> = body["adapters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["alpha.safetensors", "broken.safetensors", "zebra.safetensors"]);
    assert_eq!(body["default"], "alpha.safetensors");
    assert_eq!(body["adapters"][0]["info"]["rank"], 16);
    assert!(body["adapters"][1]["error"].is_string());
    assert_eq!(body["loaded"], Value::Null);
}

#[tokio::test]
async fn test_generate_with_adapter_writes_images() {
    init_test_logging();
    let (_temp_dir, root) = create_test_dir();
    let adapter = write_adapter(&root.join("lora"), "style.safetensors", 4);
    let pipeline = FakePipeline::default();
    let calls = pipeline.calls.clone();
    let app = app(&root, pipeline);

    let (status, body) = post(
        app.clone(),
        "/generate",
        json!({
            "prompt": "a lighthouse",
            "adapter": "style.safetensors",
            "count": 2,
            "width": 1000,
        })
        .to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let images = body["images"].as_array().unwrap();
    assert_eq!(images.len(), 2);
    for image in images {
        let path = Path::new(image.as_str().unwrap());
        assert!(path.starts_with(root.join("images")));
        assert_eq!(std::fs::read(path).unwrap(), b"\x89PNG\r\n\x1a\n");
    }
    assert_eq!(
        *calls.lock(),
        vec![
            PipelineCall::Load(adapter),
            PipelineCall::Scheduler,
            PipelineCall::Generate { steps: 20, count: 2, width: 1000, height: 1024 },
        ]
    );

    let (_, health) = get(app, "/health").await;
    assert_eq!(
        health["adapter"],
        json!({ "state": "loaded", "adapter": "style.safetensors" })
    );
}

#[tokio::test]
async fn test_generate_rejects_out_of_range_request() {
    let (_temp_dir, root) = create_test_dir();
    let pipeline = FakePipeline::default();
    let calls = pipeline.calls.clone();

    let (status, body) = post(
        app(&root, pipeline),
        "/generate",
        json!({ "prompt": "x", "count": 5 }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");
    assert!(body["request_id"].is_string());
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_generate_unknown_adapter_is_bad_request() {
    let (_temp_dir, root) = create_test_dir();

    let (status, body) = post(
        app(&root, FakePipeline::default()),
        "/generate",
        json!({ "prompt": "x", "adapter": "missing.safetensors" }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "ADAPTER_LOAD_ERROR");
    assert!(!root.join("images").exists() || std::fs::read_dir(root.join("images")).unwrap().next().is_none());
}

#[tokio::test]
async fn test_generate_malformed_body() {
    let (_temp_dir, root) = create_test_dir();

    let (status, body) = post(
        app(&root, FakePipeline::default()),
        "/generate",
        "{\"steps\": 10}".to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}
