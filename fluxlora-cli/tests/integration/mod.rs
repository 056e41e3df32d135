//! Integration tests for FluxLoRA workflows
//!
//! Covers the caption-and-train workflow against the resolved tool settings
//! and the HTTP surface of the image server.

mod fixtures;
mod server_tests;
mod workflow_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("fluxlora=debug,fluxlora_cli=debug")
        .try_init();
}
