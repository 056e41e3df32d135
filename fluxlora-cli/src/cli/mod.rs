pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod progress;

// Re-export command structures
pub use commands::{
    adapters::AdaptersCommand,
    caption::CaptionCommand,
    compile::CompileCommand,
    generate::GenerateCommand,
    serve::ServeCommand,
    train::TrainCommand,
};

// Re-export error types
pub use error::{CliError, CliResult};
