pub mod adapters;
pub mod caption;
pub mod compile;
pub mod generate;
pub mod serve;
pub mod train;

pub use adapters::AdaptersCommand;
pub use caption::CaptionCommand;
pub use compile::CompileCommand;
pub use generate::GenerateCommand;
pub use serve::ServeCommand;
pub use train::TrainCommand;
