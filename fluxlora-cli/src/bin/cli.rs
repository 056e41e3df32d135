use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Generator, Shell};
use fluxlora_cli::cli::{self, commands::*, progress::OutputMode, CliError, CliResult};
use std::{io, path::PathBuf, process};

#[derive(Parser)]
#[command(
    name = "fluxlora",
    version,
    about = "FluxLoRA: caption, train and serve FLUX LoRA adapters",
    long_about = "FluxLoRA captions an image dataset, compiles a training job for the toolkit, \
                  runs it, and serves text-to-image generation with the resulting adapters."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON log format
    #[arg(long, global = true)]
    json: bool,

    /// Settings file path
    #[arg(short, long, global = true, env = "FLUXLORA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Caption the dataset and train an adapter
    Train(TrainCommand),

    /// Caption images that have no caption yet
    Caption(CaptionCommand),

    /// Compile the training job without running it
    Compile(CompileCommand),

    /// Generate images from a prompt
    Generate(GenerateCommand),

    /// Start the image generation server
    Serve(ServeCommand),

    /// List trained adapters
    Adapters(AdaptersCommand),

    /// Manage FluxLoRA settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Show current settings
    Show,

    /// Write a settings file with the defaults
    Init {
        /// Force overwrite existing settings
        #[arg(short, long)]
        force: bool,
    },
}

fn print_completions<G: Generator>(gen: G, cmd: &mut clap::Command) {
    clap_complete::generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::logging::init_logging(cli.verbose, cli.quiet, cli.json) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        e.print_error();
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    // Init must work before any settings file exists
    if let Commands::Config {
        subcommand: ConfigSubcommand::Init { force },
    } = cli.command
    {
        let written = cli::config::init_config(cli.config.as_deref(), force)?;
        cli::logging::success(&format!("Settings written to {}", written.display()));
        return Ok(());
    }

    let config = cli::config::load_config(cli.config.as_deref())?;
    let output = OutputMode::new(cli.quiet, cli.json);

    match cli.command {
        Commands::Train(cmd) => train::execute(cmd, config, output).await,
        Commands::Caption(cmd) => caption::execute(cmd, config, output).await,
        Commands::Compile(cmd) => compile::execute(cmd, config).await,
        Commands::Generate(cmd) => generate::execute(cmd, config, output).await,
        Commands::Serve(cmd) => serve::execute(cmd, config).await,
        Commands::Adapters(cmd) => adapters::execute(cmd, config).await,
        Commands::Config { subcommand } => handle_config(subcommand, &config),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            print_completions(shell, &mut cmd);
            Ok(())
        }
    }
}

fn handle_config(subcommand: ConfigSubcommand, config: &cli::config::Config) -> CliResult<()> {
    match subcommand {
        ConfigSubcommand::Show => cli::config::show_config(config),
        ConfigSubcommand::Init { .. } => Err(CliError::InvalidArgument(
            "config init is handled before settings are loaded".to_string(),
        )),
    }
}
