use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier messaging bot CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bot: transport, command router, delivery pool, and the webhook server when an API key is set.
    Run {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Command prefix character (default from config or '!')
        #[arg(long, short)]
        prefix: Option<char>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, prefix }) => {
            if let Err(e) = run(config, prefix).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(courier::config::default_config_path);
    let dir = courier::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run(config_path: Option<std::path::PathBuf>, prefix: Option<char>) -> anyhow::Result<()> {
    let (mut config, path) = courier::config::load_config(config_path)?;
    if let Some(p) = prefix {
        config.router.prefix = p;
    }
    log::info!(
        "starting courier with config {} (prefix '{}')",
        path.display(),
        config.router.prefix
    );
    courier::gateway::run_gateway(config).await
}
