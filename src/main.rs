use clap::Parser;
use momentum_strategy_engine::cli::{commands, Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => commands::run(config).await,
        Commands::Config { config } => commands::print_config(config),
        Commands::ReplayFeatures { path } => commands::replay_features(&path).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
