mod cmd;
mod util;

use argp::FromArgs;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(FromArgs, PartialEq, Debug)]
/// Bulk repository discovery, clone and submission for Moderne ingestion.
struct TopLevel {
    #[argp(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Subcommands.
#[argp(subcommand)]
enum Command {
    Run(cmd::run::Args),
    Version(cmd::version::Args),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let code = match args.command {
        Command::Run(args) => match cmd::run::run(args).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{e:#}");
                2
            }
        },
        Command::Version(args) => cmd::version::run(args),
    };
    std::process::ExitCode::from(code)
}
