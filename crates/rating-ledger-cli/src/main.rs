use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // stdout carries command output only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rating_ledger_core=info,rating_ledger_store_sqlite=info,rating_ledger_cli=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = rating_ledger_cli::Cli::parse();
    rating_ledger_cli::run_cli(cli)
}
