//! tarstitch binary entry point
//!
//! Parses arguments, installs logging and runs one subcommand against a
//! directory-backed store. Ctrl-C cancels in-flight work; an interrupted
//! archive leaves no multipart upload behind.

mod cli;
mod commands;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tarstitch_store::FsStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let store = Arc::new(FsStore::new(&cli.root));
    tracing::debug!("Using store rooted at {}", cli.root.display());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    match &cli.command {
        Command::Create(args) => commands::create(store, args, &cancel).await,
        Command::Layout(args) => commands::layout(store, args).await,
        Command::Parts(args) => commands::parts(args),
        Command::Sweep(args) => commands::sweep(store, args).await,
    }
}
