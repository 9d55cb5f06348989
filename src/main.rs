// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatforge_server::ServerState;

#[derive(Parser)]
#[command(name = "chatforge", version, about = "Multi-tenant chat proxy backend")]
struct Cli {
    /// Explicit config file (searched paths are used otherwise).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Create a user and print their bearer token (shown exactly once).
    CreateUser {
        #[arg(long)]
        email: String,
    },
    /// Generate a master key suitable for CHATFORGE_MASTER_KEY.
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Pin the process-wide rustls crypto provider before any TLS client is
    // built; with multiple providers in the dependency graph the implicit
    // default is ambiguous.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let config = chatforge_config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => {
            let db = chatforge_db::Db::open(
                PathBuf::from(&config.server.db_path),
                config.server.master_key.as_deref(),
            )
            .await
            .context("opening database")?;
            let state = ServerState::new(db, config)?;
            chatforge_server::serve(state).await
        }
        Command::CreateUser { email } => {
            let db = chatforge_db::Db::open(
                PathBuf::from(&config.server.db_path),
                config.server.master_key.as_deref(),
            )
            .await
            .context("opening database")?;
            let (user, token) = db.create_user(&email).await?;
            println!("user id: {}", user.id);
            println!("token:   {token}");
            println!("(store the token now; only its digest is kept)");
            Ok(())
        }
        Command::GenerateKey => {
            use rand::RngCore;
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            println!("{}", hex::encode(key));
            Ok(())
        }
    }
}
