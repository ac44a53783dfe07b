// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::Result;
use clap::Parser;
use fabstir_llm_operator::{
    api,
    config::OperatorConfig,
    ledger::Ledger,
    liveness,
    OperatorState,
};
use std::{env, path::PathBuf, sync::Arc};
use tokio::signal;
use tokio::sync::oneshot;

/// Coordinator for the distributed LLM inference network
#[derive(Parser, Debug)]
#[command(name = "fabstir-llm-operator")]
#[command(about = "Routes inference jobs to worker nodes and streams results back", long_about = None)]
struct Args {
    /// Path to the operator TOML config file
    #[arg(long, env = "OPERATOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = OperatorConfig::load(args.config.as_deref())?;

    println!("🚀 Starting Fabstir LLM Operator...");
    println!("   Operator URL:   {}", config.operator_url);
    println!("   Server port:    {}", config.server_port);
    println!("   Ledger:         {}", config.database.url);
    println!("   Health sweep:   every {}s", config.health_check_interval);

    // Bring components up leaves-first: ledger, then shared state, then
    // the liveness loop, then the HTTP surface.
    let ledger = Ledger::open(&config.database.url).await?;
    let state = Arc::new(OperatorState::new(config.clone(), ledger));

    let liveness_handle = liveness::spawn(state.clone())?;

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.server_port)).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(api::serve(state, listener, shutdown_rx));

    println!("✅ Operator listening on http://{}", local_addr);
    println!("\nEndpoints:");
    println!("  Register:   POST http://localhost:{}/register", config.server_port);
    println!("  Stream:     GET  http://localhost:{}/stream", config.server_port);
    println!("  Inference:  POST http://localhost:{}/inference", config.server_port);
    println!("  Nodes:      GET  http://localhost:{}/nodes", config.server_port);
    println!("\nPress Ctrl+C to shutdown...");

    signal::ctrl_c().await?;
    println!("\n⏹️  Shutting down...");

    // Tear down in reverse order of startup
    let _ = shutdown_tx.send(());
    let _ = server.await;
    liveness_handle.shutdown().await;

    println!("👋 Goodbye!");
    Ok(())
}
