// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printfarm: one shared G-code queue fanned out over a fleet of Duet printers.
//
// Entry point. Initialises logging, loads the configuration, starts the
// scheduler and serves the dashboard API until Ctrl-C.

mod api;
mod services;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use printfarm_core::error::Result;
use printfarm_print::duet_client::DuetConnector;
use tracing::{error, info};

use services::app_services::{self, AppServices};

/// Print farm controller for Duet 3D printers.
#[derive(Debug, Parser)]
#[command(name = "printfarm", version, about)]
struct Cli {
    /// Settings file (default: config.json in the data directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to serve the dashboard API on, e.g. 0.0.0.0:5000.
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory holding uploaded G-code files.
    #[arg(short, long)]
    gcodes: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Printfarm starting");

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "printfarm failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = app_services::load_config(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(gcodes) = cli.gcodes {
        config.gcodes_directory = gcodes;
    }
    config.validate()?;

    let connector = Arc::new(DuetConnector::new(&config)?);
    let listen = config.listen.clone();
    let services = AppServices::start(config, connector)?;

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            services.shutdown().await;
            return Err(e.into());
        }
    };
    info!(%listen, gcodes = %services.gcodes_dir().display(), "dashboard API listening");

    let served = axum::serve(listener, api::router(services.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    services.shutdown().await;
    served?;
    info!("Printfarm stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => {
            error!(error = %e, "cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
