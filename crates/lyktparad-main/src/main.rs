// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Lyktparad.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Lyktparad host node
//!
//! Runs one mesh node with the firmware rollout engine on a host, using UDP
//! in place of the radio mesh and two files in place of the flash slots. A
//! firmware switch restarts the node in-process from the newly selected slot.

mod config;
mod udp_mesh;

use anyhow::{Context, Result};
use clap::Parser;
use lyktparad_ota::{
    FilePartitions, JsonStateStore, MeshTransport, NodeExit, NodeRole, OtaCommandSender, OtaNode,
    StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::udp_mesh::UdpMesh;

#[derive(Parser, Debug)]
#[command(name = "lyktparad")]
#[command(version, about = "Lyktparad mesh node with firmware rollout", long_about = None)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "/data/lyktparad/config.toml")]
    config: PathBuf,

    /// Debug logging for the lyktparad crates
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) -> Result<()> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if verbose {
        for target in ["lyktparad", "lyktparad_ota", "lyktparad_web"] {
            filter = filter.add_directive(format!("{target}=debug").parse()?);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = AppConfig::load(&cli.config)?;
    info!("Starting Lyktparad node {} as {:?}", config.node.address, config.node.role);
    info!("   Data dir: {}", config.node.data_dir.display());
    info!("   Slot capacity: {} bytes", config.node.slot_capacity);
    info!("   Peers: {}", config.mesh.peers.len());
    if let Some(parent) = config.parent() {
        info!("   Parent: {} at {}", parent.address, parent.endpoint);
    }

    let flash_dir = config.node.data_dir.join("flash");
    std::fs::create_dir_all(&flash_dir)
        .with_context(|| format!("Failed to create {}", flash_dir.display()))?;

    let mesh = UdpMesh::bind(&config.mesh, config.node.address, config.node.role).await?;
    let transport: Arc<dyn MeshTransport> = Arc::clone(&mesh) as Arc<dyn MeshTransport>;
    let state_store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(
        &config.node.data_dir,
        &config.ota.rollback.namespace,
    ));

    let (handle, mut commands) = OtaCommandSender::new();
    if config.node.role == NodeRole::Root && config.web.enabled {
        let port = config.web.port;
        tokio::spawn(async move {
            if let Err(e) = lyktparad_web::start_web_server(handle, port).await {
                error!("Web server failed: {e}");
            }
        });
    }

    loop {
        let partitions = FilePartitions::open(&flash_dir, config.node.slot_capacity)
            .context("Failed to open firmware slots")?;
        let node = OtaNode::boot(
            config.ota.clone(),
            config.node.role,
            Arc::clone(&transport),
            Box::new(partitions),
            Arc::clone(&state_store),
            config.node.factory_version,
        )
        .context("Node boot failed")?;

        let (events, events_rx) = mpsc::channel(256);
        let mesh_tasks = mesh.spawn(events);

        let exit = tokio::select! {
            exit = node.run(events_rx, &mut commands) => exit,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                NodeExit::Shutdown
            }
        };

        for task in mesh_tasks {
            task.abort();
        }

        match exit {
            NodeExit::Restart => info!("Restarting node"),
            NodeExit::Shutdown => break,
        }
    }

    info!("Shutting down");
    Ok(())
}
