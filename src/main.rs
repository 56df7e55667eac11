use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

mod commands;
mod config;
mod connection;
mod error;
mod keyspace;
mod protocol;
mod replication;
mod server;
mod snapshot;

use config::{Cli, Config};
use server::Server;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let port = config.port;
    let server = Arc::new(Server::new(config));

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind port {port}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("listening on port {port} as {:?}", server.role());

    if let Some(primary) = server.config.replica_of.clone() {
        if let Err(e) = connect_to_primary(&primary, port, &server).await {
            error!("replica handshake with {}:{} failed: {e}", primary.host, primary.port);
            return ExitCode::FAILURE;
        }
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            connection::handle_connection(stream, peer, server, Vec::new(), false).await;
        });
    }
}

/// Performs the replica-side handshake against the configured primary,
/// loads the received snapshot into the local keyspace, adopts the
/// primary's replication ID, and hands the live connection off to the
/// normal connection loop with replies suppressed: commands arriving from
/// the primary mutate state but never get a wire reply.
async fn connect_to_primary(
    primary: &config::PrimaryAddr,
    self_port: u16,
    server: &Arc<Server>,
) -> Result<(), error::HandshakeError> {
    let outcome = replication::handshake(&primary.host, primary.port, self_port).await?;

    let (keyspace, err) = snapshot::load(&outcome.snapshot_bytes);
    if let Some(e) = err {
        info!("snapshot received from primary was partially decoded: {e}");
    }
    server.keyspace.lock().unwrap().replace(keyspace);
    server.set_replid(outcome.primary_replid);
    info!("replica handshake complete, connected to {}:{}", primary.host, primary.port);

    let server = server.clone();
    tokio::spawn(async move {
        let peer = outcome
            .stream
            .peer_addr()
            .unwrap_or_else(|_| ([0, 0, 0, 0], 0).into());
        connection::handle_connection(outcome.stream, peer, server, outcome.leftover, true).await;
    });

    Ok(())
}
