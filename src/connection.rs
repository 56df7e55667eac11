//! Connection handler: the per-connection read/decode/dispatch/write loop,
//! built around a growing buffer fed into the incremental
//! [`protocol::decode`] rather than a single fixed-size read.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::commands::{self, ReplyPart};
use crate::protocol::{self, Frame};
use crate::server::Server;

/// Runs the read/decode/dispatch/write loop for one connection.
///
/// `initial_buf` seeds the read buffer with any bytes already read off the
/// wire by a caller that needed to peek ahead (the replica handshake may
/// have pipelined a command right behind the snapshot blob). `suppress_replies`
/// is set for the replica's inbound connection to its primary: commands
/// arriving on that stream mutate the local keyspace but must never
/// generate a wire reply back.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<Server>,
    initial_buf: Vec<u8>,
    suppress_replies: bool,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = initial_buf;
    let mut read_buf = [0u8; 4096];

    loop {
        loop {
            match protocol::decode(&buf) {
                Ok(None) => break,
                Ok(Some((frame, used))) => {
                    let raw = buf[..used].to_vec();
                    buf.drain(..used);

                    match frame {
                        Frame::Array(items) if commands::peek_name(&items).as_deref() == Some("PSYNC") => {
                            run_replica_stream(read_half, write_half, peer, server).await;
                            return;
                        }
                        Frame::Array(items) => {
                            if dispatch_array(&items, &raw, &server, &mut write_half, suppress_replies)
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        _ => {
                            if !suppress_replies
                                && write_half
                                    .write_all(&Frame::error("ERR unknown command").encode())
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("framing error from {peer}: {e}");
                    if !suppress_replies
                        && write_half
                            .write_all(&Frame::error("ERR unknown command").encode())
                            .await
                            .is_err()
                    {
                        return;
                    }
                    buf.clear();
                    break;
                }
            }
        }

        match read_half.read(&mut read_buf).await {
            Ok(0) => {
                debug!("connection {peer} closed");
                return;
            }
            Ok(n) => buf.extend_from_slice(&read_buf[..n]),
            Err(e) => {
                debug!("read error from {peer}: {e}");
                return;
            }
        }
    }
}

async fn dispatch_array(
    items: &[Frame],
    raw: &[u8],
    server: &Arc<Server>,
    write_half: &mut OwnedWriteHalf,
    suppress_replies: bool,
) -> std::io::Result<()> {
    let outcome = match commands::parse(items) {
        Ok(cmd) => commands::execute(&cmd, server),
        Err(e) => commands::CommandOutcome {
            replies: vec![ReplyPart::Frame(commands::error_reply(&e))],
            propagate: false,
        },
    };

    if !suppress_replies {
        for part in &outcome.replies {
            let bytes = match part {
                ReplyPart::Frame(frame) => frame.encode(),
                ReplyPart::Raw(bytes) => bytes.clone(),
            };
            write_half.write_all(&bytes).await?;
        }
    }

    if outcome.propagate {
        server.propagate(raw);
    }
    Ok(())
}

/// Takes over a connection after it issues PSYNC: replies with FULLRESYNC
/// plus the current snapshot, registers the connection as an attached
/// replica, then forwards propagated write commands to it until it
/// disconnects. No ACK or offset tracking.
async fn run_replica_stream(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    peer: SocketAddr,
    server: Arc<Server>,
) {
    let replies = match commands::build_psync_reply(&server) {
        Ok(replies) => replies,
        Err(e) => {
            warn!("failed to build snapshot for replica {peer}: {e}");
            return;
        }
    };
    for part in &replies {
        let bytes = match part {
            ReplyPart::Frame(frame) => frame.encode(),
            ReplyPart::Raw(bytes) => bytes.clone(),
        };
        if write_half.write_all(&bytes).await.is_err() {
            return;
        }
    }
    info!("replica {peer} completed full resync");

    let mut rx = {
        let mut registry = server.replication.lock().unwrap();
        registry.register(peer)
    };

    let mut discard = [0u8; 512];
    loop {
        tokio::select! {
            forwarded = rx.recv() => {
                match forwarded {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            result = read_half.read(&mut discard) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }

    server.replication.lock().unwrap().deregister(peer);
    info!("replica {peer} disconnected");
}
