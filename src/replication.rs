//! Replication state machine: the primary-side replica registry and
//! broadcast, and the replica-side outbound handshake against a primary.
//!
//! Propagation is fire-and-forget: no offset tracking, no partial resync,
//! no backlog. A replica that falls behind or disconnects is simply
//! dropped from the registry.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::HandshakeError;
use crate::protocol::Frame;

const REPLID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const REPLID_LEN: usize = 40;

/// Generates a random 40-character alphanumeric replication ID.
pub fn generate_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..REPLID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..REPLID_CHARSET.len());
            REPLID_CHARSET[idx] as char
        })
        .collect()
}

/// A primary's handle onto one attached replica connection: a channel that
/// feeds the replica's dedicated forwarding task, which owns the actual
/// socket write half.
pub struct ReplicaHandle {
    pub addr: SocketAddr,
    pub sender: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
pub struct ReplicationRegistry {
    pub replicas: Vec<ReplicaHandle>,
}

impl ReplicationRegistry {
    pub fn register(&mut self, addr: SocketAddr) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replicas.push(ReplicaHandle { addr, sender: tx });
        rx
    }

    pub fn deregister(&mut self, addr: SocketAddr) {
        self.replicas.retain(|r| r.addr != addr);
    }

    /// Best-effort broadcast of raw, already-encoded command bytes to every
    /// attached replica. A replica whose forwarding task has gone away is
    /// dropped from the registry; no error is surfaced to the caller.
    pub fn propagate(&mut self, raw: &[u8]) {
        if self.replicas.is_empty() {
            return;
        }
        let bytes = Bytes::copy_from_slice(raw);
        self.replicas
            .retain(|r| r.sender.send(bytes.clone()).is_ok());
    }

    pub fn connected_count(&self) -> usize {
        self.replicas.len()
    }
}

/// Everything learned from a completed replica-side handshake: the leftover
/// unconsumed bytes (if the primary pipelined a command right behind the
/// snapshot) seed the connection handler's read buffer so nothing is
/// dropped on the floor.
pub struct HandshakeOutcome {
    pub stream: TcpStream,
    pub leftover: Vec<u8>,
    pub primary_replid: String,
    pub snapshot_bytes: Vec<u8>,
}

/// A tiny buffered reader/writer used only for the handshake, since the
/// handshake must be able to hand back unconsumed bytes to the caller
/// afterwards (a `tokio::io::BufReader` would swallow them).
struct HandshakeIo {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl HandshakeIo {
    fn new(stream: TcpStream) -> Self {
        HandshakeIo {
            stream,
            buf: Vec::new(),
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), HandshakeError> {
        self.stream.write_all(&frame.encode()).await?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<(), HandshakeError> {
        let mut tmp = [0u8; 4096];
        let n = self.stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, HandshakeError> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                self.buf.drain(..pos + 2);
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>, HandshakeError> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        let data = self.buf[..n].to_vec();
        self.buf.drain(..n);
        Ok(data)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn expect_reply(line: &str, expected: &str) -> Result<(), HandshakeError> {
    if line == expected {
        Ok(())
    } else {
        Err(HandshakeError::UnexpectedReply(line.to_string()))
    }
}

/// Runs the 4-step replica-side handshake against `host:port`, then reads
/// the FULLRESYNC preamble and the snapshot blob that follows it.
pub async fn handshake(
    host: &str,
    port: u16,
    self_port: u16,
) -> Result<HandshakeOutcome, HandshakeError> {
    let stream = TcpStream::connect((host, port)).await?;
    let mut io = HandshakeIo::new(stream);

    io.write_frame(&Frame::array(vec![Frame::bulk(Bytes::from_static(b"PING"))]))
        .await?;
    expect_reply(&io.read_line().await?, "+PONG")?;

    io.write_frame(&Frame::array(vec![
        Frame::bulk(Bytes::from_static(b"REPLCONF")),
        Frame::bulk(Bytes::from_static(b"listening-port")),
        Frame::bulk(Bytes::from(self_port.to_string())),
    ]))
    .await?;
    expect_reply(&io.read_line().await?, "+OK")?;

    io.write_frame(&Frame::array(vec![
        Frame::bulk(Bytes::from_static(b"REPLCONF")),
        Frame::bulk(Bytes::from_static(b"capa")),
        Frame::bulk(Bytes::from_static(b"psync2")),
    ]))
    .await?;
    expect_reply(&io.read_line().await?, "+OK")?;

    io.write_frame(&Frame::array(vec![
        Frame::bulk(Bytes::from_static(b"PSYNC")),
        Frame::bulk(Bytes::from_static(b"?")),
        Frame::bulk(Bytes::from_static(b"-1")),
    ]))
    .await?;
    let fullresync = io.read_line().await?;
    let primary_replid = parse_fullresync(&fullresync)?;

    let bulk_header = io.read_line().await?;
    let len = parse_bulk_len(&bulk_header)?;
    let snapshot_bytes = io.read_exact_n(len).await?;

    Ok(HandshakeOutcome {
        stream: io.stream,
        leftover: io.buf,
        primary_replid,
        snapshot_bytes,
    })
}

fn parse_fullresync(line: &str) -> Result<String, HandshakeError> {
    let mut parts = line.trim_start_matches('+').split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(replid), Some(_offset)) => Ok(replid.to_string()),
        _ => Err(HandshakeError::MalformedFullresync(line.to_string())),
    }
}

fn parse_bulk_len(line: &str) -> Result<usize, HandshakeError> {
    let digits = line
        .strip_prefix('$')
        .ok_or_else(|| HandshakeError::MalformedFullresync(line.to_string()))?;
    digits
        .parse::<usize>()
        .map_err(|_| HandshakeError::MalformedFullresync(line.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replid_is_forty_alphanumeric_chars() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn parses_fullresync_line() {
        let replid = parse_fullresync("+FULLRESYNC abcd1234 0").unwrap();
        assert_eq!(replid, "abcd1234");
    }

    #[test]
    fn rejects_malformed_fullresync_line() {
        assert!(parse_fullresync("+OK").is_err());
    }

    #[test]
    fn parses_bulk_len_header() {
        assert_eq!(parse_bulk_len("$120").unwrap(), 120);
        assert!(parse_bulk_len("120").is_err());
    }
}
