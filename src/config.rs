//! Command-line and config surface, built on `clap`'s derive API.

use std::path::PathBuf;

use clap::Parser;

use crate::error::HandshakeError;

#[derive(Parser, Debug)]
#[command(name = "redis-rekv", about = "A minimal Redis-compatible key/value server")]
pub struct Cli {
    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of a primary to replicate from.
    #[arg(long)]
    pub replicaof: Option<String>,

    /// Directory snapshots are read from and written to.
    #[arg(long, default_value = "/tmp/redis-files")]
    pub dir: String,

    /// Snapshot file name, used for both SAVE and startup load.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

#[derive(Clone, Debug)]
pub struct PrimaryAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub dir: String,
    pub dbfilename: String,
    pub replica_of: Option<PrimaryAddr>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, HandshakeError> {
        let replica_of = match cli.replicaof {
            None => None,
            Some(spec) => Some(parse_replicaof(&spec)?),
        };
        Ok(Config {
            port: cli.port,
            dir: cli.dir,
            dbfilename: cli.dbfilename,
            replica_of,
        })
    }

    pub fn role(&self) -> Role {
        if self.replica_of.is_some() {
            Role::Replica
        } else {
            Role::Primary
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }

    pub fn get(&self, param: &str) -> Option<String> {
        match param {
            "dir" => Some(self.dir.clone()),
            "dbfilename" => Some(self.dbfilename.clone()),
            _ => None,
        }
    }
}

fn parse_replicaof(spec: &str) -> Result<PrimaryAddr, HandshakeError> {
    let mut parts = spec.split_whitespace();
    let host = parts.next();
    let port = parts.next();
    match (host, port, parts.next()) {
        (Some(host), Some(port), None) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| HandshakeError::InvalidReplicaOf(spec.to_string()))?;
            Ok(PrimaryAddr {
                host: host.to_string(),
                port,
            })
        }
        _ => Err(HandshakeError::InvalidReplicaOf(spec.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_valid_replicaof() {
        let addr = parse_replicaof("127.0.0.1 6380").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 6380);
    }

    #[test]
    fn rejects_malformed_replicaof() {
        assert!(parse_replicaof("127.0.0.1").is_err());
        assert!(parse_replicaof("127.0.0.1 abc").is_err());
        assert!(parse_replicaof("127.0.0.1 6380 extra").is_err());
    }
}
