//! Process-wide server state threaded explicitly through connection tasks:
//! a struct owning the keyspace, replication registry, replication ID, and
//! configuration. No module-level globals.

use std::sync::Mutex;

use log::{info, warn};

use crate::config::{Config, Role};
use crate::keyspace::Keyspace;
use crate::replication::{self, ReplicationRegistry};

pub struct Server {
    pub config: Config,
    pub keyspace: Mutex<Keyspace>,
    pub replication: Mutex<ReplicationRegistry>,
    pub replid: Mutex<String>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let keyspace = load_initial_keyspace(&config);
        Server {
            config,
            keyspace: Mutex::new(keyspace),
            replication: Mutex::new(ReplicationRegistry::default()),
            replid: Mutex::new(replication::generate_replid()),
        }
    }

    pub fn role(&self) -> Role {
        self.config.role()
    }

    pub fn replid(&self) -> String {
        self.replid.lock().unwrap().clone()
    }

    pub fn set_replid(&self, replid: String) {
        *self.replid.lock().unwrap() = replid;
    }

    /// Forwards raw, already-encoded command bytes to every attached
    /// replica. Synchronous and lock-held-only-briefly: `mpsc::send` never
    /// suspends, so this never awaits while holding the mutex.
    pub fn propagate(&self, raw: &[u8]) {
        self.replication.lock().unwrap().propagate(raw);
    }

    pub fn connected_replicas(&self) -> usize {
        self.replication.lock().unwrap().connected_count()
    }

    /// Serializes the current keyspace to bytes and writes it to the
    /// configured snapshot path. Used both by the SAVE command and by the
    /// PSYNC full-resync transfer (which builds the bytes in memory without
    /// touching disk).
    pub fn save_snapshot_to_disk(&self) -> Result<(), crate::error::SnapshotError> {
        let bytes = {
            let keyspace = self.keyspace.lock().unwrap();
            crate::snapshot::save(&keyspace, &[])?
        };
        std::fs::create_dir_all(&self.config.dir)?;
        std::fs::write(self.config.snapshot_path(), bytes)?;
        Ok(())
    }

    pub fn snapshot_bytes_for_psync(&self) -> Result<Vec<u8>, crate::error::SnapshotError> {
        let keyspace = self.keyspace.lock().unwrap();
        crate::snapshot::save(&keyspace, &[])
    }
}

fn load_initial_keyspace(config: &Config) -> Keyspace {
    let path = config.snapshot_path();
    match std::fs::read(&path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no snapshot at {}, starting with an empty keyspace", path.display());
            Keyspace::new()
        }
        Err(e) => {
            warn!("snapshot at {} unreadable ({e}), starting with an empty keyspace", path.display());
            Keyspace::new()
        }
        Ok(bytes) => {
            let (keyspace, err) = crate::snapshot::load(&bytes);
            match err {
                None => {
                    info!("loaded {} keys from {}", keyspace.len(), path.display());
                }
                Some(crate::error::SnapshotError::ChecksumMismatch) => {
                    warn!(
                        "snapshot at {} failed checksum verification, keeping {} decoded keys",
                        path.display(),
                        keyspace.len()
                    );
                }
                Some(e) => {
                    warn!(
                        "snapshot at {} is malformed ({e}), continuing with {} partially-decoded keys",
                        path.display(),
                        keyspace.len()
                    );
                }
            }
            keyspace
        }
    }
}
