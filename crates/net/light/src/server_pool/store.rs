//! Persistence of server reputation records.

use parking_lot::Mutex;
use reth_light_types::{NodeRecord, PeerId, ReputationRecord};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

/// Errors of a [`ReputationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to access the backing file.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The stored records are corrupt.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A server together with its track record, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredServer {
    /// Where the server can be reached.
    pub record: NodeRecord,
    /// Its track record.
    pub reputation: ReputationRecord,
}

/// Storage of reputation records that outlives the process.
///
/// The server pool loads all records once at startup and saves a record after every transition
/// of that server.
pub trait ReputationStore: fmt::Debug + Send + 'static {
    /// Returns all stored records.
    fn load(&mut self) -> Result<Vec<StoredServer>, StoreError>;

    /// Inserts or replaces the record of the server.
    fn save(&mut self, server: &StoredServer) -> Result<(), StoreError>;
}

/// Keeps records in memory only.
///
/// Clones share the same records, which lets tests inspect what the pool saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryReputationStore {
    servers: Arc<Mutex<HashMap<PeerId, StoredServer>>>,
}

impl MemoryReputationStore {
    /// Returns a store that starts with the given records.
    pub fn with_servers(servers: impl IntoIterator<Item = StoredServer>) -> Self {
        let servers = servers.into_iter().map(|server| (server.record.id, server)).collect();
        Self { servers: Arc::new(Mutex::new(servers)) }
    }

    /// Returns the stored record of the server.
    pub fn get(&self, id: &PeerId) -> Option<StoredServer> {
        self.servers.lock().get(id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    /// Returns `true` if nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }
}

impl ReputationStore for MemoryReputationStore {
    fn load(&mut self) -> Result<Vec<StoredServer>, StoreError> {
        Ok(self.servers.lock().values().cloned().collect())
    }

    fn save(&mut self, server: &StoredServer) -> Result<(), StoreError> {
        self.servers.lock().insert(server.record.id, server.clone());
        Ok(())
    }
}

/// Keeps records in a JSON file.
///
/// The file is rewritten on every save by writing a sibling file and renaming it over the old
/// one, so a crash never leaves a partially written file behind.
#[derive(Debug)]
pub struct FileReputationStore {
    path: PathBuf,
    servers: HashMap<PeerId, StoredServer>,
}

impl FileReputationStore {
    /// Creates a store backed by the file at the given path.
    ///
    /// The file is only touched on [`ReputationStore::load`] and [`ReputationStore::save`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), servers: HashMap::new() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut servers = self.servers.values().collect::<Vec<_>>();
        servers.sort_unstable_by_key(|server| server.record.id);
        {
            let mut writer = BufWriter::new(std::fs::File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &servers)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ReputationStore for FileReputationStore {
    fn load(&mut self) -> Result<Vec<StoredServer>, StoreError> {
        let reader = match std::fs::File::open(&self.path) {
            Ok(file) => io::BufReader::new(file),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(target: "net::light::pool", file=%self.path.display(), "no saved servers");
                return Ok(Vec::new())
            }
            Err(e) => Err(e)?,
        };
        info!(target: "net::light::pool", file=%self.path.display(), "Loading saved servers");
        let servers: Vec<StoredServer> = serde_json::from_reader(reader)?;
        self.servers = servers.iter().map(|server| (server.record.id, server.clone())).collect();
        Ok(servers)
    }

    fn save(&mut self, server: &StoredServer) -> Result<(), StoreError> {
        self.servers.insert(server.record.id, server.clone());
        self.write()
    }
}
