//! In-memory babble data: who follows whom and what everybody published.
//!
//! Records are created at first login and outlive the connection, so
//! followers keep reading a client's publications after it logs out.
//! Nothing is persisted across restarts.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Global publish order
    pub seq: u64,
    /// Publish time
    pub time: DateTime<Utc>,
    /// Message text
    pub text: String,
}

#[derive(Debug)]
struct ClientRecord {
    id: String,
    publications: Vec<Publication>,
    followed: HashSet<u64>,
    followers: HashSet<u64>,
}

impl ClientRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            publications: Vec::new(),
            followed: HashSet::new(),
            followers: HashSet::new(),
        }
    }
}

/// Public view of one client record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub id: String,
    pub followers: usize,
    pub following: usize,
    pub publications: usize,
}

/// Storage operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("unknown client key {0}")]
    UnknownClient(u64),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub clients: usize,
    pub publications: u64,
}

/// Thread-safe babble storage
pub struct Storage {
    clients: RwLock<HashMap<u64, ClientRecord>>,
    publish_counter: AtomicU64,
}

impl Storage {
    /// Create a new storage instance
    pub fn new() -> Arc<Self> {
        info!("Initializing babble storage");
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            publish_counter: AtomicU64::new(0),
        })
    }

    /// Create the record of `key` unless it already exists.
    ///
    /// Returns true when a new record was created.
    pub fn register(&self, key: u64, id: &str) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(&key) {
            return false;
        }
        clients.insert(key, ClientRecord::new(id));
        debug!(key, id, "Created client record");
        true
    }

    /// Append a message to the publications of `key`.
    pub fn publish(&self, key: u64, text: &str) -> Result<Publication, StorageError> {
        let mut clients = self.clients.write();
        let record = clients
            .get_mut(&key)
            .ok_or(StorageError::UnknownClient(key))?;

        let publication = Publication {
            seq: self.publish_counter.fetch_add(1, Ordering::SeqCst),
            time: Utc::now(),
            text: text.to_string(),
        };
        record.publications.push(publication.clone());
        Ok(publication)
    }

    /// Make `follower` follow `target`. Following twice is a no-op.
    pub fn follow(&self, follower: u64, target: u64) -> Result<(), StorageError> {
        let mut clients = self.clients.write();
        if !clients.contains_key(&follower) {
            return Err(StorageError::UnknownClient(follower));
        }
        let target_record = clients
            .get_mut(&target)
            .ok_or(StorageError::UnknownClient(target))?;
        target_record.followers.insert(follower);

        if let Some(record) = clients.get_mut(&follower) {
            record.followed.insert(target);
        }
        Ok(())
    }

    /// Publications of every client `key` follows, oldest first.
    pub fn timeline(&self, key: u64) -> Result<Vec<Publication>, StorageError> {
        let clients = self.clients.read();
        let record = clients.get(&key).ok_or(StorageError::UnknownClient(key))?;

        let mut timeline: Vec<Publication> = record
            .followed
            .iter()
            .filter_map(|followed| clients.get(followed))
            .flat_map(|followed| followed.publications.iter().cloned())
            .collect();
        timeline.sort_by_key(|p| p.seq);
        Ok(timeline)
    }

    /// Summary of the record of `key`.
    pub fn summary(&self, key: u64) -> Result<ClientSummary, StorageError> {
        let clients = self.clients.read();
        let record = clients.get(&key).ok_or(StorageError::UnknownClient(key))?;
        Ok(ClientSummary {
            id: record.id.clone(),
            followers: record.followers.len(),
            following: record.followed.len(),
            publications: record.publications.len(),
        })
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            clients: self.clients.read().len(),
            publications: self.publish_counter.load(Ordering::SeqCst),
        }
    }
}
