//! Directory of logged-in clients.
//!
//! Each registered client owns a bundle holding its key, login identifier
//! and the write half of its connection. Workers look bundles up by key to
//! deliver answers; the connection handler removes its bundle on close.

use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

/// Write half of a client connection.
pub type ClientSink = Box<dyn Write + Send>;

/// A single registered client.
pub struct ClientBundle {
    /// Key derived from the login identifier.
    pub key: u64,
    /// Login identifier.
    pub id: String,
    sink: Mutex<ClientSink>,
}

impl ClientBundle {
    pub fn new(key: u64, id: impl Into<String>, sink: ClientSink) -> Self {
        Self {
            key,
            id: id.into(),
            sink: Mutex::new(sink),
        }
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// Everything written inside one call reaches the client contiguously.
    pub fn write_with<R>(&self, f: impl FnOnce(&mut dyn Write) -> R) -> R {
        let mut sink = self.sink.lock();
        f(sink.as_mut())
    }
}

/// Directory operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("id {0} already in use")]
    DuplicateKey(u64),
    #[error("directory full ({0} clients)")]
    DirectoryFull(usize),
    #[error("no client with key {0}")]
    NotFound(u64),
}

/// Registry of logged-in clients.
///
/// A linear table behind one reader/writer lock: lookups share the read
/// side, insert and remove take the write side.
pub struct ClientDirectory {
    clients: RwLock<Vec<Arc<ClientBundle>>>,
    max_clients: usize,
}

impl ClientDirectory {
    /// Create a new directory with specified maximum capacity.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: RwLock::new(Vec::with_capacity(max_clients)),
            max_clients,
        }
    }

    /// Register a client.
    ///
    /// The duplicate check and the insertion happen under the same write
    /// lock, so two inserts of one key can never both succeed.
    pub fn insert(&self, bundle: ClientBundle) -> Result<Arc<ClientBundle>, DirectoryError> {
        let mut clients = self.clients.write();

        if clients.iter().any(|c| c.key == bundle.key) {
            warn!(key = bundle.key, id = %bundle.id, "Client id already in use");
            return Err(DirectoryError::DuplicateKey(bundle.key));
        }
        if clients.len() >= self.max_clients {
            warn!(max_clients = self.max_clients, "Client directory full");
            return Err(DirectoryError::DirectoryFull(self.max_clients));
        }

        let bundle = Arc::new(bundle);
        clients.push(Arc::clone(&bundle));
        debug!(key = bundle.key, id = %bundle.id, registered = clients.len(), "Client registered");
        Ok(bundle)
    }

    /// Find the bundle registered under `key`.
    pub fn lookup(&self, key: u64) -> Option<Arc<ClientBundle>> {
        self.clients
            .read()
            .iter()
            .find(|c| c.key == key)
            .map(Arc::clone)
    }

    /// Unregister `key`, handing its bundle to the caller.
    ///
    /// The last entry takes the freed slot, so table order is not stable.
    pub fn remove(&self, key: u64) -> Result<Arc<ClientBundle>, DirectoryError> {
        let mut clients = self.clients.write();
        let Some(pos) = clients.iter().position(|c| c.key == key) else {
            return Err(DirectoryError::NotFound(key));
        };
        let bundle = clients.swap_remove(pos);
        debug!(key, id = %bundle.id, registered = clients.len(), "Client unregistered");
        Ok(bundle)
    }

    /// Whether `bundle` is still the live registration of its key.
    ///
    /// False once its session has been unregistered, even if a later login
    /// reused the same identifier.
    pub fn is_current(&self, bundle: &Arc<ClientBundle>) -> bool {
        self.clients.read().iter().any(|c| Arc::ptr_eq(c, bundle))
    }

    /// Number of registered clients.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Check if no client is registered.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// In-memory sink whose contents stay readable after being boxed.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MemorySink(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl MemorySink {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub(crate) fn boxed(&self) -> ClientSink {
        Box::new(self.clone())
    }
}

#[cfg(test)]
impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
