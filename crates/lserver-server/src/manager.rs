//! Server fleet management.
//!
//! The manager owns every server in the process behind integer handles and
//! is the single point of contact for the control plane: stats sampling,
//! context reconfiguration, and shutdown all route through it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use lserver_common::{Config, LserverError, Result, ServerInfo, StatsRecord};

use crate::server::{ManagedServer, Server};
use crate::session::Protocol;

pub type ServerHandle = i32;

struct ManagerInner {
    servers: BTreeMap<ServerHandle, Arc<dyn ManagedServer>>,
    next_handle: ServerHandle,
}

#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                servers: BTreeMap::new(),
                next_handle: 0,
            })),
        }
    }

    /// Starts a server from `config` and registers it.
    pub fn create_server<P, F>(&self, config: Config, make_protocol: F) -> Result<ServerHandle>
    where
        P: Protocol,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let server = Server::start(config, make_protocol)?;
        Ok(self.add_server(server))
    }

    pub fn add_server(&self, server: Arc<dyn ManagedServer>) -> ServerHandle {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.servers.insert(handle, server);
        handle
    }

    pub fn get_server(&self, handle: ServerHandle) -> Result<Arc<dyn ManagedServer>> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .get(&handle)
            .cloned()
            .ok_or(LserverError::BadServerHandle(handle))
    }

    /// One stats record per server; delta fields reset on read.
    pub fn get_stats(&self) -> Vec<StatsRecord> {
        self.servers().iter().map(|s| s.stats()).collect()
    }

    /// One info block per server, one context entry per slot.
    pub fn get_servers_info(&self) -> Vec<ServerInfo> {
        self.servers().iter().map(|s| s.server_info()).collect()
    }

    pub fn stop_server(&self, handle: ServerHandle) -> Result<()> {
        self.get_server(handle)?.stop();
        Ok(())
    }

    /// Stops every server.
    pub fn stop(&self) {
        for server in self.servers() {
            server.stop();
        }
    }

    /// Blocks until every server's dispatch loop has exited.
    pub fn wait(&self) {
        for server in self.servers() {
            server.wait();
        }
    }

    fn servers(&self) -> Vec<Arc<dyn ManagedServer>> {
        self.inner.lock().unwrap().servers.values().cloned().collect()
    }
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handle_is_rejected() {
        let manager = ServerManager::new();
        assert!(matches!(
            manager.get_server(0),
            Err(LserverError::BadServerHandle(0))
        ));
        assert!(manager.get_stats().is_empty());
        assert!(manager.get_servers_info().is_empty());
    }
}
