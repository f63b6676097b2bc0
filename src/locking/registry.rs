//! Client registrations: who to tell about a restart so they can reclaim
//! their locks inside the grace period.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::sync_helpers::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub client_id: String,
    /// Host the client asked the monitoring service to watch.
    pub host: String,
    pub privilege_cookie: Vec<u8>,
    /// Where the restart notification is delivered.
    pub callback_endpoint: String,
    pub registered_at: OffsetDateTime,
    pub epoch: u64,
}

#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn put(&self, registration: &ClientRegistration) -> crate::Result<()>;
    async fn remove(&self, client_id: &str) -> crate::Result<()>;
    async fn list(&self) -> crate::Result<Vec<ClientRegistration>>;
}

/// Informs a previously registered client that the server restarted and
/// now runs under `new_epoch`. The transport layer supplies the real
/// implementation.
#[async_trait]
pub trait RestartNotifier: Send + Sync {
    async fn notify_restart(&self, registration: &ClientRegistration, new_epoch: u64);
}

#[derive(Debug, Default)]
pub struct MemoryClientRegistry {
    clients: Mutex<HashMap<String, ClientRegistration>>,
}

impl MemoryClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRegistry for MemoryClientRegistry {
    async fn put(&self, registration: &ClientRegistration) -> crate::Result<()> {
        self.clients
            .lock()
            .await
            .insert(registration.client_id.clone(), registration.clone());
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> crate::Result<()> {
        self.clients.lock().await.remove(client_id);
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<ClientRegistration>> {
        Ok(self.clients.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = MemoryClientRegistry::new();
        registry
            .put(&ClientRegistration {
                client_id: "c1".to_string(),
                host: "client.example".to_string(),
                privilege_cookie: vec![1, 2, 3],
                callback_endpoint: "tcp://client.example:4045".to_string(),
                registered_at: OffsetDateTime::UNIX_EPOCH,
                epoch: 1,
            })
            .await
            .unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);
        registry.remove("c1").await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }
}
