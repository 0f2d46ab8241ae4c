//! Client registry
//!
//! Maintains a group of [`OverlayClient`] instances for applications that
//! manage several identities together. Callers construct their own
//! registries; there is no process-wide default.

use crate::client::OverlayClient;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, OverlayClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Registering a different instance under an existing
    /// id closes the replaced instance.
    pub async fn add(&self, client: OverlayClient) {
        let id = client.id().to_string();
        let replaced = match self.clients.entry(id) {
            Entry::Occupied(mut occupied) => {
                if Arc::ptr_eq(&occupied.get().inner, &client.inner) {
                    None
                } else {
                    Some(occupied.insert(client))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(client);
                None
            }
        };

        if let Some(replaced) = replaced {
            replaced.close().await;
        }
    }

    /// Remove a client. It is not closed or altered in any way.
    pub fn remove(&self, client: &OverlayClient) {
        self.clients.remove(client.id());
    }

    /// Remove a client by id. It is not closed or altered in any way.
    pub fn remove_by_id(&self, id: &str) -> Option<OverlayClient> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    pub fn get(&self, id: &str) -> Option<OverlayClient> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Call `f` on every registered client.
    pub fn for_each(&self, mut f: impl FnMut(&OverlayClient)) {
        for entry in self.clients.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
