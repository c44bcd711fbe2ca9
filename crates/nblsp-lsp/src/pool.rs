//! One connection per language.
//!
//! Each language gets a slot guarded by an async mutex. Concurrent
//! requests for the same language queue on the slot, so only the first
//! opens a transport and the rest receive the same [`LspConnection`].
//! Different languages never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

use crate::LspResult;
use crate::connection::{ConnectionOptions, LspConnection};
use crate::transport::TransportConnector;

type Slot = Arc<AsyncMutex<Option<Arc<LspConnection>>>>;

/// Shares connections between every document of a language.
pub struct ConnectionPool {
    connector: Arc<dyn TransportConnector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, language: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(language.to_string())
            .or_default()
            .clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The live connection for the endpoint's language, opening one if
    /// there is none or the previous one failed.
    pub async fn get_or_connect(&self, options: ConnectionOptions) -> LspResult<Arc<LspConnection>> {
        let language = options.endpoint.language.clone();
        let slot = self.slot(&language);
        let mut current = slot.lock().await;

        if let Some(connection) = current.as_ref() {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
            tracing::debug!("Replacing {:?} connection for {}", connection.state(), language);
        }

        let connection = LspConnection::open(self.connector.as_ref(), options).await?;
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// The pooled connection for `language`, live or not.
    pub async fn get(&self, language: &str) -> Option<Arc<LspConnection>> {
        let slot = self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(language)
            .cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Forgets the connection for `language` without closing it.
    pub async fn remove(&self, language: &str) -> Option<Arc<LspConnection>> {
        let slot = self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(language)
            .cloned()?;
        let mut current = slot.lock().await;
        current.take()
    }

    pub async fn connections(&self) -> Vec<Arc<LspConnection>> {
        let mut connections = Vec::new();
        for slot in self.all_slots() {
            if let Some(connection) = slot.lock().await.clone() {
                connections.push(connection);
            }
        }
        connections
    }

    /// Closes every connection.
    pub async fn shutdown(&self) {
        for slot in self.all_slots() {
            let connection = slot.lock().await.take();
            if let Some(connection) = connection {
                connection.close().await;
            }
        }
    }
}
