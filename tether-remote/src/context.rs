use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::client::BackendClient;
use crate::error::InternalInconsistency;

/// Shared context for everything talking to the backend
///
/// Holds the backend client, which is set once at startup (and never in
/// unmanaged mode), and the flag telling whether startup has completed far
/// enough to accept update notifications.
#[derive(Default)]
pub struct ApiContext {
    client: OnceLock<Arc<dyn BackendClient>>,
    ready_for_updates: AtomicBool,
}

impl ApiContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend client. This can only happen once
    pub fn init_client(&self, client: Arc<dyn BackendClient>) -> Result<(), InternalInconsistency> {
        self.client
            .set(client)
            .map_err(|_| InternalInconsistency::new("API client initialized more than once"))?;
        info!("API client initialized");
        Ok(())
    }

    /// Get the backend client
    ///
    /// `action` describes what the caller was trying to do, and is used to
    /// build the error if the client has not been initialized.
    pub fn client(&self, action: &str) -> Result<Arc<dyn BackendClient>, InternalInconsistency> {
        self.client.get().cloned().ok_or_else(|| {
            InternalInconsistency::new(format!("attempt to {action} without an API client"))
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    pub fn set_ready_for_updates(&self) {
        self.ready_for_updates.store(true, Ordering::Release);
    }

    pub fn ready_for_updates(&self) -> bool {
        self.ready_for_updates.load(Ordering::Acquire)
    }
}
