//! Shared server state.

use crate::auth::{AuthProvider, JwtAuthProvider};
use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::Config;
use crate::delivery::MessageDeliveryCoordinator;
use anyhow::{Context, Result};
use parley_core::Hub;
use parley_store::{ChatStore, SqliteStore};
use std::sync::Arc;

/// State shared by every handler.
pub struct AppState {
    pub config: Config,
    pub hub: Arc<Hub>,
    pub store: Arc<dyn ChatStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub delivery: MessageDeliveryCoordinator,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Assemble state from already-built collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn ChatStore>,
        auth: Arc<dyn AuthProvider>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let hub = Arc::new(Hub::new(config.hub_config()));
        let delivery =
            MessageDeliveryCoordinator::new(Arc::clone(&store), Arc::clone(&hub), Arc::clone(&blobs));
        Self {
            config,
            hub,
            store,
            auth,
            blobs,
            delivery,
        }
    }

    /// Open the database and build the default collaborators from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = SqliteStore::connect(&config.database.url, config.database.max_connections)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;
        let auth = JwtAuthProvider::from_config(&config.auth);
        let blobs = LocalBlobStore::new(config.uploads.dir.clone());

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(auth),
            Arc::new(blobs),
        ))
    }
}
