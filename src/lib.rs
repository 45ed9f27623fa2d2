//! Valet core: order lifecycle, loyalty ledger and offline sync for a
//! garment-care shop terminal.
//!
//! The embedding application (UI, HTTP front end) talks to [`OrderService`].
//! Writes are attempted against the remote store first; when it cannot be
//! reached they are saved locally and replayed by the background sync loop.

use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod config;
mod customers;
pub mod db;
pub mod error;
pub mod ledger;
mod locks;
pub mod logging;
pub mod models;
pub mod orders;
pub mod queue;
pub mod remote;
pub mod sequence;
pub mod sync;

pub use api::HttpRemoteStore;
pub use config::Config;
pub use error::{CoreError, CoreResult, RemoteError, ValidationError};
pub use ledger::LoyaltyLedger;
pub use models::{
    Customer, CustomerRef, LedgerEffect, LedgerResult, LineItem, LoyaltyRecord, NumberingTier,
    Order, OrderStatus, PaymentMethod, SaveState,
};
pub use orders::{
    CreateOrderOutcome, CreateOrderRequest, OrderService, TransitionExtra, TransitionOutcome,
};
pub use queue::{DeadLetter, MutationKind, MutationPayload, PendingMutation, PendingQueue};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use sequence::{AllocatedNumber, SequenceAllocator};
pub use sync::{start_sync_loop, Reconciler, SyncReport, SyncStatus};

/// A running core: the order service plus its background sync loop.
pub struct ValetCore {
    service: Arc<OrderService>,
    config: Config,
    token: CancellationToken,
    sync_handle: JoinHandle<()>,
}

impl ValetCore {
    /// Open the local database under `data_dir`, wire the services to
    /// `remote`, and start the sync loop. Must be called inside a tokio
    /// runtime.
    pub fn start(data_dir: &Path, remote: Arc<dyn RemoteStore>, mut config: Config) -> CoreResult<Self> {
        let db = Arc::new(db::init(data_dir)?);
        {
            let conn = db.conn.lock()?;
            config.apply_local_settings(&conn);
        }

        let service = Arc::new(OrderService::new(db, remote, &config));
        let token = CancellationToken::new();
        let sync_handle = start_sync_loop(service.reconciler(), config.sync_interval(), token.clone());

        let backlog = service.get_sync_backlog()?;
        info!(
            data_dir = %data_dir.display(),
            backlog,
            version = env!("CARGO_PKG_VERSION"),
            "Valet core started"
        );
        Ok(Self {
            service,
            config,
            token,
            sync_handle,
        })
    }

    /// Start against the hosted backend configured through `VALET_*`
    /// environment variables and local settings.
    pub fn start_with_http(data_dir: &Path) -> CoreResult<Self> {
        let mut config = Config::from_env();
        {
            let db = db::init(data_dir)?;
            let conn = db.conn.lock()?;
            config.apply_local_settings(&conn);
        }
        if !config.is_remote_configured() {
            warn!("Remote store URL or API key missing, refusing to start");
            return Err(RemoteError::Rejected("remote store is not configured".to_string()).into());
        }
        let remote = HttpRemoteStore::from_config(&config)?;
        Self::start(data_dir, Arc::new(remote), config)
    }

    pub fn service(&self) -> &Arc<OrderService> {
        &self.service
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the sync loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.sync_handle.await {
            warn!(error = %e, "Sync loop ended abnormally");
        }
        info!("Valet core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_create_and_shutdown() {
        let dir = std::env::temp_dir().join(format!("valet-core-{}", uuid::Uuid::new_v4()));
        let remote = Arc::new(MemoryRemoteStore::new());

        let core = ValetCore::start(&dir, remote.clone(), Config::default()).unwrap();
        let created = core
            .service()
            .create_order(CreateOrderRequest::new(
                CustomerRef::new("5550100", Some("Ana")),
                vec![LineItem::new("suit", 1, 1500)],
            ))
            .await
            .unwrap();
        assert_eq!(created.save_state, SaveState::Confirmed);
        assert_eq!(created.order.sequence_number, "000001");
        core.shutdown().await;

        // Local state survives a restart.
        let core = ValetCore::start(&dir, remote, Config::default()).unwrap();
        let order = core.service().get_order(&created.order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        core.shutdown().await;

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    #[serial_test::serial]
    fn test_start_with_http_requires_remote_settings() {
        std::env::remove_var("VALET_REMOTE_URL");
        std::env::remove_var("VALET_API_KEY");
        let dir = std::env::temp_dir().join(format!("valet-core-{}", uuid::Uuid::new_v4()));

        let err = ValetCore::start_with_http(&dir).err().unwrap();
        assert!(matches!(err, CoreError::Remote(RemoteError::Rejected(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
