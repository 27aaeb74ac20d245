//! Build a running audit service from [`Config`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use warden_audit::{AuditOptions, AuditService, AuditStore, KeyManager, KvAuditStore};
use warden_config::{AuditSection, Config, KeysSection, StorageBackend, StorageSection};
use warden_telemetry::{LogConfig, setup_logging};

use crate::error::GatewayResult;
use crate::server::RpcServer;

/// Runtime options from the `[audit]` section.
#[must_use]
pub fn audit_options(section: &AuditSection) -> AuditOptions {
    AuditOptions {
        mandatory: section.mandatory,
        append_timeout: Duration::from_millis(section.append_timeout_ms),
        queue_capacity: section.queue_capacity,
        anchor_interval: section.anchor_interval,
        query_batch_size: section.query_batch_size,
        max_query_limit: section.max_query_limit,
    }
}

/// Open the entry store named by the `[storage]` section.
///
/// # Errors
///
/// Returns an error if a persistent store cannot be opened.
pub fn open_store(section: &StorageSection) -> GatewayResult<Arc<dyn AuditStore>> {
    let store: Arc<dyn AuditStore> = match section.backend {
        StorageBackend::Memory => {
            info!("Audit entries held in memory");
            Arc::new(KvAuditStore::in_memory())
        },
        StorageBackend::Surrealkv => {
            std::fs::create_dir_all(&section.path)?;
            info!(path = %section.path.display(), "Opening audit store");
            Arc::new(KvAuditStore::open(&section.path)?)
        },
    };
    Ok(store)
}

/// Load or create the signing keys named by the `[keys]` section.
///
/// # Errors
///
/// Returns an error if the key directory cannot be read or written.
pub fn open_keys(section: &KeysSection) -> GatewayResult<Arc<KeyManager>> {
    if section.ephemeral {
        return Ok(Arc::new(KeyManager::ephemeral()));
    }
    Ok(Arc::new(KeyManager::open(&section.directory)?))
}

/// Install the global tracing subscriber from the `[logging]` section.
///
/// # Errors
///
/// Returns an error if the section is invalid or a subscriber is already
/// installed.
pub fn init_logging(config: &Config) -> GatewayResult<()> {
    let log_config = LogConfig::from_section(&config.logging)?;
    setup_logging(&log_config)?;
    Ok(())
}

/// The audit service and, when enabled, its RPC server.
pub struct Gateway {
    service: Arc<AuditService>,
    store: Arc<dyn AuditStore>,
    server: Option<RpcServer>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("service", &self.service)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Open storage and keys, start the audit service and, if
    /// `[gateway] enabled`, the RPC server.
    ///
    /// Logging is not touched; call [`init_logging`] first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if any part fails to start.
    pub async fn start(config: &Config) -> GatewayResult<Self> {
        let store = open_store(&config.storage)?;
        let keys = open_keys(&config.keys)?;
        let service = AuditService::builder(Arc::clone(&store))
            .keys(keys)
            .options(audit_options(&config.audit))
            .start()
            .await?;
        let service = Arc::new(service);

        let server = if config.gateway.enabled {
            Some(RpcServer::start(Arc::clone(&service), &config.gateway.bind).await?)
        } else {
            None
        };

        Ok(Self {
            service,
            store,
            server,
        })
    }

    /// The audit service, for producers.
    #[must_use]
    pub fn service(&self) -> &Arc<AuditService> {
        &self.service
    }

    /// Where the RPC server listens, if it runs.
    #[must_use]
    pub fn rpc_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(RpcServer::local_addr)
    }

    /// Stop the RPC server, shut the audit service down and close the
    /// store.
    pub async fn shutdown(self) {
        if let Some(server) = self.server {
            server.stop().await;
        }
        self.service.shutdown().await;
        match self.store.close().await {
            Ok(()) => info!("Audit store closed"),
            Err(e) => warn!(error = %e, "Failed to close audit store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use warden_audit::{HandlerAction, Outcome, VerifyRange};
    use warden_config::GatewaySection;

    use super::*;

    fn persistent_config(dir: &std::path::Path) -> Config {
        Config {
            storage: StorageSection {
                backend: StorageBackend::Surrealkv,
                path: dir.join("audit"),
            },
            keys: KeysSection {
                directory: dir.join("keys"),
                ephemeral: false,
            },
            gateway: GatewaySection {
                enabled: false,
                ..GatewaySection::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_options_from_section() {
        let config = Config::from_toml_str(
            "[audit]\nmandatory = true\nappend_timeout_ms = 250\nmax_query_limit = 50\n",
        )
        .unwrap();
        let options = audit_options(&config.audit);
        assert!(options.mandatory);
        assert_eq!(options.append_timeout, Duration::from_millis(250));
        assert_eq!(options.max_query_limit, 50);
        assert_eq!(options.queue_capacity, 4096);
    }

    #[tokio::test]
    async fn test_start_without_server() {
        let config = Config::from_toml_str(
            "[keys]\nephemeral = true\n\n[gateway]\nenabled = false\n",
        )
        .unwrap();
        let gateway = Gateway::start(&config).await.unwrap();
        assert!(gateway.rpc_addr().is_none());

        gateway
            .service()
            .log_action(HandlerAction::Observe, "h", warden_test::sample_context(), Outcome::Success)
            .await
            .unwrap();
        assert_eq!(gateway.service().stats().entries_committed, 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_over_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = persistent_config(dir.path());

        let gateway = Gateway::start(&config).await.unwrap();
        gateway
            .service()
            .log_action(HandlerAction::Memorize, "h", warden_test::sample_context(), Outcome::Success)
            .await
            .unwrap();
        gateway.shutdown().await;

        // Reopening the same directory needs the first store closed.
        let gateway = Gateway::start(&config).await.unwrap();
        // One action plus the shutdown event.
        assert_eq!(gateway.service().head().unwrap().sequence, 1);
        let report = gateway
            .service()
            .verifier()
            .verify(VerifyRange::all())
            .await
            .unwrap();
        assert!(report.verified, "issues: {:?}", report.issues);
        assert_eq!(report.total_entries, 2);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let section = KeysSection {
            directory: dir.path().join("keys"),
            ephemeral: false,
        };
        let first = open_keys(&section).unwrap().active_key().unwrap();
        let second = open_keys(&section).unwrap().active_key().unwrap();
        assert_eq!(first.key_id, second.key_id);
    }
}
