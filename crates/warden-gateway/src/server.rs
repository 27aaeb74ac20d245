//! JSON-RPC server over an [`AuditService`].

use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_audit::{
    AuditError, AuditQuery, AuditService, SortOrder, TimeRange, VerificationReport,
};

use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{AuditEntriesResponse, AuditEntryView, AuditRpcServer, error_codes};

/// Page size when the caller names none.
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// The jsonrpsee method handler.
pub(crate) struct RpcImpl {
    service: Arc<AuditService>,
}

impl RpcImpl {
    pub(crate) fn new(service: Arc<AuditService>) -> Self {
        Self { service }
    }
}

/// Map an audit error onto a JSON-RPC error object.
pub(crate) fn rpc_error(err: &AuditError) -> ErrorObjectOwned {
    let code = match err {
        AuditError::EntryNotFound { .. } => error_codes::ENTRY_NOT_FOUND,
        AuditError::ShuttingDown => error_codes::SHUTTING_DOWN,
        AuditError::Encoding(_) => error_codes::INVALID_REQUEST,
        _ => error_codes::INTERNAL_ERROR,
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}

#[jsonrpsee::core::async_trait]
impl AuditRpcServer for RpcImpl {
    async fn entries(
        &self,
        entity_id: Option<String>,
        hours: Option<u32>,
        action_types: Option<Vec<String>>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<AuditEntriesResponse, ErrorObjectOwned> {
        let mut query = AuditQuery::new();
        if let Some(entity_id) = entity_id {
            query = query.for_entity(entity_id);
        }
        if let Some(hours) = hours {
            query = query.within(TimeRange::last_hours(hours, chrono::Utc::now()));
        }
        if let Some(types) = action_types
            && !types.is_empty()
        {
            query = query.with_action_types(types);
        }

        let page = self
            .service
            .query_page(
                &query,
                offset.unwrap_or(0),
                limit.unwrap_or(DEFAULT_PAGE_SIZE),
                SortOrder::Descending,
            )
            .await
            .map_err(|e| rpc_error(&e))?;
        debug!(total = page.total, returned = page.entries.len(), "Served audit entries");

        Ok(AuditEntriesResponse {
            entries: page.entries.into_iter().map(AuditEntryView::from).collect(),
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn verify(&self) -> Result<VerificationReport, ErrorObjectOwned> {
        self.service
            .verify_audit_integrity()
            .await
            .map_err(|e| rpc_error(&e))
    }

    async fn entry(&self, id: Uuid) -> Result<AuditEntryView, ErrorObjectOwned> {
        self.service
            .get_entry(&id)
            .await
            .map(AuditEntryView::from)
            .map_err(|e| rpc_error(&e))
    }
}

/// A running RPC server.
#[derive(Debug)]
pub struct RpcServer {
    handle: ServerHandle,
    addr: SocketAddr,
}

impl RpcServer {
    /// Bind `bind` and serve `service` over HTTP and `WebSocket`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Runtime`] if the address cannot be bound.
    pub async fn start(service: Arc<AuditService>, bind: &str) -> GatewayResult<Self> {
        let server = Server::builder()
            .build(bind)
            .await
            .map_err(|e| GatewayError::Runtime(format!("Failed to bind server: {e}")))?;
        let addr = server
            .local_addr()
            .map_err(|e| GatewayError::Runtime(format!("Failed to get address: {e}")))?;

        let handle = server.start(RpcImpl::new(service).into_rpc());
        info!(addr = %addr, "Audit RPC server started");
        Ok(Self { handle, addr })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the server to finish.
    pub async fn stop(self) {
        if self.handle.stop().is_err() {
            warn!(addr = %self.addr, "Audit RPC server already stopped");
        }
        self.handle.stopped().await;
        info!(addr = %self.addr, "Audit RPC server stopped");
    }
}
