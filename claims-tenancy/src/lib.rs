#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod in_memory;

pub use crate::in_memory::InMemorySellerDirectory;

pub type TenantId = String;
pub type SellerId = String;
pub type ConnectionId = String;

pub type TenancyResult<T> = Result<T, TenancyError>;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// A seller's connected external data source (Amazon SP-API, Gmail, Stripe, ...).
///
/// `provider` is a free-form slug; the specific wire protocol for a provider
/// is a concern of the Provider Adapter, never of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    AmazonSellerCentral,
    Gmail,
    Stripe,
}

impl Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Provider::AmazonSellerCentral => "amazon_seller_central",
            Provider::Gmail => "gmail",
            Provider::Stripe => "stripe",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    NeedsReauth,
    Disconnected,
}

/// Opaque, encrypted-at-rest credential bundle. The core never inspects the
/// bytes; encryption/decryption is delegated to the Secret Management
/// collaborator named in the external interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueCredentials(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConnection {
    pub id: ConnectionId,
    pub seller_id: SellerId,
    pub provider: Provider,
    pub credentials: OpaqueCredentials,
    pub scopes: Vec<String>,
    pub status: ConnectionStatus,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seller {
    pub id: SellerId,
    pub tenant_id: TenantId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSellerRequest {
    pub tenant_id: TenantId,
    pub display_name: String,
}

impl CreateSellerRequest {
    pub fn normalize(mut self) -> TenancyResult<Self> {
        if self.tenant_id.trim().is_empty() {
            return Err(TenancyError::Validation("tenant_id cannot be empty".into()));
        }
        self.display_name = self.display_name.trim().to_string();
        if self.display_name.is_empty() {
            return Err(TenancyError::Validation(
                "seller display name cannot be empty".into(),
            ));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSourceRequest {
    pub seller_id: SellerId,
    pub provider: Provider,
    pub credentials: OpaqueCredentials,
    pub scopes: Vec<String>,
}

impl ConnectSourceRequest {
    pub fn normalize(mut self) -> TenancyResult<Self> {
        if self.credentials.0.is_empty() {
            return Err(TenancyError::Validation(
                "credentials cannot be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        self.scopes = self
            .scopes
            .into_iter()
            .map(|scope| scope.trim().to_string())
            .filter(|scope| !scope.is_empty())
            .filter(|scope| seen.insert(scope.clone()))
            .collect();
        Ok(self)
    }
}

/// Ownership and isolation contract: every seller-scoped read or write must
/// flow through this trait so that a caller can never address another
/// seller's records by accident. Concrete stores (ledger, documents,
/// matches) are expected to take a `SellerId` on every operation and this
/// trait is the single place that resolves "does this tenant own this
/// seller" before any of those operations run.
#[async_trait]
pub trait TenancyService: Send + Sync {
    async fn create_seller(&self, request: CreateSellerRequest) -> TenancyResult<Seller>;

    async fn list_sellers(&self, tenant_id: &TenantId) -> TenancyResult<Vec<Seller>>;

    async fn get_seller(&self, tenant_id: &TenantId, seller_id: &SellerId) -> TenancyResult<Seller>;

    /// Authorization check used by every seller-scoped component before it
    /// touches storage. Returns `Rejected` (not `NotFound`) when the seller
    /// exists but belongs to a different tenant, so callers can distinguish
    /// a cross-tenant access attempt from a typo'd id.
    async fn assert_owned(&self, tenant_id: &TenantId, seller_id: &SellerId) -> TenancyResult<()>;

    async fn connect_source(&self, request: ConnectSourceRequest) -> TenancyResult<SourceConnection>;

    async fn list_sources(&self, seller_id: &SellerId) -> TenancyResult<Vec<SourceConnection>>;

    /// Invoked by the Throttled Client after a successful `refresh()` call;
    /// rotates the stored credentials and clears `NeedsReauth`.
    async fn record_refreshed_credentials(
        &self,
        connection_id: &ConnectionId,
        credentials: OpaqueCredentials,
    ) -> TenancyResult<SourceConnection>;

    async fn mark_needs_reauth(&self, connection_id: &ConnectionId) -> TenancyResult<SourceConnection>;

    async fn disconnect_source(&self, connection_id: &ConnectionId) -> TenancyResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_seller_request_normalizes() {
        let result = CreateSellerRequest {
            tenant_id: "tenant-1".into(),
            display_name: "  Acme Storefront  ".into(),
        }
        .normalize()
        .expect("request should normalize");
        assert_eq!(result.display_name, "Acme Storefront");
    }

    #[test]
    fn create_seller_request_rejects_empty_name() {
        let err = CreateSellerRequest {
            tenant_id: "tenant-1".into(),
            display_name: "   ".into(),
        }
        .normalize()
        .unwrap_err();
        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[test]
    fn connect_source_request_dedupes_scopes() {
        let result = ConnectSourceRequest {
            seller_id: "seller-1".into(),
            provider: Provider::AmazonSellerCentral,
            credentials: OpaqueCredentials(vec![1, 2, 3]),
            scopes: vec![
                "orders".into(),
                "orders".into(),
                "  ".into(),
                "finance".into(),
            ],
        }
        .normalize()
        .expect("request should normalize");
        assert_eq!(result.scopes, vec!["orders".to_string(), "finance".to_string()]);
    }

    #[test]
    fn provider_display_matches_slug() {
        assert_eq!(Provider::Gmail.to_string(), "gmail");
        assert_eq!(Provider::Stripe.to_string(), "stripe");
    }
}
