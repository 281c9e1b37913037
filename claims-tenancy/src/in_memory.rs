use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ConnectSourceRequest;
use crate::ConnectionId;
use crate::ConnectionStatus;
use crate::CreateSellerRequest;
use crate::OpaqueCredentials;
use crate::Seller;
use crate::SellerId;
use crate::SourceConnection;
use crate::TenancyError;
use crate::TenancyResult;
use crate::TenancyService;
use crate::TenantId;

#[derive(Default)]
struct TenancyState {
    sellers: HashMap<SellerId, Seller>,
    connections: HashMap<ConnectionId, SourceConnection>,
}

pub struct InMemorySellerDirectory {
    state: RwLock<TenancyState>,
}

impl InMemorySellerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TenancyState::default()),
        }
    }

    fn generate_seller_id() -> SellerId {
        Uuid::new_v4().to_string()
    }

    fn generate_connection_id() -> ConnectionId {
        Uuid::new_v4().to_string()
    }

    fn require_owned<'a>(
        tenant_id: &TenantId,
        seller_id: &SellerId,
        state: &'a TenancyState,
    ) -> TenancyResult<&'a Seller> {
        let seller = state
            .sellers
            .get(seller_id)
            .ok_or_else(|| TenancyError::NotFound(format!("seller {seller_id}")))?;
        if seller.tenant_id != *tenant_id {
            return Err(TenancyError::Rejected(format!(
                "seller {seller_id} belongs to tenant {}, not {tenant_id}",
                seller.tenant_id
            )));
        }
        Ok(seller)
    }
}

impl Default for InMemorySellerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TenancyService for InMemorySellerDirectory {
    async fn create_seller(&self, request: CreateSellerRequest) -> TenancyResult<Seller> {
        let normalized = request.normalize()?;
        let mut guard = self.state.write().await;
        let seller = Seller {
            id: Self::generate_seller_id(),
            tenant_id: normalized.tenant_id,
            display_name: normalized.display_name,
            created_at: Utc::now(),
        };
        guard.sellers.insert(seller.id.clone(), seller.clone());
        Ok(seller)
    }

    async fn list_sellers(&self, tenant_id: &TenantId) -> TenancyResult<Vec<Seller>> {
        let guard = self.state.read().await;
        let mut sellers: Vec<_> = guard
            .sellers
            .values()
            .filter(|seller| seller.tenant_id == *tenant_id)
            .cloned()
            .collect();
        sellers.sort_by(|left, right| left.display_name.cmp(&right.display_name));
        Ok(sellers)
    }

    async fn get_seller(&self, tenant_id: &TenantId, seller_id: &SellerId) -> TenancyResult<Seller> {
        let guard = self.state.read().await;
        let seller = Self::require_owned(tenant_id, seller_id, &guard)?;
        Ok(seller.clone())
    }

    async fn assert_owned(&self, tenant_id: &TenantId, seller_id: &SellerId) -> TenancyResult<()> {
        let guard = self.state.read().await;
        Self::require_owned(tenant_id, seller_id, &guard)?;
        Ok(())
    }

    async fn connect_source(&self, request: ConnectSourceRequest) -> TenancyResult<SourceConnection> {
        let normalized = request.normalize()?;
        let mut guard = self.state.write().await;
        if !guard.sellers.contains_key(&normalized.seller_id) {
            return Err(TenancyError::NotFound(format!(
                "seller {}",
                normalized.seller_id
            )));
        }
        let connection = SourceConnection {
            id: Self::generate_connection_id(),
            seller_id: normalized.seller_id,
            provider: normalized.provider,
            credentials: normalized.credentials,
            scopes: normalized.scopes,
            status: ConnectionStatus::Active,
            last_ok_at: Some(Utc::now()),
            created_at: Utc::now(),
        };
        guard
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(connection)
    }

    async fn list_sources(&self, seller_id: &SellerId) -> TenancyResult<Vec<SourceConnection>> {
        let guard = self.state.read().await;
        let mut connections: Vec<_> = guard
            .connections
            .values()
            .filter(|connection| connection.seller_id == *seller_id)
            .cloned()
            .collect();
        connections.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(connections)
    }

    async fn record_refreshed_credentials(
        &self,
        connection_id: &ConnectionId,
        credentials: OpaqueCredentials,
    ) -> TenancyResult<SourceConnection> {
        let mut guard = self.state.write().await;
        let connection = guard
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| TenancyError::NotFound(format!("connection {connection_id}")))?;
        connection.credentials = credentials;
        connection.status = ConnectionStatus::Active;
        connection.last_ok_at = Some(Utc::now());
        Ok(connection.clone())
    }

    async fn mark_needs_reauth(&self, connection_id: &ConnectionId) -> TenancyResult<SourceConnection> {
        let mut guard = self.state.write().await;
        let connection = guard
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| TenancyError::NotFound(format!("connection {connection_id}")))?;
        connection.status = ConnectionStatus::NeedsReauth;
        Ok(connection.clone())
    }

    async fn disconnect_source(&self, connection_id: &ConnectionId) -> TenancyResult<()> {
        let mut guard = self.state.write().await;
        let connection = guard
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| TenancyError::NotFound(format!("connection {connection_id}")))?;
        connection.status = ConnectionStatus::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectSourceRequest;
    use crate::Provider;
    use pretty_assertions::assert_eq;

    async fn create_seller(service: &InMemorySellerDirectory, tenant: &str, name: &str) -> Seller {
        service
            .create_seller(CreateSellerRequest {
                tenant_id: tenant.into(),
                display_name: name.into(),
            })
            .await
            .expect("create seller")
    }

    #[tokio::test]
    async fn creates_and_lists_sellers_by_tenant() {
        let service = InMemorySellerDirectory::new();
        let _alpha = create_seller(&service, "tenant-a", "Alpha Storefront").await;
        let beta = create_seller(&service, "tenant-a", "Beta Storefront").await;
        let _other_tenant = create_seller(&service, "tenant-b", "Other Storefront").await;

        let sellers = service
            .list_sellers(&"tenant-a".to_string())
            .await
            .expect("list sellers");
        assert_eq!(sellers.len(), 2);
        assert_eq!(sellers[1].id, beta.id);
    }

    #[tokio::test]
    async fn rejects_cross_tenant_access() {
        let service = InMemorySellerDirectory::new();
        let seller = create_seller(&service, "tenant-a", "Alpha Storefront").await;

        let err = service
            .get_seller(&"tenant-b".to_string(), &seller.id)
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::Rejected(_)));

        let err = service
            .assert_owned(&"tenant-b".to_string(), &seller.id)
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::Rejected(_)));
    }

    #[tokio::test]
    async fn connects_and_lists_sources() {
        let service = InMemorySellerDirectory::new();
        let seller = create_seller(&service, "tenant-a", "Alpha Storefront").await;

        let connection = service
            .connect_source(ConnectSourceRequest {
                seller_id: seller.id.clone(),
                provider: Provider::AmazonSellerCentral,
                credentials: OpaqueCredentials(vec![9, 9, 9]),
                scopes: vec!["orders".into()],
            })
            .await
            .expect("connect source");
        assert_eq!(connection.status, ConnectionStatus::Active);

        let sources = service
            .list_sources(&seller.id)
            .await
            .expect("list sources");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, connection.id);
    }

    #[tokio::test]
    async fn refresh_and_reauth_flow() {
        let service = InMemorySellerDirectory::new();
        let seller = create_seller(&service, "tenant-a", "Alpha Storefront").await;
        let connection = service
            .connect_source(ConnectSourceRequest {
                seller_id: seller.id.clone(),
                provider: Provider::Gmail,
                credentials: OpaqueCredentials(vec![1]),
                scopes: vec![],
            })
            .await
            .expect("connect source");

        let flagged = service
            .mark_needs_reauth(&connection.id)
            .await
            .expect("mark needs reauth");
        assert_eq!(flagged.status, ConnectionStatus::NeedsReauth);

        let refreshed = service
            .record_refreshed_credentials(&connection.id, OpaqueCredentials(vec![2]))
            .await
            .expect("record refresh");
        assert_eq!(refreshed.status, ConnectionStatus::Active);
        assert_eq!(refreshed.credentials, OpaqueCredentials(vec![2]));

        service
            .disconnect_source(&connection.id)
            .await
            .expect("disconnect");
        let sources = service.list_sources(&seller.id).await.expect("list");
        assert_eq!(sources[0].status, ConnectionStatus::Disconnected);
    }
}
