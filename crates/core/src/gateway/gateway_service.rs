use log::{debug, warn};
use std::sync::Arc;

use super::gateway_model::{CachedResponse, GatewayOutcome, GatewayRequest, GatewayResponse};
use super::gateway_traits::{
    GatewayTransportTrait, RequestQueueRepositoryTrait, ResponseCacheRepositoryTrait,
};
use crate::errors::{Error, Result};
use crate::sync::{ConnectivityMonitor, DeliveryError, SyncRetryClass};
use crate::utils::time_utils::{add_seconds, now_millis};

/// Read-through cache and write queue for resources the entity store does not mirror.
pub struct OfflineGateway {
    transport: Arc<dyn GatewayTransportTrait>,
    cache: Arc<dyn ResponseCacheRepositoryTrait>,
    requests: Arc<dyn RequestQueueRepositoryTrait>,
    connectivity: ConnectivityMonitor,
    /// `None` keeps cached responses until replaced.
    cache_ttl_secs: Option<i64>,
}

impl OfflineGateway {
    pub fn new(
        transport: Arc<dyn GatewayTransportTrait>,
        cache: Arc<dyn ResponseCacheRepositoryTrait>,
        requests: Arc<dyn RequestQueueRepositoryTrait>,
        connectivity: ConnectivityMonitor,
        cache_ttl_secs: Option<i64>,
    ) -> Self {
        Self {
            transport,
            cache,
            requests,
            connectivity,
            cache_ttl_secs: cache_ttl_secs.filter(|ttl| *ttl > 0),
        }
    }

    pub async fn execute(&self, request: GatewayRequest) -> Result<GatewayOutcome> {
        request.validate()?;
        if request.method.is_read() {
            self.read(request).await
        } else {
            self.write(request).await
        }
    }

    async fn read(&self, request: GatewayRequest) -> Result<GatewayOutcome> {
        let key = request.request_key();
        if !self.connectivity.is_online() {
            return self.cached_or_unavailable(&key);
        }

        match self.transport.send(&request).await {
            Ok(response) => {
                let now = now_millis();
                self.cache
                    .store_response(CachedResponse {
                        request_key: key,
                        endpoint: request.endpoint.clone(),
                        status: response.status,
                        body: response.body.clone(),
                        cached_at: now,
                        expires_at: self.cache_ttl_secs.map(|ttl| add_seconds(now, ttl)),
                    })
                    .await?;
                Ok(GatewayOutcome::Fresh { response })
            }
            Err(err) => {
                debug!(
                    "[Gateway] GET {} failed ({}); falling back to cache",
                    request.endpoint, err.message
                );
                if err.is_network() {
                    self.connectivity.set_online(false);
                }
                let outcome = self.cached_or_unavailable(&key)?;
                if outcome == GatewayOutcome::UnavailableOffline
                    && err.class == SyncRetryClass::Permanent
                {
                    return Err(rejected(&request, err));
                }
                Ok(outcome)
            }
        }
    }

    async fn write(&self, request: GatewayRequest) -> Result<GatewayOutcome> {
        if !self.connectivity.is_online() {
            return self.enqueue(request).await;
        }

        match self.transport.send(&request).await {
            Ok(response) => Ok(GatewayOutcome::Fresh { response }),
            Err(err) if err.class == SyncRetryClass::Permanent => Err(rejected(&request, err)),
            Err(err) => {
                warn!(
                    "[Gateway] {} {} failed ({}); queued for replay",
                    request.method, request.endpoint, err.message
                );
                if err.is_network() {
                    self.connectivity.set_online(false);
                }
                self.enqueue(request).await
            }
        }
    }

    async fn enqueue(&self, request: GatewayRequest) -> Result<GatewayOutcome> {
        let (entry, created) = self.requests.enqueue_request(request).await?;
        Ok(GatewayOutcome::Queued {
            entry_id: entry.id,
            duplicate: !created,
        })
    }

    fn cached_or_unavailable(&self, key: &str) -> Result<GatewayOutcome> {
        let now = now_millis();
        Ok(match self.cache.get_cached_response(key)? {
            Some(cached) => GatewayOutcome::Cached {
                stale: cached.is_expired(now),
                cached_at: cached.cached_at,
                response: GatewayResponse {
                    status: cached.status,
                    body: cached.body,
                },
            },
            None => GatewayOutcome::UnavailableOffline,
        })
    }

    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cache.cleanup_expired(now_millis()).await
    }
}

fn rejected(request: &GatewayRequest, err: DeliveryError) -> Error {
    Error::Remote(format!(
        "{} {} rejected: {}",
        request.method, request.endpoint, err.message
    ))
}
