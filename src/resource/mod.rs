//! Typed slot inventory, in-process arbitration and the cross-process broker

mod arbiter;
mod broker;
mod codec;
mod pool;
mod snapshot;

pub use arbiter::{PoolUsage, ResourceArbiter, DEFAULT_MAX_BYPASS};
pub use broker::{BrokerClient, BrokerRequest, BrokerResponse, Rendezvous, ResourceBroker};
pub use codec::BincodeCodec;
pub use pool::{AllocationRequest, GrantItem, ResourceGrant, ResourcePool};
pub use snapshot::{AdditionalProperties, PoolSnapshot, SlotSpec};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ResourceError;
use crate::models::ResourceDemand;

/// Whatever the driver allocates from: an in-process arbiter or a remote broker
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// `Ok(false)` for insufficient capacity, an error for an undeclared type
    async fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ResourceError>;

    /// Block until the request is granted, fails, or `cancel` fires
    async fn allocate(
        &self,
        request: AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, ResourceError>;

    async fn release(&self, grant: &ResourceGrant) -> Result<(), ResourceError>;

    async fn snapshot(&self) -> Result<PoolSnapshot, ResourceError>;

    async fn usage(&self) -> Result<PoolUsage, ResourceError>;
}

#[async_trait]
impl ResourceProvider for ResourceArbiter {
    async fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ResourceError> {
        Ok(ResourceArbiter::satisfiable(self, demands).await?)
    }

    async fn allocate(
        &self,
        request: AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, ResourceError> {
        ResourceArbiter::allocate(self, request, cancel).await
    }

    async fn release(&self, grant: &ResourceGrant) -> Result<(), ResourceError> {
        ResourceArbiter::release(self, grant.id).await
    }

    async fn snapshot(&self) -> Result<PoolSnapshot, ResourceError> {
        Ok(ResourceArbiter::snapshot(self).await)
    }

    async fn usage(&self) -> Result<PoolUsage, ResourceError> {
        Ok(ResourceArbiter::usage(self).await)
    }
}

#[async_trait]
impl ResourceProvider for BrokerClient {
    async fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ResourceError> {
        BrokerClient::satisfiable(self, demands).await
    }

    async fn allocate(
        &self,
        request: AllocationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant, ResourceError> {
        BrokerClient::allocate(self, request, cancel).await
    }

    async fn release(&self, grant: &ResourceGrant) -> Result<(), ResourceError> {
        BrokerClient::release(self, grant.id).await
    }

    async fn snapshot(&self) -> Result<PoolSnapshot, ResourceError> {
        BrokerClient::snapshot(self).await
    }

    async fn usage(&self) -> Result<PoolUsage, ResourceError> {
        BrokerClient::usage(self).await
    }
}
