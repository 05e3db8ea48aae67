use async_trait::async_trait;

use crate::context::RequestContext;
use crate::datasource::{DataSourceRef, ResolvedDataSource};
use crate::error::{DatasourceError, PluginError};
use crate::identity::CallerIdentity;
use crate::query::{BackendRequest, QueryDataResponse};
use crate::resource::{ResourceCallRequest, ResourceResponseSender};

/// Client for one plugin backend.
/// Real implementation: `HttpPluginClient`. Test doubles live next to the callers.
///
/// Retries, if any, belong to implementations of this trait; the gateway never
/// retries a failed call.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Execute a batch of queries. The backend may run them in parallel, but
    /// results are keyed by refId.
    async fn query_data(
        &self,
        ctx: &RequestContext,
        request: BackendRequest,
    ) -> Result<QueryDataResponse, PluginError>;

    /// Execute a resource call, writing the response into `sender` as it is produced.
    async fn call_resource(
        &self,
        _ctx: &RequestContext,
        _request: ResourceCallRequest,
        _sender: &mut dyn ResourceResponseSender,
    ) -> Result<(), PluginError> {
        Err(PluginError::NotImplemented)
    }
}

/// Read-mostly lookup of datasources, owned outside the gateway.
///
/// A cache miss is a cold lookup, not an error. `skip_cache` forces the cold path.
#[async_trait]
pub trait DatasourceCache: Send + Sync {
    async fn get(
        &self,
        reference: &DataSourceRef,
        caller: &CallerIdentity,
        skip_cache: bool,
    ) -> Result<ResolvedDataSource, DatasourceError>;
}
