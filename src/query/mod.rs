//! Query fan-out for `POST /api/ds/query` and `POST /api/ds/transform`.
//!
//! Both modes follow the same chain: parse and validate the batch, resolve
//! the first datasource, build one [`BackendRequest`], dispatch it once, and
//! aggregate the per-refId results. A failure at any step ends the request
//! with a single error; per-query errors inside a successful dispatch are
//! carried in the envelope instead.

pub mod request;
pub mod response;

use std::sync::Arc;

use chrono::Utc;
use gateway_common::datasource::EXPRESSION_DATASOURCE_NAME;
use gateway_common::{
    BackendQuery, BackendRequest, CallerIdentity, GatewayError, PluginClient, QueryDescriptor,
    RequestContext, ResolvedDataSource,
};
use tracing::{debug, info};

use crate::datasource::{DatasourceResolver, Resolution};
use crate::plugin::PluginClients;

pub use request::{MetricQuery, MetricRequest, ParsedBatch, TimeValue};
pub use response::{ResponseAggregator, ResponseEnvelope};

#[derive(Clone)]
pub struct QueryCoordinator {
    resolver: DatasourceResolver,
    plugins: Arc<PluginClients>,
    expressions_enabled: bool,
}

impl QueryCoordinator {
    pub fn new(
        resolver: DatasourceResolver,
        plugins: Arc<PluginClients>,
        expressions_enabled: bool,
    ) -> Self {
        Self {
            resolver,
            plugins,
            expressions_enabled,
        }
    }

    /// Query mode. Every query is sent to the plugin of the first query's datasource.
    pub async fn query(
        &self,
        ctx: &RequestContext,
        caller: &CallerIdentity,
        request: MetricRequest,
    ) -> Result<ResponseEnvelope, GatewayError> {
        let batch = request.clone().parse(Utc::now())?;
        let first = &batch.queries[0];

        let datasource = match self.resolver.resolve(&first.datasource, caller, false).await? {
            Resolution::DataSource(ds) => ds,
            Resolution::Expression => {
                debug!(
                    request_id = %ctx.request_id,
                    "batch starts with an expression; using transform mode"
                );
                return self.transform(ctx, caller, request).await;
            }
        };

        let client = self.plugins.get(&datasource.ds_type).ok_or_else(|| {
            GatewayError::NotFound(format!("Plugin {} not found", datasource.ds_type))
        })?;

        let expected = batch.queries.iter().map(|q| q.ref_id.clone()).collect::<Vec<_>>();
        let queries = batch
            .queries
            .into_iter()
            .map(|query| BackendQuery {
                query,
                datasource: Some(datasource.clone()),
            })
            .collect();
        let backend_request = BackendRequest {
            caller: caller.clone(),
            time_range: batch.time_range,
            queries,
        };

        info!(
            request_id = %ctx.request_id,
            plugin = %datasource.ds_type,
            datasource = %datasource.uid,
            queries = expected.len(),
            "dispatching query batch"
        );
        let response = dispatch(ctx, client.as_ref(), backend_request).await?;
        Ok(ResponseAggregator::aggregate(Some(&expected), response))
    }

    /// Transform mode: the batch goes to the expression backend.
    pub async fn transform(
        &self,
        ctx: &RequestContext,
        caller: &CallerIdentity,
        request: MetricRequest,
    ) -> Result<ResponseEnvelope, GatewayError> {
        let client = match self.plugins.transform() {
            Some(client) if self.expressions_enabled => client,
            _ => {
                return Err(GatewayError::NotFound(
                    "Expressions feature is not enabled".into(),
                ));
            }
        };

        for query in &request.queries {
            if query.datasource_name().is_none() {
                return Err(GatewayError::BadRequest(format!(
                    "query '{}' is missing a datasource name",
                    query.ref_id
                )));
            }
        }
        let is_expression: Vec<bool> = request
            .queries
            .iter()
            .map(|q| q.datasource_name() == Some(EXPRESSION_DATASOURCE_NAME))
            .collect();

        let batch = request.parse(Utc::now())?;
        if !is_expression.contains(&true) {
            return Err(GatewayError::BadRequest("no expression queries found".into()));
        }

        let datasource = match batch
            .queries
            .iter()
            .zip(&is_expression)
            .find(|(_, expression)| !**expression)
        {
            Some((query, _)) => Some(
                self.resolver
                    .resolve_datasource(&query.datasource, caller)
                    .await?,
            ),
            None => None,
        };

        let queries = batch
            .queries
            .into_iter()
            .zip(is_expression)
            .map(|(query, expression)| backend_query(query, expression, datasource.as_ref()))
            .collect::<Vec<_>>();
        let backend_request = BackendRequest {
            caller: caller.clone(),
            time_range: batch.time_range,
            queries,
        };

        info!(
            request_id = %ctx.request_id,
            queries = backend_request.queries.len(),
            "dispatching expression batch"
        );
        let response = dispatch(ctx, client.as_ref(), backend_request).await?;
        Ok(ResponseAggregator::aggregate(None, response))
    }
}

fn backend_query(
    query: QueryDescriptor,
    expression: bool,
    datasource: Option<&ResolvedDataSource>,
) -> BackendQuery {
    BackendQuery {
        query,
        datasource: if expression { None } else { datasource.cloned() },
    }
}

/// One call, no retry, raced against cancellation and the deadline.
async fn dispatch(
    ctx: &RequestContext,
    client: &dyn PluginClient,
    request: BackendRequest,
) -> Result<gateway_common::QueryDataResponse, GatewayError> {
    Ok(ctx.run(client.query_data(ctx, request)).await??)
}
