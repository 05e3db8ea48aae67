//! Shared domain types for the plugin gateway.
//!
//! Everything the gateway hands to, or receives from, an external collaborator
//! lives here so that plugin backends and datasource stores can be implemented
//! without depending on the HTTP server crate.
//!
//! | Module       | Contents                                                     |
//! |--------------|--------------------------------------------------------------|
//! | `identity`   | `CallerIdentity`, `OrgRole`                                  |
//! | `datasource` | `DataSourceRef`, `ResolvedDataSource`, expression markers    |
//! | `query`      | `QueryDescriptor`, `TimeRange`, `BackendRequest`, results    |
//! | `resource`   | `ResourceCallRequest`, `ResourcePart`, response sender trait |
//! | `client`     | `PluginClient` and `DatasourceCache` collaborator traits     |
//! | `context`    | `RequestContext` (request id, cancellation, deadline)        |
//! | `error`      | `GatewayError`, `PluginError`, `DatasourceError`             |

pub mod client;
pub mod context;
pub mod datasource;
pub mod error;
pub mod identity;
pub mod query;
pub mod resource;

pub use client::{DatasourceCache, PluginClient};
pub use context::{CancelReason, RequestContext};
pub use datasource::{AccessMode, DataSourceRef, ResolvedDataSource};
pub use error::{DatasourceError, GatewayError, PluginError};
pub use identity::{CallerIdentity, OrgRole};
pub use query::{
    BackendQuery, BackendRequest, DataResponse, QueryDataResponse, QueryDescriptor, TimeRange,
};
pub use resource::{PluginRef, ResourceCallRequest, ResourcePart, ResourceResponseSender};
