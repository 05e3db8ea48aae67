//! Typed error hierarchy for the plugin gateway.
//!
//! Three enums cover the three layers a request passes through:
//! - `PluginError`: failures reported by a plugin backend client
//! - `DatasourceError`: failures reported by the datasource collaborator
//! - `GatewayError`: the taxonomy every endpoint maps its failures into

use http::StatusCode;
use thiserror::Error;

use crate::context::CancelReason;

/// Errors from a plugin backend client call.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin unavailable: {0}")]
    Unavailable(String),

    #[error("Method not implemented by plugin")]
    NotImplemented,

    #[error("Plugin request canceled: {0}")]
    Canceled(CancelReason),

    #[error("Plugin request failed: {0}")]
    Failed(#[source] anyhow::Error),
}

/// Errors from resolving a datasource reference.
#[derive(Debug, Error)]
pub enum DatasourceError {
    #[error("Data source not found")]
    NotFound,

    #[error("Access denied to data source")]
    AccessDenied,

    #[error("Failed to look up data source: {0}")]
    Internal(#[source] anyhow::Error),
}

/// Stable message ids for the upstream error categories.
pub mod message_ids {
    pub const PLUGIN_UNAVAILABLE: &str = "plugin.unavailable";
    pub const PLUGIN_NOT_IMPLEMENTED: &str = "plugin.notImplemented";
    pub const PLUGIN_REQUEST_FAILURE: &str = "plugin.requestFailureError";
    pub const PLUGIN_REQUEST_CANCELED: &str = "plugin.requestCanceled";
}

/// Errors surfaced to HTTP clients. Each variant maps to one status code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Plugin unavailable")]
    UpstreamUnavailable { detail: String },

    #[error("Method not implemented")]
    UpstreamNotImplemented,

    #[error("An error occurred within the plugin")]
    UpstreamGenericFailure {
        #[source]
        source: anyhow::Error,
    },

    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("{0}")]
    Canceled(CancelReason),
}

impl GatewayError {
    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        GatewayError::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamNotImplemented => StatusCode::NOT_IMPLEMENTED,
            GatewayError::UpstreamGenericFailure { .. } | GatewayError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // 499 "client closed request"; always in range, so the fallback is never taken.
            GatewayError::Canceled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }

    /// Machine-readable id for the categories clients must tell apart.
    pub fn message_id(&self) -> Option<&'static str> {
        match self {
            GatewayError::UpstreamUnavailable { .. } => Some(message_ids::PLUGIN_UNAVAILABLE),
            GatewayError::UpstreamNotImplemented => Some(message_ids::PLUGIN_NOT_IMPLEMENTED),
            GatewayError::UpstreamGenericFailure { .. } => {
                Some(message_ids::PLUGIN_REQUEST_FAILURE)
            }
            GatewayError::Canceled(_) => Some(message_ids::PLUGIN_REQUEST_CANCELED),
            _ => None,
        }
    }
}

impl From<PluginError> for GatewayError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Unavailable(detail) => GatewayError::UpstreamUnavailable { detail },
            PluginError::NotImplemented => GatewayError::UpstreamNotImplemented,
            PluginError::Canceled(reason) => GatewayError::Canceled(reason),
            PluginError::Failed(source) => GatewayError::UpstreamGenericFailure { source },
        }
    }
}

impl From<DatasourceError> for GatewayError {
    fn from(err: DatasourceError) -> Self {
        match err {
            DatasourceError::NotFound => GatewayError::NotFound("Data source not found".into()),
            DatasourceError::AccessDenied => {
                GatewayError::AccessDenied("Access denied to data source".into())
            }
            DatasourceError::Internal(source) => GatewayError::Internal {
                message: "Unable to load data source metadata".into(),
                source: Some(source),
            },
        }
    }
}

impl From<CancelReason> for GatewayError {
    fn from(reason: CancelReason) -> Self {
        GatewayError::Canceled(reason)
    }
}
