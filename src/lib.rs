pub mod api;
pub mod auth;
pub mod config;
pub mod datasource;
pub mod plugin;
pub mod proxy;
pub mod query;
pub mod registry;
pub mod resource;
pub mod server;
pub mod telemetry;
