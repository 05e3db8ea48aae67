//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `routes` | `Routes`         |
//! | `config` | `Config`         |

pub mod config;
pub mod routes;
pub mod serve;

pub use config::cmd_config;
pub use routes::cmd_routes;
pub use serve::cmd_serve;
