//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled         |
//! |-----------|--------------------------|
//! | `serve`   | `Serve`                  |
//! | `project` | `Register`, `Recover`    |
//! | `score`   | `Score`                  |
//! | `config`  | `Config`                 |

pub mod config;
pub mod project;
pub mod score;
pub mod serve;

pub use config::cmd_config;
pub use project::{cmd_recover, cmd_register};
pub use score::cmd_score;
pub use serve::cmd_serve;
