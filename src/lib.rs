//! Multi-tenant code review orchestration.
//!
//! A review request fans out to one reviewer pass per role inside an
//! isolated worktree, the passes are merged into a consensus score, and
//! high-risk findings are appended to a shared knowledge log.
//!
//! | Module         | Responsibility                                         |
//! |----------------|--------------------------------------------------------|
//! | `pool`         | bounded, namespaced worktree slots                     |
//! | `provision`    | creating and removing worktrees                        |
//! | `ratelimit`    | token bucket shared by all reviewer passes             |
//! | `knowledge`    | locked, deduplicated append-only knowledge logs        |
//! | `consensus`    | fingerprint merge and consensus scoring                |
//! | `reviewer`     | reviewer execution capability                          |
//! | `jobs`         | durable job records and project credentials            |
//! | `orchestrator` | per-job lifecycle and background execution             |
//! | `server`       | HTTP API                                               |
//! | `config`       | layered `wfc.toml` configuration                       |
//! | `logging`      | tracing subscriber setup                               |

pub mod config;
pub mod consensus;
pub mod errors;
pub mod jobs;
pub mod knowledge;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod provision;
pub mod ratelimit;
pub mod reviewer;
pub mod server;

pub use errors::{Result, ReviewError};
