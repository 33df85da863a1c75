//! Shared domain types for the wfc review orchestration core.
//!
//! Everything in this crate is a plain value type: it performs no I/O and
//! holds no locks, so every layer (pool, scorer, job store, HTTP API) can
//! depend on it without pulling in the runtime.
//!
//! | Module      | Types                                                    |
//! |-------------|----------------------------------------------------------|
//! | `context`   | `ProjectContext`, identifier validation, namespacing     |
//! | `finding`   | `Finding`, `ReviewerRole`                                |
//! | `job`       | `JobStatus` and its transition table                     |
//! | `knowledge` | `KnowledgeEntry`                                         |
//! | `error`     | `ValidationError`                                        |

pub mod context;
pub mod error;
pub mod finding;
pub mod job;
pub mod knowledge;

pub use context::{ProjectContext, branch_name, validate_identifier, worktree_path};
pub use error::ValidationError;
pub use finding::{Finding, ReviewerRole};
pub use job::JobStatus;
pub use knowledge::KnowledgeEntry;
