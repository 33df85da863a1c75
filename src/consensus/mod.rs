//! Consensus scoring across independent reviewer passes.
//!
//! ## Components
//!
//! - [`fingerprint`]: identity of a finding across reviewers
//! - [`scorer`]: merge, score, tier and minority protection
//!
//! ## Example
//!
//! ```
//! use wfc::consensus::{ConsensusScorer, ReviewerPass, Tier};
//! use wfc_common::Finding;
//!
//! let finding = Finding::new("security", "injection", "src/db.rs", 10, "Unescaped query", 9.0, 9.0)
//!     .unwrap();
//! let passes = vec![
//!     ReviewerPass::ok("security", vec![finding]),
//!     ReviewerPass::ok("performance", vec![]),
//! ];
//!
//! let result = ConsensusScorer::default().score("T-1", &passes);
//! assert_eq!(result.reviewers_run, 2);
//! assert_eq!(result.tier, Tier::Moderate);
//! ```

pub mod fingerprint;
pub mod scorer;

pub use fingerprint::fingerprint;
pub use scorer::{
    ConsensusResult, ConsensusScorer, Decision, MergedFinding, ReviewerPass, ReviewerSummary,
    ScoringConfig, Tier,
};
