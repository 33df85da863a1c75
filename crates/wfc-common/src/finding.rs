//! Reviewer roles and the findings they emit.
//!
//! ## Example
//!
//! ```
//! use wfc_common::{Finding, ReviewerRole};
//!
//! let finding = Finding::new(
//!     "security",
//!     "sql-injection",
//!     "src/db.rs",
//!     42,
//!     "Query built with string concatenation",
//!     9.0,
//!     8.0,
//! )
//! .unwrap();
//!
//! assert_eq!(finding.role(), Some(ReviewerRole::Security));
//! assert!((finding.risk() - 7.2).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Lowest allowed severity/confidence.
pub const SCORE_MIN: f64 = 0.0;
/// Highest allowed severity/confidence.
pub const SCORE_MAX: f64 = 10.0;

/// Specialty of an independent reviewer pass.
///
/// The set is closed: adding a role means adding a variant, not registering
/// a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerRole {
    Security,
    Correctness,
    Performance,
    Maintainability,
    Reliability,
}

impl ReviewerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Correctness => "correctness",
            Self::Performance => "performance",
            Self::Maintainability => "maintainability",
            Self::Reliability => "reliability",
        }
    }

    /// All roles in scheduling order.
    pub fn all() -> Vec<Self> {
        vec![
            Self::Security,
            Self::Correctness,
            Self::Performance,
            Self::Maintainability,
            Self::Reliability,
        ]
    }

    /// Rate-limiter priority; lower ranks are served first under contention.
    pub fn priority_rank(&self) -> u8 {
        match self {
            Self::Security => 0,
            Self::Reliability => 1,
            Self::Correctness => 2,
            Self::Performance => 3,
            Self::Maintainability => 4,
        }
    }

    /// Resolve the role from a reviewer id such as `security` or `security-2`.
    pub fn from_reviewer_id(reviewer_id: &str) -> Option<Self> {
        let base = reviewer_id
            .split(['-', ':', '#'])
            .next()
            .unwrap_or(reviewer_id);
        Self::from_str(base).ok()
    }
}

impl fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReviewerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "security" | "sec" => Ok(Self::Security),
            "correctness" | "correct" => Ok(Self::Correctness),
            "performance" | "perf" => Ok(Self::Performance),
            "maintainability" | "maint" => Ok(Self::Maintainability),
            "reliability" | "rel" => Ok(Self::Reliability),
            _ => Err(format!(
                "Invalid reviewer role '{}'. Valid values: security, correctness, performance, maintainability, reliability",
                s
            )),
        }
    }
}

/// Wire shape accepted from reviewer output; converted through [`Finding::new`].
#[derive(Debug, Deserialize)]
struct FindingRecord {
    reviewer_id: String,
    category: String,
    file_path: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    description: String,
    severity: f64,
    confidence: f64,
}

impl TryFrom<FindingRecord> for Finding {
    type Error = ValidationError;

    fn try_from(r: FindingRecord) -> Result<Self, Self::Error> {
        Finding::new(
            &r.reviewer_id,
            &r.category,
            &r.file_path,
            r.line,
            &r.description,
            r.severity,
            r.confidence,
        )
    }
}

/// A single issue surfaced by one reviewer pass.
///
/// Severity and confidence are checked on construction, so every `Finding`
/// in memory is within `[0, 10]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FindingRecord")]
pub struct Finding {
    reviewer_id: String,
    category: String,
    file_path: String,
    /// 1-based; 0 for file-level findings.
    line: u32,
    description: String,
    severity: f64,
    confidence: f64,
}

impl Finding {
    pub fn new(
        reviewer_id: &str,
        category: &str,
        file_path: &str,
        line: u32,
        description: &str,
        severity: f64,
        confidence: f64,
    ) -> Result<Self, ValidationError> {
        check_score("severity", severity)?;
        check_score("confidence", confidence)?;
        if reviewer_id.trim().is_empty() {
            return Err(ValidationError::Empty { field: "reviewer_id" });
        }
        if category.trim().is_empty() {
            return Err(ValidationError::Empty { field: "category" });
        }

        Ok(Self {
            reviewer_id: reviewer_id.to_string(),
            category: category.to_string(),
            file_path: file_path.to_string(),
            line,
            description: description.to_string(),
            severity,
            confidence,
        })
    }

    pub fn reviewer_id(&self) -> &str {
        &self.reviewer_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn severity(&self) -> f64 {
        self.severity
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// `severity * confidence / 10`, in `[0, 10]`.
    pub fn risk(&self) -> f64 {
        self.severity * self.confidence / 10.0
    }

    pub fn role(&self) -> Option<ReviewerRole> {
        ReviewerRole::from_reviewer_id(&self.reviewer_id)
    }

    /// Re-attribute this finding to the pass that produced it.
    pub fn attributed_to(mut self, reviewer_id: &str) -> Self {
        reviewer_id.clone_into(&mut self.reviewer_id);
        self
    }
}

fn check_score(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (SCORE_MIN..=SCORE_MAX).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min: SCORE_MIN,
            max: SCORE_MAX,
        })
    }
}
