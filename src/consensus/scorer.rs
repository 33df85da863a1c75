//! Consensus score (CS) over a set of reviewer passes.
//!
//! ```text
//! R_i      = severity_i * confidence_i / 10
//! CS       = 0.5 * R_bar + 0.3 * R_bar * mean(k_i / n) + 0.2 * R_max
//! CS_final = max(CS, 0.7 * R_i + 2.0)   if finding i is a protected minority finding
//! ```
//!
//! `n` is the number of passes attempted, `k_i` the number of distinct
//! passes that surfaced finding `i` after fingerprint dedup, so `k_i <= n`. A protected
//! minority finding is one surfaced by a single reviewer whose role is
//! protected (security, reliability by default) with `R_i >= 8.5`.
//!
//! The result depends only on the input finding set: merge order,
//! tie-breaks and output order are all fixed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use wfc_common::{Finding, ReviewerRole, ValidationError};

use super::fingerprint::{DEFAULT_LINE_BUCKET, fingerprint, normalize_category, normalize_path};

const WEIGHT_MEAN: f64 = 0.5;
const WEIGHT_AGREEMENT: f64 = 0.3;
const WEIGHT_MAX: f64 = 0.2;

const MINORITY_SLOPE: f64 = 0.7;
const MINORITY_OFFSET: f64 = 2.0;

/// Severity tier of a consensus score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Informational,
    Moderate,
    Important,
    Critical,
}

impl Tier {
    pub fn from_score(cs: f64) -> Self {
        if cs >= 9.0 {
            Self::Critical
        } else if cs >= 7.0 {
            Self::Important
        } else if cs >= 4.0 {
            Self::Moderate
        } else {
            Self::Informational
        }
    }

    pub fn decision(&self) -> Decision {
        match self {
            Self::Informational => Decision::Pass,
            Self::Moderate => Decision::PassWithComments,
            Self::Important => Decision::Block,
            Self::Critical => Decision::BlockAndEscalate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::Moderate => "moderate",
            Self::Important => "important",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    PassWithComments,
    Block,
    BlockAndEscalate,
}

impl Decision {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Block | Self::BlockAndEscalate)
    }
}

/// Output of one reviewer pass. A failed pass still counts toward `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewerPass {
    pub reviewer_id: String,
    pub findings: Vec<Finding>,
    pub error: Option<String>,
}

impl ReviewerPass {
    pub fn ok(reviewer_id: &str, findings: Vec<Finding>) -> Self {
        Self {
            reviewer_id: reviewer_id.to_string(),
            findings,
            error: None,
        }
    }

    pub fn failed(reviewer_id: &str, error: impl Into<String>) -> Self {
        Self {
            reviewer_id: reviewer_id.to_string(),
            findings: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Group a flat finding list into one pass per reviewer, then pad with
    /// empty passes until `attempted` passes exist.
    pub fn group(findings: Vec<Finding>, attempted: Option<usize>) -> Result<Vec<Self>, ValidationError> {
        let mut by_reviewer: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
        for f in findings {
            by_reviewer.entry(f.reviewer_id().to_string()).or_default().push(f);
        }

        let reported = by_reviewer.len();
        let attempted = attempted.unwrap_or(reported);
        if attempted < reported {
            return Err(ValidationError::Invalid {
                field: "reviewers",
                message: format!("{attempted} passes cannot produce findings from {reported} reviewers"),
            });
        }

        let mut passes: Vec<Self> = by_reviewer
            .into_iter()
            .map(|(reviewer_id, findings)| Self {
                reviewer_id,
                findings,
                error: None,
            })
            .collect();
        passes.extend((reported..attempted).map(|i| Self::ok(&format!("silent-{}", i + 1), Vec::new())));
        Ok(passes)
    }
}

/// One deduplicated issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFinding {
    pub fingerprint: String,
    pub category: String,
    pub file_path: String,
    pub line: u32,
    pub description: String,
    pub severity: f64,
    pub confidence: f64,
    pub risk: f64,
    /// Distinct passes that surfaced this issue.
    pub k: usize,
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerSummary {
    pub reviewer_id: String,
    pub findings: usize,
    pub max_risk: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub task_id: String,
    pub cs_score: f64,
    pub tier: Tier,
    pub decision: Decision,
    pub findings: Vec<MergedFinding>,
    pub reviewers: Vec<ReviewerSummary>,
    pub reviewers_run: usize,
    /// Fingerprint of the finding that raised the score floor, if any.
    pub minority_protection: Option<String>,
    /// False when the knowledge log could not be updated for this review.
    pub knowledge_recorded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub protected_roles: Vec<ReviewerRole>,
    pub minority_threshold: f64,
    pub line_bucket: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            protected_roles: vec![ReviewerRole::Security, ReviewerRole::Reliability],
            minority_threshold: 8.5,
            line_bucket: DEFAULT_LINE_BUCKET,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusScorer {
    config: ScoringConfig,
}

/// Accumulator for findings sharing a fingerprint.
struct Group<'a> {
    members: Vec<&'a Finding>,
    reviewers: BTreeSet<&'a str>,
}

impl ConsensusScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, task_id: &str, passes: &[ReviewerPass]) -> ConsensusResult {
        let n = passes.len();
        let findings = self.merge(passes);

        let (cs, minority_protection) = if findings.is_empty() || n == 0 {
            (0.0, None)
        } else {
            let count = findings.len() as f64;
            let r_bar = findings.iter().map(|f| f.risk).sum::<f64>() / count;
            let r_max = findings.iter().map(|f| f.risk).fold(0.0, f64::max);
            let agreement = findings.iter().map(|f| f.k as f64 / n as f64).sum::<f64>() / count;
            let cs = WEIGHT_MEAN * r_bar + WEIGHT_AGREEMENT * r_bar * agreement + WEIGHT_MAX * r_max;
            self.apply_minority_protection(cs, &findings)
        };

        let tier = Tier::from_score(cs);
        ConsensusResult {
            task_id: task_id.to_string(),
            cs_score: cs,
            tier,
            decision: tier.decision(),
            findings,
            reviewers: summarize(passes),
            reviewers_run: n,
            minority_protection,
            knowledge_recorded: true,
        }
    }

    fn merge(&self, passes: &[ReviewerPass]) -> Vec<MergedFinding> {
        let mut groups: BTreeMap<String, Group<'_>> = BTreeMap::new();
        for pass in passes {
            for finding in &pass.findings {
                let group = groups
                    .entry(fingerprint(finding, self.config.line_bucket))
                    .or_insert_with(|| Group {
                        members: Vec::new(),
                        reviewers: BTreeSet::new(),
                    });
                group.members.push(finding);
                // Agreement counts passes, not the ids findings claim for themselves.
                group.reviewers.insert(pass.reviewer_id.as_str());
            }
        }

        let mut merged: Vec<MergedFinding> = groups
            .into_iter()
            .filter_map(|(fp, group)| {
                let severity = group.members.iter().map(|f| f.severity()).fold(0.0, f64::max);
                let confidence = group.members.iter().map(|f| f.confidence()).fold(0.0, f64::max);
                let representative = group.members.iter().copied().min_by(|a, b| {
                    b.risk()
                        .total_cmp(&a.risk())
                        .then_with(|| a.reviewer_id().cmp(b.reviewer_id()))
                        .then_with(|| a.description().cmp(b.description()))
                        .then_with(|| a.line().cmp(&b.line()))
                })?;
                Some(MergedFinding {
                    fingerprint: fp,
                    category: normalize_category(representative.category()),
                    file_path: normalize_path(representative.file_path()),
                    line: representative.line(),
                    description: representative.description().to_string(),
                    severity,
                    confidence,
                    risk: severity * confidence / 10.0,
                    k: group.reviewers.len(),
                    reviewers: group.reviewers.into_iter().map(str::to_string).collect(),
                })
            })
            .collect();

        merged.sort_by(|a, b| {
            b.risk
                .total_cmp(&a.risk)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        merged
    }

    fn is_protected(&self, reviewer_id: &str) -> bool {
        ReviewerRole::from_reviewer_id(reviewer_id)
            .is_some_and(|role| self.config.protected_roles.contains(&role))
    }

    fn apply_minority_protection(&self, cs: f64, findings: &[MergedFinding]) -> (f64, Option<String>) {
        // Findings are already ordered by descending risk, so the first
        // qualifying one yields the highest floor.
        let trigger = findings.iter().find(|f| {
            f.k == 1
                && f.risk >= self.config.minority_threshold
                && f.reviewers.first().is_some_and(|r| self.is_protected(r))
        });

        match trigger {
            Some(f) => {
                let floor = MINORITY_SLOPE * f.risk + MINORITY_OFFSET;
                if floor > cs {
                    tracing::info!(
                        fingerprint = %f.fingerprint,
                        reviewer = %f.reviewers[0],
                        risk = f.risk,
                        cs,
                        floor,
                        "Minority protection raised consensus score"
                    );
                    (floor, Some(f.fingerprint.clone()))
                } else {
                    (cs, None)
                }
            }
            None => (cs, None),
        }
    }
}

fn summarize(passes: &[ReviewerPass]) -> Vec<ReviewerSummary> {
    let mut summaries: Vec<ReviewerSummary> = passes
        .iter()
        .map(|pass| ReviewerSummary {
            reviewer_id: pass.reviewer_id.clone(),
            findings: pass.findings.len(),
            max_risk: pass.findings.iter().map(Finding::risk).fold(0.0, f64::max),
            error: pass.error.clone(),
        })
        .collect();
    summaries.sort_by(|a, b| a.reviewer_id.cmp(&b.reviewer_id));
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(reviewer: &str, category: &str, path: &str, line: u32, sev: f64, conf: f64) -> Finding {
        Finding::new(reviewer, category, path, line, &format!("{category} in {path}"), sev, conf).unwrap()
    }

    #[test]
    fn group_pads_silent_passes() {
        let findings = vec![
            finding("security", "injection", "a.rs", 1, 9.0, 9.0),
            finding("performance", "alloc", "b.rs", 2, 3.0, 3.0),
            finding("security", "xss", "c.rs", 3, 5.0, 5.0),
        ];
        let passes = ReviewerPass::group(findings.clone(), Some(4)).unwrap();
        assert_eq!(passes.len(), 4);
        assert_eq!(passes[0].reviewer_id, "performance");
        assert_eq!(passes[1].findings.len(), 2);
        assert!(passes[3].findings.is_empty());

        assert_eq!(ReviewerPass::group(findings.clone(), None).unwrap().len(), 2);
        assert!(ReviewerPass::group(findings, Some(1)).is_err());
    }

    #[test]
    fn split_findings_score_moderate() {
        let passes = vec![
            ReviewerPass::ok("security", vec![finding("security", "injection", "fileA", 10, 9.0, 9.0)]),
            ReviewerPass::ok("reliability", vec![finding("reliability", "retry", "fileB", 5, 2.0, 3.0)]),
        ];
        let result = ConsensusScorer::default().score("T", &passes);

        assert!((result.cs_score - 4.4475).abs() < 1e-9, "{}", result.cs_score);
        assert_eq!(result.tier, Tier::Moderate);
        assert_eq!(result.decision, Decision::PassWithComments);
        assert_eq!(result.minority_protection, None);
        assert_eq!(result.findings.len(), 2);
        assert!((result.findings[0].risk - 8.1).abs() < 1e-9);
        assert!((result.findings[1].risk - 0.6).abs() < 1e-9);
    }

    #[test]
    fn lone_security_finding_raises_the_floor() {
        let passes = vec![
            ReviewerPass::ok("security", vec![finding("security", "rce", "api.rs", 1, 9.5, 9.5)]),
            ReviewerPass::ok("performance", vec![finding("performance", "alloc", "a.rs", 1, 1.0, 1.0)]),
            ReviewerPass::ok("maintainability", vec![]),
        ];
        let result = ConsensusScorer::default().score("T", &passes);

        let r = 9.5 * 9.5 / 10.0;
        assert!((result.cs_score - (0.7 * r + 2.0)).abs() < 1e-9);
        assert_eq!(result.tier, Tier::Important);
        assert!(result.decision.is_blocking());
        assert_eq!(result.minority_protection.as_deref(), Some(result.findings[0].fingerprint.as_str()));
    }

    #[test]
    fn unprotected_role_gets_no_floor() {
        let passes = vec![
            ReviewerPass::ok("performance", vec![finding("performance", "n-plus-one", "db.rs", 3, 9.5, 9.5)]),
            ReviewerPass::ok("security", vec![]),
            ReviewerPass::ok("reliability", vec![]),
        ];
        let result = ConsensusScorer::default().score("T", &passes);
        assert_eq!(result.minority_protection, None);
        let r = 9.025;
        let expected = 0.5 * r + 0.3 * r / 3.0 + 0.2 * r;
        assert!((result.cs_score - expected).abs() < 1e-9);
    }

    #[test]
    fn agreeing_reviewers_collapse_into_one_finding() {
        let passes = vec![
            ReviewerPass::ok("security", vec![finding("security", "SQL Injection", "./db.rs", 10, 8.0, 6.0)]),
            ReviewerPass::ok("correctness", vec![finding("correctness", "sql_injection", "db.rs", 11, 6.0, 9.0)]),
        ];
        let result = ConsensusScorer::default().score("T", &passes);

        assert_eq!(result.findings.len(), 1);
        let merged = &result.findings[0];
        assert_eq!(merged.k, 2);
        assert_eq!(merged.reviewers, vec!["correctness", "security"]);
        assert_eq!(merged.severity, 8.0);
        assert_eq!(merged.confidence, 9.0);
        assert!((merged.risk - 7.2).abs() < 1e-9);
        // 0.5*7.2 + 0.3*7.2*1.0 + 0.2*7.2
        assert!((result.cs_score - 7.2).abs() < 1e-9);
        assert_eq!(result.tier, Tier::Important);
    }

    #[test]
    fn same_reviewer_twice_counts_once() {
        let passes = vec![
            ReviewerPass::ok(
                "security",
                vec![
                    finding("security", "xss", "ui.rs", 4, 5.0, 5.0),
                    finding("security", "xss", "ui.rs", 5, 6.0, 5.0),
                ],
            ),
            ReviewerPass::ok("correctness", vec![]),
        ];
        let result = ConsensusScorer::default().score("T", &passes);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].k, 1);
    }

    #[test]
    fn one_pass_claiming_many_reviewers_counts_once() {
        let passes = vec![ReviewerPass::ok(
            "security",
            vec![
                finding("security-a", "rce", "api.rs", 1, 9.5, 9.5),
                finding("security-b", "rce", "api.rs", 1, 9.5, 9.5),
            ],
        )];
        let result = ConsensusScorer::default().score("T", &passes);

        assert_eq!(result.reviewers_run, 1);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].k, 1);
        assert_eq!(result.findings[0].reviewers, vec!["security"]);
        assert!(result.cs_score <= 10.0, "{}", result.cs_score);
        assert_eq!(result.minority_protection.as_deref(), Some(result.findings[0].fingerprint.as_str()));
    }

    #[test]
    fn score_is_independent_of_pass_order() {
        let a = ReviewerPass::ok("security", vec![finding("security", "leak", "x.rs", 1, 7.0, 8.0)]);
        let b = ReviewerPass::ok("reliability", vec![finding("reliability", "leak", "x.rs", 2, 9.0, 4.0)]);
        let c = ReviewerPass::ok("performance", vec![finding("performance", "slow", "y.rs", 9, 3.0, 3.0)]);

        let scorer = ConsensusScorer::default();
        let first = scorer.score("T", &[a.clone(), b.clone(), c.clone()]);
        let second = scorer.score("T", &[c, b, a]);
        assert_eq!(first.cs_score.to_bits(), second.cs_score.to_bits());
        assert_eq!(first.findings, second.findings);
        assert_eq!(first.reviewers, second.reviewers);
        assert_eq!(first, scorer.score("T", &[
            ReviewerPass::ok("security", vec![finding("security", "leak", "x.rs", 1, 7.0, 8.0)]),
            ReviewerPass::ok("reliability", vec![finding("reliability", "leak", "x.rs", 2, 9.0, 4.0)]),
            ReviewerPass::ok("performance", vec![finding("performance", "slow", "y.rs", 9, 3.0, 3.0)]),
        ]));
    }

    #[test]
    fn no_findings_scores_zero() {
        let passes = vec![ReviewerPass::ok("security", vec![]), ReviewerPass::failed("reliability", "timeout")];
        let result = ConsensusScorer::default().score("T", &passes);
        assert_eq!(result.cs_score, 0.0);
        assert_eq!(result.tier, Tier::Informational);
        assert_eq!(result.decision, Decision::Pass);
        assert_eq!(result.reviewers_run, 2);
        assert_eq!(result.reviewers[0].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn failed_passes_dilute_agreement() {
        let found = finding("security", "injection", "a.rs", 1, 6.0, 5.0);
        let scorer = ConsensusScorer::default();
        let alone = scorer.score("T", &[ReviewerPass::ok("security", vec![found.clone()])]);
        let with_failure = scorer.score(
            "T",
            &[ReviewerPass::ok("security", vec![found]), ReviewerPass::failed("correctness", "crashed")],
        );
        assert!(with_failure.cs_score < alone.cs_score);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(Tier::from_score(3.999), Tier::Informational);
        assert_eq!(Tier::from_score(4.0), Tier::Moderate);
        assert_eq!(Tier::from_score(6.99), Tier::Moderate);
        assert_eq!(Tier::from_score(7.0), Tier::Important);
        assert_eq!(Tier::from_score(8.99), Tier::Important);
        assert_eq!(Tier::from_score(9.0), Tier::Critical);
        assert_eq!(Tier::Critical.decision(), Decision::BlockAndEscalate);
    }

    #[test]
    fn result_serializes_snake_case() {
        let result = ConsensusScorer::default().score("T", &[]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["tier"], "informational");
        assert_eq!(json["decision"], "pass");
        assert_eq!(json["reviewers_run"], 0);
    }
}
