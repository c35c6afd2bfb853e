//! Structural completeness policy for criterion-based reviews.
//!
//! Checks shape, not quality: every required criterion must have a declared
//! section containing at least one strength and one weakness statement.
//!
//! Recognised layout (Markdown):
//!
//! ```text
//! ## Innovation
//! - Strength: novel assay design
//! - Weakness: no comparison against prior screens
//!
//! ## Approach
//! ### Strengths
//! - well-powered cohort
//! ### Weaknesses
//! - attrition not addressed
//! ```
//!
//! Criterion headings match case-insensitively, ignoring punctuation and
//! leading numbering (`1. Overall Impact`, `Investigators`). A bold or
//! colon-terminated line naming a criterion also opens its section.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default required criteria, in review order.
pub const DEFAULT_CRITERIA: [&str; 6] = [
    "Overall Impact",
    "Significance",
    "Investigator(s)",
    "Innovation",
    "Approach",
    "Environment",
];

/// `# Title`, `### Title ###`
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").expect("HEADING_RE regex should compile")
});

/// `- item`, `* item`, `+ item`, `• item`, `1. item`, `2) item`
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*+•]|\d+[.)])\s+(.*)$").expect("BULLET_RE regex should compile")
});

/// `Strength: text`, `**Weakness:** text`, `__Strengths__: text`
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[*_]*\s*([A-Za-z][A-Za-z ()]{0,40}?)\s*[*_]*\s*:\s*[*_]*\s*(.*?)\s*[*_]*$")
        .expect("LABEL_RE regex should compile")
});

/// Error building a criteria set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CriteriaError {
    #[error("criteria set is empty")]
    Empty,
    #[error("criterion name is blank")]
    Blank,
    #[error("duplicate criterion: {0}")]
    Duplicate(String),
}

/// Ordered set of required review criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriteriaSet(Vec<String>);

impl CriteriaSet {
    /// Build a validated set. Names must be non-blank and distinct after
    /// normalisation.
    pub fn new<I, S>(names: I) -> Result<Self, CriteriaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(|n| n.into().trim().to_string()).collect();
        if names.is_empty() {
            return Err(CriteriaError::Empty);
        }
        let mut seen = Vec::with_capacity(names.len());
        for name in &names {
            let key = compact_key(name);
            if key.is_empty() {
                return Err(CriteriaError::Blank);
            }
            if seen.contains(&key) {
                return Err(CriteriaError::Duplicate(name.clone()));
            }
            seen.push(key);
        }
        Ok(Self(names))
    }

    /// The six standard peer-review criteria.
    pub fn standard() -> Self {
        Self(DEFAULT_CRITERIA.iter().map(|s| s.to_string()).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bulleted list used inside prompts.
    pub fn as_prompt_list(&self) -> String {
        self.0
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn position(&self, label: &str) -> Option<usize> {
        let key = compact_key(label);
        if key.is_empty() {
            return None;
        }
        self.0.iter().position(|c| compact_key(c) == key)
    }
}

impl Default for CriteriaSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// Kind of statement a criterion needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Strength,
    Weakness,
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strength => write!(f, "strength"),
            Self::Weakness => write!(f, "weakness"),
        }
    }
}

/// Statement counts found for one criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionCoverage {
    pub criterion: String,
    /// Whether a section for this criterion was declared at all.
    pub declared: bool,
    pub strengths: u32,
    pub weaknesses: u32,
}

impl CriterionCoverage {
    pub fn is_covered(&self) -> bool {
        self.strengths > 0 && self.weaknesses > 0
    }
}

/// A required statement that is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    pub criterion: String,
    pub polarity: Polarity,
}

impl std::fmt::Display for MissingItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {}", self.polarity, self.criterion)
    }
}

/// Non-blocking note that a criterion's strength:weakness ratio falls
/// outside 1:1 to 2:1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceAdvisory {
    pub criterion: String,
    pub strengths: u32,
    pub weaknesses: u32,
}

impl BalanceAdvisory {
    pub fn ratio(&self) -> f64 {
        f64::from(self.strengths) / f64::from(self.weaknesses.max(1))
    }
}

/// Result of checking one review against a criteria set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub coverage: Vec<CriterionCoverage>,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.coverage.iter().all(CriterionCoverage::is_covered)
    }

    /// Every absent statement, in criterion order, strength before weakness.
    pub fn missing(&self) -> Vec<MissingItem> {
        let mut missing = Vec::new();
        for c in &self.coverage {
            if c.strengths == 0 {
                missing.push(MissingItem {
                    criterion: c.criterion.clone(),
                    polarity: Polarity::Strength,
                });
            }
            if c.weaknesses == 0 {
                missing.push(MissingItem {
                    criterion: c.criterion.clone(),
                    polarity: Polarity::Weakness,
                });
            }
        }
        missing
    }

    pub fn coverage_for(&self, criterion: &str) -> Option<&CriterionCoverage> {
        let key = compact_key(criterion);
        self.coverage
            .iter()
            .find(|c| compact_key(&c.criterion) == key)
    }

    /// Covered criteria whose ratio is outside the 1:1 to 2:1 target.
    pub fn balance_advisories(&self) -> Vec<BalanceAdvisory> {
        self.coverage
            .iter()
            .filter(|c| c.is_covered())
            .filter(|c| c.strengths < c.weaknesses || c.strengths > 2 * c.weaknesses)
            .map(|c| BalanceAdvisory {
                criterion: c.criterion.clone(),
                strengths: c.strengths,
                weaknesses: c.weaknesses,
            })
            .collect()
    }

    /// Directive asking the reviewer to supply what is missing.
    ///
    /// `None` when the review is already complete.
    pub fn refinement_directive(&self) -> Option<String> {
        let missing = self.missing();
        if missing.is_empty() {
            return None;
        }
        let mut directive = String::from(
            "Revise the review so that every required criterion has at least one \
             strength and one weakness. Missing items:\n",
        );
        for item in &missing {
            directive.push_str(&format!(
                "- Add at least one {} for {}.\n",
                item.polarity, item.criterion
            ));
        }
        Some(directive)
    }

    /// One-line summary, e.g. `5/6 criteria covered (missing: weakness for Innovation)`.
    pub fn summary_line(&self) -> String {
        let covered = self.coverage.iter().filter(|c| c.is_covered()).count();
        let missing = self.missing();
        if missing.is_empty() {
            format!("{covered}/{} criteria covered", self.coverage.len())
        } else {
            let items: Vec<String> = missing.iter().map(ToString::to_string).collect();
            format!(
                "{covered}/{} criteria covered (missing: {})",
                self.coverage.len(),
                items.join(", ")
            )
        }
    }
}

/// Lowercased alphanumerics only, with leading numbering dropped.
fn compact_key(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    spaced
        .split_whitespace()
        .skip_while(|w| w.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

fn polarity_of(label: &str) -> Option<Polarity> {
    match compact_key(label).as_str() {
        "strength" | "strengths" => Some(Polarity::Strength),
        "weakness" | "weaknesses" => Some(Polarity::Weakness),
        _ => None,
    }
}

fn strip_emphasis(s: &str) -> &str {
    s.trim()
        .trim_matches(|c: char| c == '*' || c == '_')
        .trim()
}

/// Label-only line such as `**Strengths**` or `Weaknesses:`.
fn bare_label(body: &str) -> &str {
    strip_emphasis(strip_emphasis(body).trim_end_matches(':'))
}

/// Check a review's declared sections against the criteria set.
pub fn check_completeness(review: &str, criteria: &CriteriaSet) -> CompletenessReport {
    let mut coverage: Vec<CriterionCoverage> = criteria
        .names()
        .iter()
        .map(|name| CriterionCoverage {
            criterion: name.clone(),
            declared: false,
            strengths: 0,
            weaknesses: 0,
        })
        .collect();

    // (criterion position, heading level that opened it)
    let mut current: Option<(usize, usize)> = None;
    let mut polarity: Option<Polarity> = None;

    for line in review.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(trimmed) {
            let level = caps[1].len();
            let title = &caps[2];
            if let Some(pos) = criteria.position(title) {
                coverage[pos].declared = true;
                current = Some((pos, level));
                polarity = None;
            } else if let Some((_, open_level)) = current {
                if let Some(p) = polarity_of(title) {
                    polarity = Some(p);
                } else if level <= open_level {
                    current = None;
                    polarity = None;
                } else {
                    polarity = None;
                }
            }
            continue;
        }

        let (is_bullet, body) = match BULLET_RE.captures(trimmed) {
            Some(caps) => (true, caps.get(1).map_or("", |m| m.as_str())),
            None => (false, trimmed),
        };

        if !is_bullet {
            if let Some(pos) = criteria.position(bare_label(body)) {
                if polarity_of(bare_label(body)).is_none() {
                    coverage[pos].declared = true;
                    current = Some((pos, usize::MAX));
                    polarity = None;
                    continue;
                }
            }
        }

        let Some((pos, _)) = current else {
            continue;
        };

        if let Some(caps) = LABEL_RE.captures(body) {
            if let Some(p) = polarity_of(&caps[1]) {
                polarity = Some(p);
                if !strip_emphasis(&caps[2]).is_empty() {
                    bump(&mut coverage[pos], p);
                }
                continue;
            }
        }

        if let Some(p) = polarity_of(bare_label(body)) {
            polarity = Some(p);
            continue;
        }

        if is_bullet && !strip_emphasis(body).is_empty() {
            if let Some(p) = polarity {
                bump(&mut coverage[pos], p);
            }
        }
    }

    CompletenessReport { coverage }
}

fn bump(coverage: &mut CriterionCoverage, polarity: Polarity) {
    match polarity {
        Polarity::Strength => coverage.strengths += 1,
        Polarity::Weakness => coverage.weaknesses += 1,
    }
}
