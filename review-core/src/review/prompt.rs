//! Phase prompt templates.
//!
//! Bump `PROMPT_VERSION` whenever default wording changes so a recorded
//! ledger can be traced back to the prompt set that produced it.

use serde::{Deserialize, Serialize};

pub const PROMPT_VERSION: &str = "1.0.0";

const INITIAL_REVIEW: &str = "\
You are the primary reviewer for the grant proposal below. Write a structured \
review with one Markdown section per criterion, in this order:

{criteria}

Within every section list at least one strength and at least one weakness, \
each on its own line as `- Strength: ...` or `- Weakness: ...`. Aim for \
between one and two strengths per weakness.

Proposal:

{proposal}";

const REFINEMENT: &str = "\
Revise your review according to the following direction. Keep the same \
section layout and return the complete revised review.

{directive}";

const VULNERABILITY: &str = "\
The other agent provided the following review. Your task is to critically \
analyze it and identify any flaws, weaknesses, unsupported claims, logical \
inconsistencies, or areas that need improvement:

{draft}";

const CRITIC_REFINEMENT: &str = "\
Revise your critique according to the following direction and return the \
complete revised critique.

{directive}";

const REFLECTION: &str = "\
The other agent has provided the following observations and critique of your \
review. Reflect on this feedback and regenerate your review. For each point, \
state whether you accept it, rebut it, or revise the review, addressing the \
valid concerns while explaining why you disagree with any points you find \
incorrect:

{critique}";

/// Which template a prompt is rendered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    InitialReview,
    Refinement,
    Vulnerability,
    CriticRefinement,
    Reflection,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 5] = [
        Self::InitialReview,
        Self::Refinement,
        Self::Vulnerability,
        Self::CriticRefinement,
        Self::Reflection,
    ];

    /// Placeholders a template of this kind must contain.
    pub fn required_placeholders(self) -> &'static [&'static str] {
        match self {
            Self::InitialReview => &["proposal", "criteria"],
            Self::Refinement | Self::CriticRefinement => &["directive"],
            Self::Vulnerability => &["draft"],
            Self::Reflection => &["critique"],
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::InitialReview => "initial_review",
            Self::Refinement => "refinement",
            Self::Vulnerability => "vulnerability",
            Self::CriticRefinement => "critic_refinement",
            Self::Reflection => "reflection",
        }
    }
}

/// A template that lacks one of its required placeholders.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("template `{template}` is missing placeholder {{{placeholder}}}")]
pub struct TemplateError {
    pub template: &'static str,
    pub placeholder: &'static str,
}

/// The five phase templates. Missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub initial_review: String,
    pub refinement: String,
    pub vulnerability: String,
    pub critic_refinement: String,
    pub reflection: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            initial_review: INITIAL_REVIEW.to_string(),
            refinement: REFINEMENT.to_string(),
            vulnerability: VULNERABILITY.to_string(),
            critic_refinement: CRITIC_REFINEMENT.to_string(),
            reflection: REFLECTION.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn get(&self, kind: TemplateKind) -> &str {
        match kind {
            TemplateKind::InitialReview => &self.initial_review,
            TemplateKind::Refinement => &self.refinement,
            TemplateKind::Vulnerability => &self.vulnerability,
            TemplateKind::CriticRefinement => &self.critic_refinement,
            TemplateKind::Reflection => &self.reflection,
        }
    }

    /// Reject any template missing a required placeholder.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for kind in TemplateKind::ALL {
            let template = self.get(kind);
            for &placeholder in kind.required_placeholders() {
                if !template.contains(&format!("{{{placeholder}}}")) {
                    return Err(TemplateError {
                        template: kind.key(),
                        placeholder,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn render(&self, kind: TemplateKind, vars: &[(&str, &str)]) -> String {
        render(self.get(kind), vars)
    }
}

/// Single-pass `{name}` substitution.
///
/// Substituted values are never re-scanned, so a proposal containing
/// `{draft}` stays literal. Unknown placeholders are left as written.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v, close))
        });
        match value {
            Some((v, close)) => {
                out.push_str(v);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
