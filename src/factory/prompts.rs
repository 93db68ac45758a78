//! Prompt templates.
//!
//! Templates use three tag forms:
//!
//! - `{{name}}` substitutes a named value (unknown names are left as-is)
//! - `{{#flag}}...{{/flag}}` keeps the block when `flag` is true
//! - `{{^flag}}...{{/flag}}` keeps the block when `flag` is false
//!
//! Sections may nest. A flag that was never set counts as false.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var(String),
    Section {
        name: String,
        inverted: bool,
        body: Vec<Segment>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Values and flags a template is rendered against.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
    flags: BTreeMap<String, bool>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn flag(mut self, name: &str, on: bool) -> Self {
        self.flags.insert(name.to_string(), on);
        self
    }
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        // Each frame: (section name, inverted, collected segments).
        let mut stack: Vec<(String, bool, Vec<Segment>)> = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                break;
            };
            let tag = &after[..close];
            text.push_str(&rest[..open]);
            let raw = &rest[open..open + 2 + close + 2];
            rest = &after[close + 2..];

            let (sigil, name) = match tag.chars().next() {
                Some(c @ ('#' | '^' | '/')) => (Some(c), &tag[1..]),
                _ => (None, tag),
            };
            if !is_name(name) {
                text.push_str(raw);
                continue;
            }
            if !text.is_empty() {
                current.push(Segment::Text(std::mem::take(&mut text)));
            }
            match sigil {
                None => current.push(Segment::Var(name.to_string())),
                Some(c) if c == '#' || c == '^' => {
                    stack.push((name.to_string(), c == '^', std::mem::take(&mut current)));
                }
                Some(_) => {
                    let Some((open_name, inverted, parent)) = stack.pop() else {
                        anyhow::bail!("Unexpected {{{{/{}}}}} with no open section", name);
                    };
                    if open_name != name {
                        anyhow::bail!(
                            "Section {{{{/{}}}}} closes {{{{{}}}}} out of order",
                            name,
                            open_name
                        );
                    }
                    let body = std::mem::replace(&mut current, parent);
                    current.push(Segment::Section {
                        name: open_name,
                        inverted,
                        body,
                    });
                }
            }
        }
        text.push_str(rest);
        if let Some((name, _, _)) = stack.last() {
            anyhow::bail!("Section {{{{{}}}}} is never closed", name);
        }
        if !text.is_empty() {
            current.push(Segment::Text(text));
        }
        Ok(Self { segments: current })
    }

    pub fn render(&self, ctx: &TemplateContext) -> String {
        let mut out = String::new();
        render_into(&self.segments, ctx, &mut out);
        out
    }
}

fn render_into(segments: &[Segment], ctx: &TemplateContext, out: &mut String) {
    for segment in segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Var(name) => match ctx.values.get(name) {
                Some(v) => out.push_str(v),
                None => {
                    out.push_str("{{");
                    out.push_str(name);
                    out.push_str("}}");
                }
            },
            Segment::Section {
                name,
                inverted,
                body,
            } => {
                let on = ctx.flags.get(name).copied().unwrap_or(false);
                if on != *inverted {
                    render_into(body, ctx, out);
                }
            }
        }
    }
}

/// The prompts handed to the agent for one run, in the order it uses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Implement,
    Review,
    Rework,
    PullRequest,
}

impl PromptKind {
    pub const ALL: [PromptKind; 4] = [
        PromptKind::Implement,
        PromptKind::Review,
        PromptKind::Rework,
        PromptKind::PullRequest,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Implement => "implement.md",
            Self::Review => "review.md",
            Self::Rework => "rework.md",
            Self::PullRequest => "pr.md",
        }
    }

    /// Agent CLI flag that receives this prompt's file path.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Implement => "--implement-prompt",
            Self::Review => "--review-prompt",
            Self::Rework => "--rework-prompt",
            Self::PullRequest => "--pr-prompt",
        }
    }
}

const DEFAULT_IMPLEMENT: &str = "\
Implement a fix for {{source_id}}: {{issue_title}}

{{issue_description}}

Labels: {{issue_labels}}
Work on branch {{branch_name}} (based on {{default_branch}}).
{{#has_context}}
Operator notes:
{{context}}
{{/has_context}}";

const DEFAULT_REVIEW: &str = "\
Review the changes on {{branch_name}} for {{source_id}}: {{issue_title}}.
Check correctness, tests, and scope. Report problems as a list.";

const DEFAULT_REWORK: &str = "\
Address the review findings for {{source_id}} on {{branch_name}}.
Keep changes focused on {{issue_title}}.";

const DEFAULT_PULL_REQUEST: &str = "\
Push {{branch_name}}.
{{#auto_pr}}Open a pull request against {{default_branch}} titled \"{{issue_title}}\".
{{#is_github}}Reference {{issue_url}} with \"Fixes #{{source_id}}\".{{/is_github}}
{{#is_linear}}Mention {{source_id}} in the description.{{/is_linear}}{{/auto_pr}}
{{^auto_pr}}Do not open a pull request.{{/auto_pr}}";

const DEFAULT_ASSESSMENT: &str = "\
Decide whether an autonomous coding agent can resolve this issue with a
single pull request.

Title: {{issue_title}}
Labels: {{issue_labels}}
Priority: {{priority}}

{{issue_description}}

Respond with JSON only: {\"assessment\": \"agentic_pr_capable\" | \"too_complex\", \"summary\": \"<one paragraph>\"}";

/// Run prompts plus the assessment prompt.
#[derive(Debug, Clone)]
pub struct PromptSet {
    implement: Template,
    review: Template,
    rework: Template,
    pull_request: Template,
    assessment: Template,
}

impl PromptSet {
    /// Load templates from `dir`, falling back to built-ins for any file
    /// that isn't there.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let read = |file: &str, fallback: &str| -> Result<Template> {
            let source = match dir.map(|d| d.join(file)) {
                Some(path) if path.exists() => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read prompt {}", path.display()))?,
                _ => fallback.to_string(),
            };
            Template::parse(&source).with_context(|| format!("Invalid prompt template {}", file))
        };
        Ok(Self {
            implement: read(PromptKind::Implement.file_name(), DEFAULT_IMPLEMENT)?,
            review: read(PromptKind::Review.file_name(), DEFAULT_REVIEW)?,
            rework: read(PromptKind::Rework.file_name(), DEFAULT_REWORK)?,
            pull_request: read(PromptKind::PullRequest.file_name(), DEFAULT_PULL_REQUEST)?,
            assessment: read("assessment.md", DEFAULT_ASSESSMENT)?,
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::load(None)
    }

    pub fn template(&self, kind: PromptKind) -> &Template {
        match kind {
            PromptKind::Implement => &self.implement,
            PromptKind::Review => &self.review,
            PromptKind::Rework => &self.rework,
            PromptKind::PullRequest => &self.pull_request,
        }
    }

    pub fn assessment(&self) -> &Template {
        &self.assessment
    }
}
