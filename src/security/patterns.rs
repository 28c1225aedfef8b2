//! Attack-pattern detection over raw targets and header values.
//!
//! Rules are data: a versioned [`RuleSet`] of tagged regular expressions that
//! can be replaced from configuration without code changes. Matching is
//! case-insensitive and runs in declared order, so the first matching rule is
//! always the one reported.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::SecurityVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Suspicious,
    Malicious,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Suspicious => "suspicious",
            RuleCategory::Malicious => "malicious",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub id: String,
    pub category: RuleCategory,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    pub rules: Vec<PatternRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        use RuleCategory::{Malicious, Suspicious};

        let rule = |id: &str, category, pattern: &str| PatternRule {
            id: id.to_string(),
            category,
            pattern: pattern.to_string(),
        };

        Self {
            version: "builtin-1".to_string(),
            rules: vec![
                rule("traversal.dot-dot", Suspicious, r"\.\.[/\\]"),
                rule(
                    "traversal.encoded",
                    Suspicious,
                    r"(%2e|\.)(%2e|\.)(%2f|%5c)|%2e%2e[/\\]|%252e|%c0%ae",
                ),
                rule("markup.script-tag", Suspicious, r"<\s*/?\s*script"),
                rule("markup.iframe-tag", Suspicious, r"<\s*iframe"),
                rule("markup.object-tag", Suspicious, r"<\s*(object|embed|applet)"),
                rule("markup.encoded-tag", Suspicious, r"%3c\s*(script|iframe|object|embed)"),
                rule("scheme.javascript", Suspicious, r"\bjavascript\s*:"),
                rule("scheme.vbscript", Suspicious, r"\bvbscript\s*:"),
                rule("scheme.data", Suspicious, r"\bdata:"),
                rule("scheme.file", Suspicious, r"\bfile:"),
                rule("scheme.blob", Suspicious, r"\bblob:"),
                rule("exec.eval", Malicious, r"\beval\s*\("),
                rule("exec.expression", Malicious, r"\bexpression\s*\("),
                rule(
                    "mime.script",
                    Malicious,
                    r"(text|application)(/|%2f)(x-)?(javascript|ecmascript|vbscript)|text(/|%2f)html\s*(;|%3b)\s*base64",
                ),
                rule(
                    "scheme.browser-internal",
                    Malicious,
                    r"\b(chrome|chrome-extension|moz-extension|about|view-source|resource):",
                ),
            ],
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    category: RuleCategory,
    regex: Regex,
}

/// A compiled, immutable rule set.
#[derive(Debug)]
pub struct AttackDetector {
    version: String,
    rules: Vec<CompiledRule>,
}

impl AttackDetector {
    pub fn compile(set: &RuleSet) -> Result<Self, regex::Error> {
        let rules = set
            .rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()?;
                Ok(CompiledRule {
                    id: rule.id.clone(),
                    category: rule.category,
                    regex,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            version: set.version.clone(),
            rules,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scan `input` and deny on the first matching rule.
    pub fn scan(&self, input: &str) -> SecurityVerdict {
        match self.rules.iter().find(|rule| rule.regex.is_match(input)) {
            Some(rule) => SecurityVerdict::deny(
                rule.id.clone(),
                format!(
                    "{} pattern '{}' matched (rules {})",
                    rule.category.as_str(),
                    rule.id,
                    self.version
                ),
            ),
            None => SecurityVerdict::allow(),
        }
    }
}
