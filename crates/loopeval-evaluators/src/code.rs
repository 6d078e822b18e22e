//! Code evaluator: a declarative rule set checked against the turn's fields.
//!
//! The snippet is a JSON or YAML document:
//!
//! ```yaml
//! combine: mean          # or "all" (default)
//! rules:
//!   - type: must_contain
//!     field: actual_output
//!     values: ["Paris"]
//!   - type: regex_match
//!     field: actual_output
//!     pattern: "^[A-Z]"
//! ```

use crate::render::as_text;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use loopeval_core::context::Ctx;
use loopeval_core::errors::{EvalError, EvalResult};
use loopeval_core::evaluator::{
    EvaluatorContent, EvaluatorExecutor, EvaluatorInput, EvaluatorKind, EvaluatorOutput, EvaluatorVersion,
};
use loopeval_core::model::TokenUsage;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LANGUAGE: &str = "rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    /// 1 when every rule passes, else 0.
    #[default]
    All,
    /// Fraction of passing rules.
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    MustContain {
        field: String,
        values: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    MustNotContain {
        field: String,
        values: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    RegexMatch {
        field: String,
        pattern: String,
        #[serde(default)]
        flags: Vec<String>,
    },
    RegexNotMatch {
        field: String,
        pattern: String,
        #[serde(default)]
        flags: Vec<String>,
    },
    JsonSchema {
        field: String,
        schema: Value,
    },
    EqualsField {
        field: String,
        other: String,
        #[serde(default)]
        case_insensitive: bool,
    },
    ContainsField {
        field: String,
        other: String,
        #[serde(default)]
        case_insensitive: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub combine: Combine,
    pub rules: Vec<Rule>,
}

enum Check {
    Contains { field: String, values: Vec<String>, fold: bool, negate: bool },
    Regex { field: String, re: Regex, pattern: String, negate: bool },
    Schema { field: String, schema: Box<JSONSchema> },
    Field { field: String, other: String, fold: bool, equals: bool },
}

/// A parsed rule set with regexes and schemas compiled once.
pub struct CompiledRules {
    combine: Combine,
    checks: Vec<Check>,
}

fn build_regex(pattern: &str, flags: &[String]) -> anyhow::Result<Regex> {
    let mut b = RegexBuilder::new(pattern);
    for f in flags {
        match f.as_str() {
            "i" => {
                b.case_insensitive(true);
            }
            "m" => {
                b.multi_line(true);
            }
            "s" => {
                b.dot_matches_new_line(true);
            }
            other => anyhow::bail!("unknown regex flag '{}'", other),
        }
    }
    b.build()
        .map_err(|e| anyhow::anyhow!("invalid regex pattern '{}': {}", pattern, e))
}

fn fold(s: &str, on: bool) -> String {
    if on {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

impl CompiledRules {
    pub fn parse(code: &str) -> anyhow::Result<Self> {
        // YAML is a superset of JSON, so one parser covers both spellings.
        let set: RuleSet = serde_yaml::from_str(code).map_err(|e| anyhow::anyhow!("invalid rule set: {}", e))?;
        Self::compile(set)
    }

    pub fn compile(set: RuleSet) -> anyhow::Result<Self> {
        if set.rules.is_empty() {
            anyhow::bail!("rule set has no rules");
        }
        let mut checks = Vec::with_capacity(set.rules.len());
        for rule in set.rules {
            let check = match rule {
                Rule::MustContain { field, values, case_insensitive } => Check::Contains {
                    field,
                    values,
                    fold: case_insensitive,
                    negate: false,
                },
                Rule::MustNotContain { field, values, case_insensitive } => Check::Contains {
                    field,
                    values,
                    fold: case_insensitive,
                    negate: true,
                },
                Rule::RegexMatch { field, pattern, flags } => Check::Regex {
                    field,
                    re: build_regex(&pattern, &flags)?,
                    pattern,
                    negate: false,
                },
                Rule::RegexNotMatch { field, pattern, flags } => Check::Regex {
                    field,
                    re: build_regex(&pattern, &flags)?,
                    pattern,
                    negate: true,
                },
                Rule::JsonSchema { field, schema } => {
                    let compiled = JSONSchema::options()
                        .compile(&schema)
                        .map_err(|e| anyhow::anyhow!("schema compile failed: {}", e))?;
                    Check::Schema {
                        field,
                        schema: Box::new(compiled),
                    }
                }
                Rule::EqualsField { field, other, case_insensitive } => Check::Field {
                    field,
                    other,
                    fold: case_insensitive,
                    equals: true,
                },
                Rule::ContainsField { field, other, case_insensitive } => Check::Field {
                    field,
                    other,
                    fold: case_insensitive,
                    equals: false,
                },
            };
            checks.push(check);
        }
        Ok(Self {
            combine: set.combine,
            checks,
        })
    }

    /// Runs every check; returns the score and the failure messages.
    pub fn score(&self, input: &EvaluatorInput) -> (f64, Vec<String>) {
        let mut failures = Vec::new();
        let mut passed = 0usize;
        for check in &self.checks {
            match run_check(check, input) {
                Ok(()) => passed += 1,
                Err(msg) => failures.push(msg),
            }
        }
        let total = self.checks.len().max(1) as f64;
        let score = match self.combine {
            Combine::All if failures.is_empty() => 1.0,
            Combine::All => 0.0,
            Combine::Mean => passed as f64 / total,
        };
        (score, failures)
    }
}

fn text_of(input: &EvaluatorInput, field: &str) -> Result<String, String> {
    input
        .var(field)
        .map(as_text)
        .ok_or_else(|| format!("field '{}' missing", field))
}

fn run_check(check: &Check, input: &EvaluatorInput) -> Result<(), String> {
    match check {
        Check::Contains { field, values, fold: f, negate } => {
            let hay = fold(&text_of(input, field)?, *f);
            for v in values {
                let found = hay.contains(&fold(v, *f));
                if found && *negate {
                    return Err(format!("{} contains forbidden substring: {}", field, v));
                }
                if !found && !*negate {
                    return Err(format!("{} missing substring: {}", field, v));
                }
            }
            Ok(())
        }
        Check::Regex { field, re, pattern, negate } => {
            let is_match = re.is_match(&text_of(input, field)?);
            match (is_match, *negate) {
                (true, true) => Err(format!("{} matched forbidden pattern '{}'", field, pattern)),
                (false, false) => Err(format!("{} did not match pattern '{}'", field, pattern)),
                _ => Ok(()),
            }
        }
        Check::Schema { field, schema } => {
            let value = input.var(field).ok_or_else(|| format!("field '{}' missing", field))?;
            // Targets usually hand back JSON as text.
            let instance = match value {
                Value::String(s) => serde_json::from_str(s)
                    .map_err(|_| format!("{} is not valid JSON", field))?,
                other => other.clone(),
            };
            if let Err(errors) = schema.validate(&instance) {
                let list: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(format!("{} failed schema: {}", field, list.join("; ")));
            }
            Ok(())
        }
        Check::Field { field, other, fold: f, equals } => {
            let a = fold(text_of(input, field)?.trim(), *f);
            let b = fold(text_of(input, other)?.trim(), *f);
            match (*equals, a == b, a.contains(&b)) {
                (true, false, _) => Err(format!("{} differs from {}", field, other)),
                (false, _, false) => Err(format!("{} does not contain {}", field, other)),
                _ => Ok(()),
            }
        }
    }
}

/// Executes `rules` snippets. Nothing runs outside the rule vocabulary above.
#[derive(Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    fn rules_of(content: &EvaluatorContent) -> EvalResult<CompiledRules> {
        let EvaluatorContent::Code { language, code } = content else {
            return Err(EvalError::InvalidParam("code evaluator needs code content".into()));
        };
        if language != LANGUAGE {
            return Err(EvalError::InvalidParam(format!("unsupported code language '{}'", language)));
        }
        CompiledRules::parse(code).map_err(|e| EvalError::InvalidParam(e.to_string()))
    }
}

#[async_trait]
impl EvaluatorExecutor for RuleEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Code
    }

    fn validate(&self, content: &EvaluatorContent) -> EvalResult<()> {
        Self::rules_of(content).map(|_| ())
    }

    async fn execute(
        &self,
        _ctx: &Ctx,
        version: &EvaluatorVersion,
        input: &EvaluatorInput,
    ) -> EvalResult<EvaluatorOutput> {
        let rules = Self::rules_of(&version.content)?;
        let (score, failures) = rules.score(input);
        let reasoning = if failures.is_empty() {
            format!("all {} rules passed", rules.checks.len())
        } else {
            failures.join("; ")
        };
        Ok(EvaluatorOutput {
            score: Some(score),
            reasoning: Some(reasoning),
            usage: TokenUsage::default(),
        })
    }
}
