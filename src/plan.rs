//! Plan documents and `${...}` placeholder substitution.
//!
//! A placeholder is `${name}` or `${name.path.to.field}`. `name` is a plan
//! variable or the name of an earlier step, whose result the path walks
//! (object keys, or array indices for arrays). A string that is exactly one
//! placeholder takes the JSON type of the value it resolves to; placeholders
//! embedded in a longer string are stringified.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Plan {
    /// Project the plan works on. May itself contain `${var}` placeholders.
    #[serde(default, alias = "project")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub options: PlanOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanStep {
    /// Name later steps use to reference this step's result.
    #[serde(default)]
    pub name: Option<String>,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_rollback")]
    pub rollback_on_fail: bool,
}

fn default_rollback() -> bool {
    true
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            rollback_on_fail: true,
        }
    }
}

impl Plan {
    /// Structural checks that do not need the registry.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.steps.is_empty() {
            return Err(AppError::validation("plan has no steps"));
        }
        let mut names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let index = i + 1;
            if step.method.trim().is_empty() {
                return Err(AppError::validation(format!("step {index} has an empty method")));
            }
            if !step.params.is_object() {
                return Err(AppError::validation(format!("step {index} params must be an object")));
            }
            let Some(name) = &step.name else { continue };
            if name.is_empty() || !name.chars().all(is_name_char) || name.contains('.') {
                return Err(AppError::validation(format!(
                    "step {index} name '{name}' may only use letters, digits, '_' and '-'"
                )));
            }
            if name == "project" || self.variables.contains_key(name) {
                return Err(AppError::validation(format!(
                    "step {index} name '{name}' shadows a variable"
                )));
            }
            if !names.insert(name.as_str()) {
                return Err(AppError::validation(format!("step name '{name}' is used twice")));
            }
        }
        Ok(())
    }
}

/// Read a plan file. Bad JSON is `INVALID_INPUT`; a wrong shape is
/// `VALIDATION_FAILED`.
pub fn load_plan(path: &Path) -> Result<Plan, AppError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            AppError::not_found(format!("plan file {} not found", path.display()))
        }
        _ => AppError::from(e),
    })?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::invalid_input(format!("plan is not valid JSON: {e}")))?;
    let plan: Plan = serde_json::from_value(value)
        .map_err(|e| AppError::validation(format!("invalid plan: {e}")))?;
    plan.validate()?;
    Ok(plan)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

// ── Substitution ────────────────────────────────────────────────

/// What placeholders can see while one step is being resolved.
pub struct Scope<'a> {
    pub variables: &'a Map<String, Value>,
    /// Results of earlier steps that ran, by step name.
    pub outputs: &'a HashMap<String, Value>,
    /// Earlier steps whose results are not available (dry run). References
    /// to them are deferred instead of failing.
    pub pending: &'a HashSet<String>,
}

/// A substituted template plus the placeholders left in place because they
/// reference steps that did not run.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub deferred: Vec<String>,
}

enum Lookup {
    Found(Value),
    Deferred,
    Missing,
}

/// Substitute every placeholder in `template`. Any placeholder that names
/// nothing, or walks a path that does not exist, fails the whole template
/// with `VALIDATION_FAILED`.
pub fn resolve(template: &Value, scope: &Scope<'_>) -> Result<Resolved, AppError> {
    let mut deferred = Vec::new();
    let mut missing = Vec::new();
    let value = substitute(template, scope, &mut deferred, &mut missing);
    if !missing.is_empty() {
        return Err(AppError::validation(format!(
            "unresolved placeholders: {}",
            missing
                .iter()
                .map(|m| format!("${{{m}}}"))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    deferred.sort();
    deferred.dedup();
    Ok(Resolved { value, deferred })
}

fn substitute(
    template: &Value,
    scope: &Scope<'_>,
    deferred: &mut Vec<String>,
    missing: &mut Vec<String>,
) -> Value {
    match template {
        Value::String(text) => substitute_string(text, scope, deferred, missing),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, scope, deferred, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, scope, deferred, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Split a string into literal text and placeholder tokens.
fn tokens(text: &str) -> Vec<(bool, &str)> {
    let mut parts = Vec::new();
    let mut literal_from = 0;
    let mut search_from = 0;
    while let Some(found) = text.get(search_from..).and_then(|s| s.find("${")) {
        let open = search_from + found;
        let body = open + 2;
        let Some(close) = text.get(body..).and_then(|s| s.find('}')).map(|i| body + i) else {
            break;
        };
        let token = text.get(body..close).unwrap_or_default();
        if token.is_empty() || !token.chars().all(is_name_char) {
            search_from = body;
            continue;
        }
        if open > literal_from {
            parts.push((false, text.get(literal_from..open).unwrap_or_default()));
        }
        parts.push((true, token));
        literal_from = close + 1;
        search_from = literal_from;
    }
    if literal_from < text.len() {
        parts.push((false, text.get(literal_from..).unwrap_or_default()));
    }
    parts
}

fn substitute_string(
    text: &str,
    scope: &Scope<'_>,
    deferred: &mut Vec<String>,
    missing: &mut Vec<String>,
) -> Value {
    let parts = tokens(text);
    if let [(true, token)] = parts.as_slice() {
        return match lookup(token, scope) {
            Lookup::Found(value) => value,
            Lookup::Deferred => {
                deferred.push((*token).to_string());
                Value::String(text.to_string())
            }
            Lookup::Missing => {
                missing.push((*token).to_string());
                Value::String(text.to_string())
            }
        };
    }

    let mut out = String::with_capacity(text.len());
    for (is_placeholder, part) in parts {
        if !is_placeholder {
            out.push_str(part);
            continue;
        }
        match lookup(part, scope) {
            Lookup::Found(Value::String(s)) => out.push_str(&s),
            Lookup::Found(value) => out.push_str(&value.to_string()),
            Lookup::Deferred => {
                deferred.push(part.to_string());
                let _ = write!(out, "${{{part}}}");
            }
            Lookup::Missing => {
                missing.push(part.to_string());
                let _ = write!(out, "${{{part}}}");
            }
        }
    }
    Value::String(out)
}

fn lookup(token: &str, scope: &Scope<'_>) -> Lookup {
    let mut segments = token.split('.');
    let head = segments.next().unwrap_or_default();
    let root = if let Some(value) = scope.variables.get(head) {
        value
    } else if let Some(value) = scope.outputs.get(head) {
        value
    } else if scope.pending.contains(head) {
        return Lookup::Deferred;
    } else {
        return Lookup::Missing;
    };
    let mut current = root;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Lookup::Missing,
        }
    }
    Lookup::Found(current.clone())
}
