use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{WorkflowRun, WorkflowRunJob};
use crate::workflow::{JobDefinition, RawConcurrency};

/// Result and outputs of a needed job, as seen by expressions (`needs.<id>.*`).
#[derive(Serialize, Clone, Debug, PartialEq, Default)]
pub struct JobResult {
    pub result: String,
    pub outputs: BTreeMap<String, String>,
}

/// Everything an expression may read while evaluating a job's concurrency.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub job_id: &'a str,
    pub job: Option<&'a JobDefinition>,
    pub github: &'a BTreeMap<String, String>,
    pub vars: &'a BTreeMap<String, String>,
    pub needs: &'a BTreeMap<String, JobResult>,
}

/// Turns authored concurrency into a concrete group key and cancel flag.
///
/// Implementations are pure: same inputs, same output.
pub trait ConcurrencyEvaluator: Send + Sync + 'static {
    fn evaluate_concurrency(&self, raw: &RawConcurrency, ctx: &EvalContext<'_>) -> (String, bool);
}

/// The `github` context of a job: run and event metadata as strings.
pub fn git_context(run: &WorkflowRun, job: &WorkflowRunJob) -> BTreeMap<String, String> {
    let ref_name = run
        .ref_name
        .strip_prefix("refs/heads/")
        .or_else(|| run.ref_name.strip_prefix("refs/tags/"))
        .unwrap_or(&run.ref_name);
    let ref_type = if run.ref_name.starts_with("refs/tags/") {
        "tag"
    } else {
        "branch"
    };
    let owner = run.repository.split('/').next().unwrap_or_default();

    BTreeMap::from([
        ("event_name".to_string(), run.event.clone()),
        ("ref".to_string(), run.ref_name.clone()),
        ("ref_name".to_string(), ref_name.to_string()),
        ("ref_type".to_string(), ref_type.to_string()),
        ("sha".to_string(), run.commit_sha.clone()),
        ("repository".to_string(), run.repository.clone()),
        ("repository_owner".to_string(), owner.to_string()),
        ("workflow".to_string(), run.workflow_id.clone()),
        ("run_id".to_string(), run.id.to_string()),
        ("run_number".to_string(), run.index.to_string()),
        ("actor".to_string(), run.trigger_user.clone()),
        ("job".to_string(), job.job_id.clone()),
    ])
}

// --- Template evaluator ---

/// Minimal `${{ ... }}` interpolation.
///
/// Supported: `github.*`, `vars.*`, `job.id`, `needs.<id>.result`,
/// `needs.<id>.outputs.<key>`, `matrix.*`, single-quoted literals,
/// `true`/`false`, numbers and `a || b` fallbacks. Unknown references
/// evaluate to an empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

impl ConcurrencyEvaluator for TemplateEvaluator {
    fn evaluate_concurrency(&self, raw: &RawConcurrency, ctx: &EvalContext<'_>) -> (String, bool) {
        let group = interpolate(&raw.group, ctx).trim().to_string();
        let cancel = is_truthy(&interpolate(&raw.cancel_in_progress, ctx).trim().to_lowercase());
        (group, cancel)
    }
}

/// Replace every `${{ expr }}` in `template`. An unterminated opener is kept verbatim.
pub fn interpolate(template: &str, ctx: &EvalContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                out.push_str(&evaluate(&after[..end], ctx));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn evaluate(expr: &str, ctx: &EvalContext<'_>) -> String {
    let operands = split_or(expr);
    let last = operands.len().saturating_sub(1);
    for (i, operand) in operands.iter().enumerate() {
        let value = term(operand.trim(), ctx);
        if is_truthy(&value) || i == last {
            return value;
        }
    }
    String::new()
}

/// Split on `||` outside single-quoted literals.
fn split_or(expr: &str) -> Vec<&str> {
    let bytes = expr.as_bytes();
    let mut parts = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'|' if !in_quote && bytes.get(i + 1) == Some(&b'|') => {
                parts.push(&expr[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

fn is_truthy(value: &str) -> bool {
    !(value.is_empty() || value == "false" || value == "0" || value == "null")
}

fn term(term: &str, ctx: &EvalContext<'_>) -> String {
    if let Some(inner) = term.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return inner.replace("''", "'");
    }
    if term == "true" || term == "false" || term.parse::<f64>().is_ok() {
        return term.to_string();
    }

    let path: Vec<&str> = term.split('.').collect();
    match path.as_slice() {
        ["github", key] => ctx.github.get(*key).cloned().unwrap_or_default(),
        ["vars", key] => ctx.vars.get(*key).cloned().unwrap_or_default(),
        ["job", "id"] => ctx.job_id.to_string(),
        ["needs", id, "result"] => ctx
            .needs
            .get(*id)
            .map(|n| n.result.clone())
            .unwrap_or_default(),
        ["needs", id, "outputs", key] => ctx
            .needs
            .get(*id)
            .and_then(|n| n.outputs.get(*key).cloned())
            .unwrap_or_default(),
        ["matrix", key] => matrix_value(ctx, key),
        _ => String::new(),
    }
}

fn matrix_value(ctx: &EvalContext<'_>, key: &str) -> String {
    let value = ctx
        .job
        .and_then(|job| job.strategy.as_ref())
        .and_then(|strategy| strategy.matrix.get(key))
        .and_then(|values| values.first());
    match value {
        Some(serde_yaml_ng::Value::String(s)) => s.clone(),
        Some(serde_yaml_ng::Value::Bool(b)) => b.to_string(),
        Some(serde_yaml_ng::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
