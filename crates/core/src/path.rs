//! JSONPath evaluation against untyped trees. Expressions are compiled once
//! when a plan is parsed and evaluated on every poll tick.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use serde_json_path::JsonPath;

/// A compiled JSONPath plus an optional fallback for when the path yields
/// nothing. Evaluation requires exactly one result otherwise.
#[derive(Debug, Clone)]
pub struct PathEvaluator {
    expr: String,
    path: JsonPath,
    default: Option<Value>,
}

impl PathEvaluator {
    pub fn compile(expr: &str, default: Option<Value>) -> Result<Self> {
        let normalized = normalize(expr);
        let path = JsonPath::parse(&normalized)
            .with_context(|| format!("compiling JSONPath {:?}", expr))?;
        Ok(PathEvaluator {
            expr: expr.to_string(),
            path,
            default,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Evaluate against `doc`. One result wins; zero results fall back to
    /// the default when configured. Anything else is an error.
    pub fn eval(&self, doc: &Value) -> Result<Value> {
        let nodes = self.path.query(doc).all();
        match nodes.len() {
            1 => Ok(nodes[0].clone()),
            0 => match &self.default {
                Some(d) => Ok(d.clone()),
                None => Err(anyhow!(
                    "path {:?}: expected exactly one result, found none",
                    self.expr
                )),
            },
            n => Err(anyhow!(
                "path {:?}: expected exactly one result, found {}",
                self.expr,
                n
            )),
        }
    }
}

/// Accept the relaxed path spellings that show up in plans written by hand:
/// `{.status.x}`, `.status.x` and `status.x` all mean `$.status.x`.
fn normalize(expr: &str) -> String {
    let expr = expr.trim();
    let expr = expr
        .strip_prefix('{')
        .and_then(|e| e.strip_suffix('}'))
        .unwrap_or(expr)
        .trim();
    if expr.starts_with('$') {
        expr.to_string()
    } else if expr.starts_with('.') || expr.starts_with('[') {
        format!("${}", expr)
    } else {
        format!("$.{}", expr)
    }
}
