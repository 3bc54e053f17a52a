//! Rule evaluation: turning provider templates into concrete values.
//!
//! Provider configurations are JSON templates. Before a provider can list,
//! check out or check in resources, the relevant part of its template is
//! evaluated against a [`Dataset`], the runtime context holding the testrun
//! identity, the suite dataset and whatever has been bound so far (`iut`,
//! `executor`, `suite`, ...).
//!
//! # Template Language
//!
//! | Form | Result |
//! |------|--------|
//! | `"$identity.name"` | Dataset lookup, value type preserved |
//! | `"$this.possible"` | Already-evaluated sibling member of the enclosing object |
//! | `"image-${iut.id}"` | String interpolation |
//! | `"$$literal"` | The string `"$literal"` |
//! | `{"$expand": {"value": v, "to": n}}` | `v` evaluated and repeated `n` times |
//! | `{"$uuid_generate": {}}` | A fresh v4 UUID string |
//! | `{"$json_dumps": v}` | `v` evaluated and serialized to a JSON string |
//! | `{"$join": {"strings": [..], "separator": s}}` | Joined string |
//! | `{"$condition": {"if": c, "then": a, "else": b}}` | `a` if `c` is truthy, else `b` |
//!
//! Anything else evaluates to itself, with objects and arrays evaluated
//! member by member in document order.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Result type for rule evaluation.
pub type RuleResult<T> = Result<T, RuleError>;

/// Errors raised while evaluating a template.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// A `$path` lookup did not resolve.
    #[error("Unknown reference '{0}'")]
    UnknownReference(String),

    /// An operator object had the wrong shape.
    #[error("Invalid '{operator}' expression: {reason}")]
    InvalidOperator { operator: String, reason: String },

    /// A value bound into the dataset could not be represented as JSON.
    #[error("Failed to serialize dataset value '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable evaluation context.
///
/// Binding a value produces a new dataset; the original is untouched, so a
/// binding made for one IUT can never leak into the next one.
///
/// ```
/// use serde_json::json;
/// use testbed::rules::Dataset;
///
/// let base = Dataset::new().with("identity", json!({"name": "product"}));
/// let bound = base.with("iut", json!({"id": "iut-1"}));
///
/// assert!(base.get("iut").is_none());
/// assert_eq!(bound.lookup("iut.id"), Some(&json!("iut-1")));
/// assert_eq!(bound.lookup("identity.name"), Some(&json!("product")));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    values: Arc<Map<String, Value>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dataset from an existing JSON object.
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    /// Returns a copy with `key` bound to `value`.
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value);
        Self::from_map(values)
    }

    /// Like [`with`](Self::with) for any serializable value.
    pub fn with_serialized<T: Serialize>(&self, key: &str, value: &T) -> RuleResult<Self> {
        let value = serde_json::to_value(value).map_err(|source| RuleError::Serialize {
            key: key.to_string(),
            source,
        })?;
        Ok(self.with(key, value))
    }

    /// Returns a copy with every member of `other` bound at top level.
    pub fn merged(&self, other: &Map<String, Value>) -> Self {
        let mut values = (*self.values).clone();
        for (key, value) in other {
            values.insert(key.clone(), value.clone());
        }
        Self::from_map(values)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Resolves a dotted path. Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = step(current, segment)?;
        }
        Some(current)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Evaluates templates against a dataset.
///
/// Evaluation must be side-effect free from the caller's point of view.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, template: &Value, dataset: &Dataset) -> RuleResult<Value>;
}

/// The built-in evaluator for the template language described in the
/// module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("interpolation pattern is valid")
});

impl RuleEvaluator for TemplateEvaluator {
    fn evaluate(&self, template: &Value, dataset: &Dataset) -> RuleResult<Value> {
        eval(template, dataset, None)
    }
}

fn eval(template: &Value, dataset: &Dataset, this: Option<&Map<String, Value>>) -> RuleResult<Value> {
    match template {
        Value::String(s) => eval_string(s, dataset, this),
        Value::Array(items) => items
            .iter()
            .map(|item| eval(item, dataset, this))
            .collect::<RuleResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            if map.len() == 1
                && let Some((key, body)) = map.iter().next()
                && let Some(result) = eval_operator(key, body, dataset, this)?
            {
                return Ok(result);
            }
            let mut evaluated = Map::new();
            for (key, value) in map {
                let value = eval(value, dataset, Some(&evaluated))?;
                evaluated.insert(key.clone(), value);
            }
            Ok(Value::Object(evaluated))
        }
        other => Ok(other.clone()),
    }
}

fn resolve<'a>(
    path: &str,
    dataset: &'a Dataset,
    this: Option<&'a Map<String, Value>>,
) -> RuleResult<&'a Value> {
    let found = match path.strip_prefix("this.") {
        Some(rest) => this.and_then(|members| {
            let mut segments = rest.split('.');
            let mut current = members.get(segments.next()?)?;
            for segment in segments {
                current = step(current, segment)?;
            }
            Some(current)
        }),
        None => dataset.lookup(path),
    };
    found.ok_or_else(|| RuleError::UnknownReference(path.to_string()))
}

fn eval_string(s: &str, dataset: &Dataset, this: Option<&Map<String, Value>>) -> RuleResult<Value> {
    if let Some(literal) = s.strip_prefix("$$") {
        return Ok(Value::String(format!("${literal}")));
    }
    if let Some(path) = s.strip_prefix('$')
        && !path.is_empty()
        && !path.starts_with('{')
    {
        return resolve(path, dataset, this).cloned();
    }
    if !INTERPOLATION.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in INTERPOLATION.captures_iter(s) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&s[last..whole.start()]);
        match resolve(&caps[1], dataset, this)? {
            Value::String(inner) => out.push_str(inner),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn invalid(operator: &str, reason: impl Into<String>) -> RuleError {
    RuleError::InvalidOperator {
        operator: operator.to_string(),
        reason: reason.into(),
    }
}

fn eval_operator(
    key: &str,
    body: &Value,
    dataset: &Dataset,
    this: Option<&Map<String, Value>>,
) -> RuleResult<Option<Value>> {
    let result = match key {
        "$expand" => {
            let body = eval(body, dataset, this)?;
            let value = body
                .get("value")
                .ok_or_else(|| invalid(key, "missing 'value'"))?;
            let to = body
                .get("to")
                .and_then(as_count)
                .ok_or_else(|| invalid(key, "'to' must be a non-negative integer"))?;
            Value::Array(vec![value.clone(); to])
        }
        "$uuid_generate" => Value::String(uuid::Uuid::new_v4().to_string()),
        "$json_dumps" => {
            let value = eval(body, dataset, this)?;
            Value::String(value.to_string())
        }
        "$join" => {
            let body = eval(body, dataset, this)?;
            let strings = body
                .get("strings")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(key, "'strings' must be an array"))?;
            let separator = body.get("separator").and_then(Value::as_str).unwrap_or("");
            let parts: Vec<String> = strings
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Value::String(parts.join(separator))
        }
        "$condition" => {
            let condition = body
                .get("if")
                .ok_or_else(|| invalid(key, "missing 'if'"))?;
            let branch = if is_truthy(&eval(condition, dataset, this)?) {
                body.get("then")
            } else {
                body.get("else")
            };
            match branch {
                Some(branch) => eval(branch, dataset, this)?,
                None => Value::Null,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Truthiness used by conditions and by provider rules that answer yes/no.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
