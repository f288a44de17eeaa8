//! The validator trait and the built-in validators
//!
//! Built-ins cover the common commit hazards: null writes, missing
//! required fields, skipped versions, oversized values. Anything more
//! specific is a [`PredicateValidator`] with a closure.

use crate::{FailureCode, Validation};
use keel_types::{DiffOp, StateDiff};
use std::sync::Arc;

/// A pure check over a proposed diff set.
///
/// Implementations must not touch any state outside the diffs they are
/// given; the same diff set must always produce the same verdict.
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    /// Relative weight in the gate's confidence score.
    fn weight(&self) -> f64 {
        1.0
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation;
}

// ── not_null ─────────────────────────────────────────────────────────

/// Rejects writes of `null`, either as the whole value or as any
/// top-level object field.
#[derive(Debug, Default)]
pub struct NotNullValidator;

impl Validator for NotNullValidator {
    fn name(&self) -> &str {
        "not_null"
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation {
        for diff in diffs {
            let value = match diff.new_value() {
                Some(value) => value,
                None => continue,
            };
            if value.is_null() {
                return Validation::fail(
                    FailureCode::MissingData,
                    format!("{} writes a null value", diff.key),
                );
            }
            if let Some(map) = value.as_object() {
                if let Some((field, _)) = map.iter().find(|(_, v)| v.is_null()) {
                    return Validation::fail(
                        FailureCode::MissingData,
                        format!("{} field {field} is null", diff.key),
                    );
                }
            }
        }
        Validation::pass()
    }
}

// ── schema ───────────────────────────────────────────────────────────

/// One schema requirement: keys under `prefix` must carry `required`
/// top-level fields.
#[derive(Clone, Debug)]
pub struct SchemaRule {
    pub prefix: String,
    pub required: Vec<String>,
}

/// Checks written values against per-prefix required fields.
#[derive(Debug, Default)]
pub struct SchemaValidator {
    rules: Vec<SchemaRule>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, prefix: impl Into<String>, fields: &[&str]) -> Self {
        self.rules.push(SchemaRule {
            prefix: prefix.into(),
            required: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }
}

impl Validator for SchemaValidator {
    fn name(&self) -> &str {
        "schema"
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation {
        for diff in diffs {
            let value = match diff.new_value() {
                Some(value) => value,
                None => continue,
            };
            for rule in self.rules.iter().filter(|r| diff.key.starts_with(&r.prefix)) {
                let map = match value.as_object() {
                    Some(map) => map,
                    None => {
                        return Validation::fail(
                            FailureCode::MissingData,
                            format!("{} must be an object", diff.key),
                        )
                    }
                };
                if let Some(missing) = rule.required.iter().find(|f| !map.contains_key(*f)) {
                    return Validation::fail(
                        FailureCode::MissingData,
                        format!("{} is missing required field {missing}", diff.key),
                    );
                }
            }
        }
        Validation::pass()
    }
}

// ── monotonic_version ────────────────────────────────────────────────

/// Enforces version discipline on the diff set: creates start a
/// sequence, updates advance it by exactly one, deletes name what they
/// remove.
#[derive(Debug, Default)]
pub struct MonotonicVersionValidator;

impl Validator for MonotonicVersionValidator {
    fn name(&self) -> &str {
        "monotonic_version"
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation {
        for diff in diffs {
            match diff.op {
                DiffOp::Create => {
                    if diff.before.is_some() {
                        return Validation::fail(
                            FailureCode::Conflict,
                            format!("create of {} has a before image", diff.key),
                        );
                    }
                    match &diff.after {
                        Some(after) if after.version >= 1 => {}
                        Some(after) => {
                            return Validation::fail(
                                FailureCode::Conflict,
                                format!("create of {} at version {}", diff.key, after.version),
                            )
                        }
                        None => {
                            return Validation::fail(
                                FailureCode::ToolError,
                                format!("create of {} carries no after image", diff.key),
                            )
                        }
                    }
                }
                DiffOp::Update => match (&diff.before, &diff.after) {
                    (Some(before), Some(after)) if after.version == before.version + 1 => {}
                    (Some(before), Some(after)) => {
                        return Validation::fail(
                            FailureCode::Conflict,
                            format!(
                                "update of {} jumps version {} -> {}",
                                diff.key, before.version, after.version
                            ),
                        )
                    }
                    _ => {
                        return Validation::fail(
                            FailureCode::ToolError,
                            format!("update of {} lacks before or after image", diff.key),
                        )
                    }
                },
                DiffOp::Delete => {
                    if diff.before.is_none() {
                        return Validation::fail(
                            FailureCode::ToolError,
                            format!("delete of {} carries no before image", diff.key),
                        );
                    }
                }
            }
        }
        Validation::pass()
    }
}

// ── max_size ─────────────────────────────────────────────────────────

/// Caps the serialized size of any single written value.
#[derive(Debug)]
pub struct MaxSizeValidator {
    max_bytes: usize,
}

impl MaxSizeValidator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Validator for MaxSizeValidator {
    fn name(&self) -> &str {
        "max_size"
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation {
        for diff in diffs {
            let value = match diff.new_value() {
                Some(value) => value,
                None => continue,
            };
            let bytes = match serde_json::to_vec(value) {
                Ok(bytes) => bytes.len(),
                Err(err) => {
                    return Validation::fail(
                        FailureCode::ToolError,
                        format!("{} is unserializable: {err}", diff.key),
                    )
                }
            };
            if bytes > self.max_bytes {
                return Validation::fail(
                    FailureCode::PolicyViolation,
                    format!("{} is {bytes} bytes, limit {}", diff.key, self.max_bytes),
                );
            }
        }
        Validation::pass()
    }
}

// ── predicate ────────────────────────────────────────────────────────

type DiffPredicate = Arc<dyn Fn(&StateDiff) -> bool + Send + Sync>;

/// Wraps an arbitrary per-diff closure as a validator.
pub struct PredicateValidator {
    name: String,
    weight: f64,
    code: FailureCode,
    predicate: DiffPredicate,
}

impl PredicateValidator {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&StateDiff) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            code: FailureCode::PolicyViolation,
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_code(mut self, code: FailureCode) -> Self {
        self.code = code;
        self
    }
}

impl Validator for PredicateValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn validate(&self, diffs: &[StateDiff]) -> Validation {
        for diff in diffs {
            if !(self.predicate)(diff) {
                return Validation::fail(
                    self.code,
                    format!("predicate {} rejected {}", self.name, diff.key),
                );
            }
        }
        Validation::pass()
    }
}
