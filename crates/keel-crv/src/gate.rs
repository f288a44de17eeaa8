//! Gates and gate chains

use crate::{RecoveryStrategy, Validation, Validator};
use keel_types::StateDiff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_block() -> bool {
    true
}

/// Gate configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    /// Whether a failed evaluation refuses the commit
    #[serde(default = "default_block")]
    pub block_on_failure: bool,
    /// Optional confidence floor. When set, the gate passes on
    /// confidence alone, which lets low-weight validators fail without
    /// blocking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_confidence: Option<f64>,
}

impl GateConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_on_failure: true,
            required_confidence: None,
        }
    }

    pub fn advisory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_on_failure: false,
            required_confidence: None,
        }
    }

    pub fn with_required_confidence(mut self, confidence: f64) -> Self {
        self.required_confidence = Some(confidence);
        self
    }
}

/// One validator's contribution to a gate evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorOutcome {
    pub validator: String,
    pub weight: f64,
    #[serde(flatten)]
    pub validation: Validation,
}

/// The gate's verdict on one diff set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    /// Weighted fraction of validators that passed, in [0, 1]
    pub confidence: f64,
    /// `block_on_failure && !passed`; a blocked result means the
    /// accompanying commit must not happen
    pub blocked: bool,
    pub validator_results: Vec<ValidatorOutcome>,
    /// Suggested recovery, taken from the first failing validator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryStrategy>,
}

impl GateResult {
    /// First failing validator's outcome, if any.
    pub fn first_failure(&self) -> Option<&ValidatorOutcome> {
        self.validator_results.iter().find(|o| !o.validation.passed)
    }
}

/// An ordered list of validators with a blocking policy.
pub struct Gate {
    config: GateConfig,
    validators: Vec<Arc<dyn Validator>>,
}

impl Gate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            validators: Vec::new(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run every validator over the diff set and fold the outcomes.
    ///
    /// An empty gate passes vacuously with confidence 1.0.
    pub fn evaluate(&self, diffs: &[StateDiff]) -> GateResult {
        let mut outcomes = Vec::with_capacity(self.validators.len());
        let mut passed_weight = 0.0_f64;
        let mut total_weight = 0.0_f64;

        for validator in &self.validators {
            let validation = validator.validate(diffs);
            let weight = validator.weight();
            total_weight += weight;
            if validation.passed {
                passed_weight += weight;
            }
            outcomes.push(ValidatorOutcome {
                validator: validator.name().to_string(),
                weight,
                validation,
            });
        }

        let confidence = if total_weight > 0.0 {
            passed_weight / total_weight
        } else {
            1.0
        };

        let all_passed = outcomes.iter().all(|o| o.validation.passed);
        let passed = match self.config.required_confidence {
            Some(floor) => confidence >= floor,
            None => all_passed,
        };
        let blocked = self.config.block_on_failure && !passed;

        let recovery = if passed {
            None
        } else {
            outcomes
                .iter()
                .find(|o| !o.validation.passed)
                .and_then(|o| o.validation.code)
                .map(|code| code.default_recovery())
        };

        if blocked {
            tracing::warn!(
                gate = %self.config.name,
                confidence,
                diffs = diffs.len(),
                "gate blocked commit"
            );
        }

        GateResult {
            gate: self.config.name.clone(),
            passed,
            confidence,
            blocked,
            validator_results: outcomes,
            recovery,
        }
    }
}

/// The chain's verdict: every evaluated gate's result, plus whether any
/// of them blocked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainResult {
    pub results: Vec<GateResult>,
    pub blocked: bool,
}

impl ChainResult {
    pub fn passed(&self) -> bool {
        !self.blocked && self.results.iter().all(|r| r.passed)
    }

    /// The gate that refused the commit, if any.
    pub fn first_block(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.blocked)
    }
}

/// Gates evaluated in order.
///
/// The chain short-circuits on the first blocking gate but keeps every
/// result produced up to that point, so audits see the whole story.
#[derive(Default)]
pub struct GateChain {
    gates: Vec<Gate>,
}

impl GateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn evaluate(&self, diffs: &[StateDiff]) -> ChainResult {
        let mut results = Vec::with_capacity(self.gates.len());
        let mut blocked = false;
        for gate in &self.gates {
            let result = gate.evaluate(diffs);
            let stop = result.blocked;
            results.push(result);
            if stop {
                blocked = true;
                break;
            }
        }
        ChainResult { results, blocked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureCode, MonotonicVersionValidator, NotNullValidator, PredicateValidator};
    use keel_types::{DiffOp, StateEntry};
    use serde_json::json;

    fn create_diff(key: &str, value: serde_json::Value) -> StateDiff {
        StateDiff::new(key, DiffOp::Create, None, Some(StateEntry::new(key, value)))
    }

    fn blocking_gate() -> Gate {
        Gate::new(GateConfig::new("pre_commit"))
            .with_validator(Arc::new(NotNullValidator))
            .with_validator(Arc::new(MonotonicVersionValidator))
    }

    #[test]
    fn clean_diffs_pass_with_full_confidence() {
        let result = blocking_gate().evaluate(&[create_diff("a", json!({"n": 1}))]);
        assert!(result.passed);
        assert!(!result.blocked);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.validator_results.len(), 2);
    }

    #[test]
    fn null_value_blocks_and_suggests_recovery() {
        let result = blocking_gate().evaluate(&[create_diff("a", json!(null))]);
        assert!(!result.passed);
        assert!(result.blocked);
        assert!(result.confidence < 1.0);
        assert_eq!(result.recovery, Some(RecoveryStrategy::AskUser));
        assert_eq!(
            result.first_failure().unwrap().validation.code,
            Some(FailureCode::MissingData)
        );
    }

    #[test]
    fn advisory_gate_fails_without_blocking() {
        let gate = Gate::new(GateConfig::advisory("advisory"))
            .with_validator(Arc::new(NotNullValidator));
        let result = gate.evaluate(&[create_diff("a", json!(null))]);
        assert!(!result.passed);
        assert!(!result.blocked);
    }

    #[test]
    fn confidence_floor_tolerates_light_failures() {
        let gate = Gate::new(GateConfig::new("weighted").with_required_confidence(0.6))
            .with_validator(Arc::new(NotNullValidator))
            .with_validator(Arc::new(
                PredicateValidator::new("always_no", |_| false).with_weight(0.25),
            ));
        let result = gate.evaluate(&[create_diff("a", json!(1))]);
        assert!(result.confidence > 0.6);
        assert!(result.passed);
        assert!(!result.blocked);
    }

    #[test]
    fn empty_gate_passes_vacuously() {
        let gate = Gate::new(GateConfig::new("empty"));
        let result = gate.evaluate(&[create_diff("a", json!(1))]);
        assert!(result.passed);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn chain_short_circuits_but_keeps_results() {
        let chain = GateChain::new()
            .with_gate(
                Gate::new(GateConfig::new("first")).with_validator(Arc::new(NotNullValidator)),
            )
            .with_gate(
                Gate::new(GateConfig::new("second"))
                    .with_validator(Arc::new(MonotonicVersionValidator)),
            );
        let result = chain.evaluate(&[create_diff("a", json!(null))]);
        assert!(result.blocked);
        // Second gate never ran
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.first_block().unwrap().gate, "first");
    }

    #[test]
    fn chain_runs_all_gates_when_clean() {
        let chain = GateChain::new()
            .with_gate(
                Gate::new(GateConfig::new("first")).with_validator(Arc::new(NotNullValidator)),
            )
            .with_gate(
                Gate::new(GateConfig::new("second"))
                    .with_validator(Arc::new(MonotonicVersionValidator)),
            );
        let result = chain.evaluate(&[create_diff("a", json!(1))]);
        assert!(result.passed());
        assert_eq!(result.results.len(), 2);
    }

    #[test]
    fn empty_chain_never_blocks() {
        let chain = GateChain::new();
        let result = chain.evaluate(&[create_diff("a", json!(null))]);
        assert!(!result.blocked);
        assert!(result.passed());
    }
}
