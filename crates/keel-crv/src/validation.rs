//! Validation outcomes and the failure taxonomy

use serde::{Deserialize, Serialize};

/// Why a validator said no.
///
/// The code is machine-readable so recovery can be chosen without
/// parsing reasons out of strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// A required field or value is absent
    MissingData,
    /// The diff contradicts existing state or version ordering
    Conflict,
    /// The change exceeds what this gate is willing to consider
    OutOfScope,
    /// The gate's confidence fell below its configured floor
    LowConfidence,
    /// A configured limit or rule was violated
    PolicyViolation,
    /// The producing tool misbehaved
    ToolError,
    /// The same inputs produced different outputs
    NonDeterminism,
}

impl FailureCode {
    /// Default recovery for this class of failure.
    pub fn default_recovery(&self) -> RecoveryStrategy {
        match self {
            FailureCode::MissingData | FailureCode::LowConfidence => RecoveryStrategy::AskUser,
            FailureCode::ToolError => RecoveryStrategy::RetryAltTool,
            FailureCode::Conflict
            | FailureCode::OutOfScope
            | FailureCode::PolicyViolation
            | FailureCode::NonDeterminism => RecoveryStrategy::Escalate,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::MissingData => write!(f, "MISSING_DATA"),
            FailureCode::Conflict => write!(f, "CONFLICT"),
            FailureCode::OutOfScope => write!(f, "OUT_OF_SCOPE"),
            FailureCode::LowConfidence => write!(f, "LOW_CONFIDENCE"),
            FailureCode::PolicyViolation => write!(f, "POLICY_VIOLATION"),
            FailureCode::ToolError => write!(f, "TOOL_ERROR"),
            FailureCode::NonDeterminism => write!(f, "NON_DETERMINISM"),
        }
    }
}

/// What a blocked commit should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the producing step with a different tool
    RetryAltTool,
    /// Surface to a human and wait
    AskUser,
    /// Hand to a supervisor or operator
    Escalate,
    /// Accept the failure and move on
    Ignore,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::RetryAltTool => write!(f, "retry_alt_tool"),
            RecoveryStrategy::AskUser => write!(f, "ask_user"),
            RecoveryStrategy::Escalate => write!(f, "escalate"),
            RecoveryStrategy::Ignore => write!(f, "ignore"),
        }
    }
}

/// One validator's verdict on a diff set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validation {
    pub fn pass() -> Self {
        Self {
            passed: true,
            code: None,
            reason: None,
        }
    }

    pub fn fail(code: FailureCode, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&FailureCode::MissingData).unwrap(),
            "\"MISSING_DATA\""
        );
        assert_eq!(FailureCode::NonDeterminism.to_string(), "NON_DETERMINISM");
    }

    #[test]
    fn default_recovery_mapping() {
        assert_eq!(
            FailureCode::MissingData.default_recovery(),
            RecoveryStrategy::AskUser
        );
        assert_eq!(
            FailureCode::ToolError.default_recovery(),
            RecoveryStrategy::RetryAltTool
        );
        assert_eq!(
            FailureCode::PolicyViolation.default_recovery(),
            RecoveryStrategy::Escalate
        );
    }

    #[test]
    fn fail_carries_code_and_reason() {
        let v = Validation::fail(FailureCode::Conflict, "version skipped");
        assert!(!v.passed);
        assert_eq!(v.code, Some(FailureCode::Conflict));
        assert_eq!(v.reason.as_deref(), Some("version skipped"));
    }
}
