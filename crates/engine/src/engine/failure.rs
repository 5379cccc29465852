//! Typed failure reasons attached to node executions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Classification of a failure, used by advisers to decide applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    UnknownFailure,
    ConnectivityFailure,
    AuthenticationFailure,
    AuthorizationFailure,
    VerificationFailure,
    ApplicationFailure,
    PolicyEvaluationFailure,
    Expired,
    UserMarkedFailure,
    ApprovalRejection,
}

/// One failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

/// Failure details recorded on a node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub error_message: String,
    #[serde(default)]
    pub failure_data: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        let message = message.into();
        Self {
            error_message: message.clone(),
            failure_data: vec![FailureData {
                message,
                code: None,
                failure_types: vec![failure_type],
            }],
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        if let Some(first) = self.failure_data.first_mut() {
            first.code = Some(code.into());
        }
        self
    }

    /// Synthesized when a task or node deadline passes.
    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(message, FailureType::Expired)
    }

    /// Union of the failure types across all reasons.
    pub fn failure_types(&self) -> HashSet<FailureType> {
        self.failure_data
            .iter()
            .flat_map(|d| d.failure_types.iter().copied())
            .collect()
    }
}

/// Whether `info` matches an adviser's configured failure types.
///
/// An empty configured set matches every failure, including ones without
/// failure info.
pub fn failure_types_match(configured: &[FailureType], info: Option<&FailureInfo>) -> bool {
    if configured.is_empty() {
        return true;
    }
    let Some(info) = info else {
        return false;
    };
    let types = info.failure_types();
    configured.iter().any(|t| types.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_types_union() {
        let mut info = FailureInfo::new("boom", FailureType::ConnectivityFailure);
        info.failure_data.push(FailureData {
            message: "also".into(),
            code: None,
            failure_types: vec![FailureType::AuthenticationFailure],
        });
        let types = info.failure_types();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&FailureType::AuthenticationFailure));
    }

    #[test]
    fn test_failure_types_match() {
        let info = FailureInfo::new("down", FailureType::ConnectivityFailure);
        assert!(failure_types_match(&[], Some(&info)));
        assert!(failure_types_match(&[], None));
        assert!(failure_types_match(
            &[FailureType::ApplicationFailure, FailureType::ConnectivityFailure],
            Some(&info)
        ));
        assert!(!failure_types_match(&[FailureType::ApplicationFailure], Some(&info)));
        assert!(!failure_types_match(&[FailureType::ApplicationFailure], None));
    }

    #[test]
    fn test_serialized_shape() {
        let info = FailureInfo::expired("no response").with_code("TIMEOUT");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["errorMessage"], "no response");
        assert_eq!(json["failureData"][0]["failureTypes"][0], "EXPIRED");
        assert_eq!(json["failureData"][0]["code"], "TIMEOUT");
    }
}
