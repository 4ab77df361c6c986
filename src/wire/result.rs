//! Machine-readable outcome taxonomy
//!
//! Every response carries an [`RpcResult`] next to whatever typed status
//! the message itself defines. The two layers are independent: a result
//! of `Ok` can still wrap a domain-level `Rejected` status, and callers
//! are expected to check both.

use serde::{Deserialize, Serialize};

/// Closed set of transport/protocol-level outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Message was processed and a response was produced.
    Ok,
    /// Parsed as JSON but violated the expected structure.
    FormationViolation,
    /// Signature verification failed.
    SignatureError,
    /// A filter rejected or dropped the message.
    Filtered,
    /// Catch-all failure, including request timeouts.
    GenericError,
    /// Payload was not valid JSON or the action is unknown.
    CouldNotParse,
    /// The transport could not deliver the message.
    NetworkError,
    /// An unexpected internal failure was caught and wrapped.
    InternalError,
}

impl ResultCode {
    /// Map a CallError code string back into the taxonomy.
    ///
    /// Peers speak many dialects of error code; anything we do not
    /// recognize collapses to `GenericError` and the original string
    /// survives in the error description.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "Ok" => Some(ResultCode::Ok),
            "FormationViolation" | "FormatViolation" => Some(ResultCode::FormationViolation),
            "SignatureError" | "SecurityError" => Some(ResultCode::SignatureError),
            "Filtered" => Some(ResultCode::Filtered),
            "GenericError" => Some(ResultCode::GenericError),
            "CouldNotParse" | "RpcFrameworkError" => Some(ResultCode::CouldNotParse),
            "NetworkError" => Some(ResultCode::NetworkError),
            "InternalError" => Some(ResultCode::InternalError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "Ok",
            ResultCode::FormationViolation => "FormationViolation",
            ResultCode::SignatureError => "SignatureError",
            ResultCode::Filtered => "Filtered",
            ResultCode::GenericError => "GenericError",
            ResultCode::CouldNotParse => "CouldNotParse",
            ResultCode::NetworkError => "NetworkError",
            ResultCode::InternalError => "InternalError",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome attached to every response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResult {
    pub code: ResultCode,
    /// Human-readable detail, empty for `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RpcResult {
    pub fn ok() -> Self {
        Self { code: ResultCode::Ok, detail: None }
    }

    pub fn error(code: ResultCode, detail: impl Into<String>) -> Self {
        Self { code, detail: Some(detail.into()) }
    }

    /// Timeouts surface as `GenericError`, never as a hang or a panic.
    pub fn timed_out(action: &str, timeout_secs: u64) -> Self {
        Self::error(
            ResultCode::GenericError,
            format!("no response to {action} within {timeout_secs}s"),
        )
    }

    /// Wrap a transport send failure.
    pub fn from_send_failure(detail: impl Into<String>) -> Self {
        Self::error(ResultCode::NetworkError, detail.into())
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

impl Default for RpcResult {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_has_no_detail() {
        let result = RpcResult::ok();
        assert!(result.is_ok());
        assert!(result.detail.is_none());
    }

    #[test]
    fn timeout_is_generic_error() {
        let result = RpcResult::timed_out("Reset", 30);
        assert_eq!(result.code, ResultCode::GenericError);
        assert!(result.detail.unwrap().contains("Reset"));
    }

    #[test]
    fn code_serializes_as_bare_name() {
        let json = serde_json::to_string(&ResultCode::FormationViolation).unwrap();
        assert_eq!(json, "\"FormationViolation\"");
    }
}
