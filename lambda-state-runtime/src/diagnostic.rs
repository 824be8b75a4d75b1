use serde::{Deserialize, Serialize};

/// Error report posted to the control plane.
///
/// Serializes to the canonical `{"errorType":…,"errorMessage":…}` object.
/// Field order follows declaration order, so the encoded form is stable and
/// its length can be computed for `content-length` without another pass.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// The type of error reported to the control plane.
    pub error_type: String,
    /// Human-readable description of the error.
    pub error_message: String,
}

impl ErrorEnvelope {
    /// `errorType` reported for every handler-originated failure.
    pub const UNHANDLED: &'static str = "Unhandled Error";

    /// Envelope for a handler failure. The message is the error's
    /// human-readable description; callers of the function see it verbatim.
    pub fn unhandled(message: impl Into<String>) -> Self {
        ErrorEnvelope {
            error_type: Self::UNHANDLED.into(),
            error_message: message.into(),
        }
    }

    /// Envelope with empty fields, synthesized for control-plane rejections
    /// that carry no diagnostic of their own.
    pub(crate) fn empty() -> Self {
        ErrorEnvelope {
            error_type: String::new(),
            error_message: String::new(),
        }
    }
}
