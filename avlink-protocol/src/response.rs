//! Parsed device replies and feedback

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Classification of a parsed line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Ordinary success, with or without values
    Ok,
    /// The device rejected the command
    Error,
    /// The device could not reach the addressed block or attribute
    CannotDeliver,
    /// The device failed internally while executing the command
    GeneralFailure,
}

impl ResponseKind {
    /// True for every classification other than [`ResponseKind::Ok`]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::CannotDeliver => "cannot deliver",
            Self::GeneralFailure => "general failure",
        };
        f.write_str(name)
    }
}

/// One parsed protocol line
///
/// A response either answers the command in flight or, when it carries a
/// publish token, delivers feedback for a subscription. Responses with no
/// values and an [`ResponseKind::Ok`] classification are inert
/// acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub kind: ResponseKind,
    pub values: BTreeMap<String, String>,
    pub publish_token: Option<String>,
    /// Failure text reported by the device, if any
    pub message: Option<String>,
    /// The line this response was parsed from
    pub raw: String,
}

impl Response {
    pub fn new(kind: ResponseKind) -> Self {
        Self {
            kind,
            values: BTreeMap::new(),
            publish_token: None,
            message: None,
            raw: String::new(),
        }
    }

    /// An empty success acknowledgement
    pub fn ok() -> Self {
        Self::new(ResponseKind::Ok)
    }

    /// A failure with the device's message attached
    pub fn failure(kind: ResponseKind, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(kind)
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.publish_token = Some(token.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Failure text reported by the device, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_failure(&self) -> bool {
        self.kind.is_failure()
    }

    /// True for a success that carries no values
    pub fn is_inert(&self) -> bool {
        self.kind == ResponseKind::Ok && self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ResponseKind::Ok, false)]
    #[case(ResponseKind::Error, true)]
    #[case(ResponseKind::CannotDeliver, true)]
    #[case(ResponseKind::GeneralFailure, true)]
    fn test_failure_classification(#[case] kind: ResponseKind, #[case] failure: bool) {
        assert_eq!(kind.is_failure(), failure);
        assert_eq!(Response::new(kind).is_failure(), failure);
    }

    #[test]
    fn test_inert_response() {
        assert!(Response::ok().is_inert());
        assert!(!Response::ok().with_value("value", "-12.5").is_inert());
        assert!(!Response::failure(ResponseKind::Error, "bad address").is_inert());
    }

    #[test]
    fn test_builders() {
        let response = Response::ok()
            .with_value("value", "-12.5")
            .with_token("Level1~level~1")
            .with_raw("! \"publishToken\":\"Level1~level~1\" \"value\":-12.5");

        assert_eq!(response.value("value"), Some("-12.5"));
        assert_eq!(response.value("missing"), None);
        assert_eq!(response.publish_token.as_deref(), Some("Level1~level~1"));
        assert!(response.raw.starts_with('!'));

        let failure = Response::failure(ResponseKind::CannotDeliver, "address not found");
        assert_eq!(failure.message.as_deref(), Some("address not found"));
        assert_eq!(failure.kind.to_string(), "cannot deliver");
    }
}
