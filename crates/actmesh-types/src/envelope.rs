//! The envelope exchanged between peers.
//!
//! Every hop creates a fresh [`Envelope`]; the hop history in `path` is
//! copied and extended through [`Trace`], never mutated in place.

use crate::error::Failure;
use crate::pattern::Pattern;
use crate::serde_compat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of a running process in the mesh.
///
/// Generated once per process and injected into every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier of the form `<uuid>/<tag>`.
    pub fn generate(tag: &str) -> Self {
        Self(format!("{}/{}", uuid::Uuid::new_v4().simple(), tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Origin and hop history of a logical call chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    origin: InstanceId,
    path: Vec<InstanceId>,
}

impl Trace {
    /// A new call chain started by `local`.
    pub fn start(local: &InstanceId) -> Self {
        Self {
            origin: local.clone(),
            path: vec![local.clone()],
        }
    }

    pub fn new(origin: InstanceId, path: Vec<InstanceId>) -> Self {
        Self { origin, path }
    }

    /// Copy of this trace with `local` appended to the path.
    ///
    /// Re-delivery to the same instance does not append a consecutive duplicate.
    pub fn extended(&self, local: &InstanceId) -> Self {
        let mut path = self.path.clone();
        if path.last() != Some(local) {
            path.push(local.clone());
        }
        Self {
            origin: self.origin.clone(),
            path,
        }
    }

    pub fn origin(&self) -> &InstanceId {
        &self.origin
    }

    pub fn path(&self) -> &[InstanceId] {
        &self.path
    }

    pub fn has_visited(&self, instance: &InstanceId) -> bool {
        self.path.contains(instance)
    }
}

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Request,
    ResponseOk,
    ResponseError,
}

/// Classification of a response error, carried on the wire so that
/// rejections relayed through intermediate hops keep their type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    App,
    OwnMessage,
    MessageLoop,
    Decode,
    Timeout,
    Transport,
    Closed,
    /// A code this version does not know. Handled like `App`.
    #[serde(other)]
    Unknown,
}

/// Error details on a `response-error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub code: ErrorCode,
}

impl ErrorInfo {
    /// An application error: not retryable.
    pub fn app(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: ErrorCode::App,
        }
    }
}

/// The unit exchanged on the wire.
///
/// Fields not known to this version are kept in `extra` and written back
/// unchanged. `extra` must not shadow the named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub correlation_id: String,
    /// Instance that originated the call chain.
    pub instance_id: InstanceId,
    #[serde(default)]
    pub path: Vec<InstanceId>,
    #[serde(default)]
    pub pattern: Pattern,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "serde_compat::present"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a request carrying `trace` as its origin and path.
    pub fn request(
        correlation_id: impl Into<String>,
        trace: &Trace,
        pattern: Pattern,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            correlation_id: correlation_id.into(),
            instance_id: trace.origin().clone(),
            path: trace.path().to_vec(),
            pattern,
            args,
            result: None,
            error_info: None,
            extra: Map::new(),
        }
    }

    /// Build the response to this request. `trace` is the path as extended
    /// by the responding instance.
    pub fn respond(&self, trace: &Trace, outcome: Result<Value, ErrorInfo>) -> Self {
        let (kind, result, error_info) = match outcome {
            Ok(value) => (EnvelopeKind::ResponseOk, Some(value), None),
            Err(info) => (EnvelopeKind::ResponseError, None, Some(info)),
        };
        Self {
            kind,
            correlation_id: self.correlation_id.clone(),
            instance_id: trace.origin().clone(),
            path: trace.path().to_vec(),
            pattern: self.pattern.clone(),
            args: Map::new(),
            result,
            error_info,
            extra: Map::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == EnvelopeKind::Request
    }

    /// Origin and hop history carried by this envelope.
    pub fn trace(&self) -> Trace {
        Trace::new(self.instance_id.clone(), self.path.clone())
    }

    /// Convert a response into the caller-visible outcome.
    pub fn into_outcome(self) -> Result<Value, Failure> {
        match self.kind {
            EnvelopeKind::ResponseOk => Ok(self.result.unwrap_or(Value::Null)),
            EnvelopeKind::ResponseError => Err(Failure::from_error_info(
                self.error_info
                    .unwrap_or_else(|| ErrorInfo::app("response-error without errorInfo")),
            )),
            EnvelopeKind::Request => Err(Failure::Decode(crate::error::DecodeError::new(
                "expected a response envelope, got a request",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> Envelope {
        let trace = Trace::start(&InstanceId::new("a"));
        let mut args = Map::new();
        args.insert("d".to_string(), json!("A"));
        Envelope::request("corr-1", &trace, Pattern::parse("c:1").unwrap(), args)
    }

    #[test]
    fn test_request_fields() {
        let env = sample_request();
        assert!(env.is_request());
        assert_eq!(env.instance_id.as_str(), "a");
        assert_eq!(env.path, vec![InstanceId::new("a")]);
    }

    #[test]
    fn test_wire_field_names() {
        let env = sample_request();
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["kind"], "request");
        assert_eq!(v["correlationId"], "corr-1");
        assert_eq!(v["instanceId"], "a");
        assert_eq!(v["pattern"], json!({"c": 1}));
        assert!(v.get("result").is_none());
        assert!(v.get("errorInfo").is_none());
    }

    #[test]
    fn test_trace_extension_copies() {
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        let start = Trace::start(&a);
        let hop = start.extended(&b);
        assert_eq!(start.path(), &[a.clone()]);
        assert_eq!(hop.path(), &[a.clone(), b.clone()]);
        assert_eq!(hop.origin(), &a);
        assert_eq!(hop.extended(&b).path().len(), 2);
        assert!(hop.has_visited(&b));
    }

    #[test]
    fn test_respond_ok_and_error() {
        let req = sample_request();
        let trace = req.trace().extended(&InstanceId::new("b"));

        let ok = req.respond(&trace, Ok(json!({"s": "1-A"})));
        assert_eq!(ok.kind, EnvelopeKind::ResponseOk);
        assert_eq!(ok.correlation_id, "corr-1");
        assert_eq!(ok.path.len(), 2);
        assert_eq!(ok.into_outcome().unwrap(), json!({"s": "1-A"}));

        let err = req.respond(&trace, Err(ErrorInfo::app("bad-wire")));
        assert_eq!(err.kind, EnvelopeKind::ResponseError);
        match err.into_outcome() {
            Err(Failure::App { message, retryable }) => {
                assert_eq!(message, "bad-wire");
                assert!(!retryable);
            }
            other => panic!("Expected App failure, got {other:?}"),
        }
    }

    #[test]
    fn test_request_is_not_an_outcome() {
        assert!(matches!(
            sample_request().into_outcome(),
            Err(Failure::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_error_code_is_an_app_error() {
        let raw = json!({
            "kind": "response-error",
            "correlationId": "corr-1",
            "instanceId": "b",
            "errorInfo": {"message": "quota exceeded", "retryable": true, "code": "rate_limited"}
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.error_info.as_ref().unwrap().code, ErrorCode::Unknown);
        match env.into_outcome() {
            Err(Failure::App { message, retryable }) => {
                assert_eq!(message, "quota exceeded");
                assert!(retryable);
            }
            other => panic!("Expected App failure, got {other:?}"),
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = InstanceId::generate("node");
        let b = InstanceId::generate("node");
        assert_ne!(a, b);
        assert!(a.as_str().ends_with("/node"));
    }
}
