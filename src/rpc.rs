//! The request/response/notification envelope and method dispatch shared by
//! every inter-context call path in the system.
//!
//! Isolate calls, native-function bridges, and JSON-RPC transports all use
//! the same lookup-and-invoke logic defined here; transports differ only in
//! how the envelope is serialized on the wire. The wire shape follows the
//! JSON-RPC field names exactly (`jsonrpc`, `method`, `params`, `id`,
//! `result`, `error{code, message, data}`).

use crate::fifo::Fifo;
use crate::panic_message;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::SyncSender;

pub use serde_json::Value;

/// Canonical error codes, reused verbatim across all RPC-style bridges.
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const PARSE_ERROR: i32 = -32700;

/// Content type transports should advertise for serialized envelopes.
pub const CONTENT_TYPE: &str = "application/json-rpc";

/// A request id: correlated responses echo it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Number(u64),
    Text(String),
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        CallId::Number(id)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        CallId::Text(id.to_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,
}

impl Request {
    /// A correlated request expecting a response.
    pub fn call(id: impl Into<CallId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: None,
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// A fire-and-forget notification.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: None,
            method: method.into(),
            params,
            id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {}", method),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: PARSE_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: Option<CallId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn result(id: Option<CallId>, result: Value) -> Self {
        Self {
            jsonrpc: None,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<CallId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: None,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the response into its success or error side.
    ///
    /// A successful result is always explicitly present — `Some(Null)` is a
    /// legitimate value, distinct from absence. A response carrying neither
    /// side is malformed and reported as an internal error.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        if let Some(error) = self.error {
            return Err(error);
        }
        match self.result {
            Some(value) => Ok(value),
            None => Err(ErrorObject::internal(
                "response carried neither result nor error",
            )),
        }
    }
}

/// Error a handler reports without panicking; converted into the response's
/// error object by the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

impl From<HandlerError> for ErrorObject {
    fn from(err: HandlerError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// A bound method: receives the method name (meaningful for the wildcard
/// slot) and the request params.
pub type Handler = Box<dyn FnMut(&str, &Value) -> Result<Value, HandlerError>>;

/// The method-name-to-handler mapping consulted by every dispatch path.
///
/// Lookup order: exact method name, then the wildcard slot. A miss on both
/// produces a method-not-found response. Handler panics are caught at this
/// boundary and converted to internal-error responses — a raw panic never
/// crosses an isolate or transport boundary.
#[derive(Default)]
pub struct DispatchTable {
    methods: AHashMap<String, Handler>,
    wildcard: Option<Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            methods: AHashMap::new(),
            wildcard: None,
        }
    }

    /// Registers or replaces the handler for `method`.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: impl FnMut(&str, &Value) -> Result<Value, HandlerError> + 'static,
    ) {
        self.methods.insert(method.into(), Box::new(handler));
    }

    /// Registers or replaces the wildcard handler consulted when no named
    /// handler matches.
    pub fn register_wildcard(
        &mut self,
        handler: impl FnMut(&str, &Value) -> Result<Value, HandlerError> + 'static,
    ) {
        self.wildcard = Some(Box::new(handler));
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Looks up and invokes the handler for `request`, producing a
    /// correlated response.
    pub fn dispatch(&mut self, request: &Request) -> Response {
        let id = request.id.clone();
        let Self { methods, wildcard } = self;

        let handler = methods
            .get_mut(&request.method)
            .or(wildcard.as_mut());

        let handler = match handler {
            Some(handler) => handler,
            None => return Response::error(id, ErrorObject::method_not_found(&request.method)),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler(&request.method, &request.params)
        }));
        match outcome {
            Ok(Ok(value)) => Response::result(id, value),
            Ok(Err(err)) => Response::error(id, err.into()),
            Err(payload) => {
                let message = panic_message(payload.as_ref()).to_owned();
                log::error!("handler for '{}' panicked: {}", request.method, message);
                Response::error(id, ErrorObject::internal(message))
            }
        }
    }

    /// Dispatches a notification: same lookup and fault isolation as
    /// `dispatch`, but the outcome is dropped. An unknown method is
    /// silently ignored.
    pub fn dispatch_notification(&mut self, request: &Request) {
        if self.methods.contains_key(&request.method) || self.wildcard.is_some() {
            let _ = self.dispatch(request);
        } else {
            log::trace!("dropped notification for unknown method '{}'", request.method);
        }
    }
}

/// Deserializes a request from raw transport bytes, mapping malformed
/// input to a ready-to-send parse-error response.
pub fn parse_request(bytes: &[u8]) -> Result<Request, Response> {
    serde_json::from_slice(bytes)
        .map_err(|err| Response::error(None, ErrorObject::parse_error(err.to_string())))
}

/// In-flight request correlation for order-preserving transports (REQ/REP
/// style): responses must arrive in the order the requests were sent.
///
/// Each tracked call holds the reply channel its response should be
/// delivered to. A response whose id does not match the head of the queue
/// is a protocol violation; it is dropped and counted, never delivered to
/// the wrong caller.
pub struct ClientQueue {
    pending: Fifo<PendingCall>,
    dropped: u64,
}

struct PendingCall {
    id: CallId,
    reply: SyncSender<Response>,
}

impl Default for ClientQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientQueue {
    pub fn new() -> Self {
        Self {
            pending: Fifo::new(),
            dropped: 0,
        }
    }

    /// Records an in-flight request awaiting its response.
    pub fn track(&mut self, id: impl Into<CallId>, reply: SyncSender<Response>) {
        self.pending.push(PendingCall {
            id: id.into(),
            reply,
        });
    }

    /// Delivers `response` to the oldest in-flight call if the ids match.
    ///
    /// Returns whether the response was delivered. A caller that timed out
    /// and dropped its receiver counts as delivered — the call completed,
    /// the reply just had nowhere to go.
    pub fn complete(&mut self, response: Response) -> bool {
        let head_id = match self.pending.front() {
            Some(call) => call.id.clone(),
            None => {
                self.dropped += 1;
                log::warn!("response with no in-flight call, dropping");
                return false;
            }
        };

        if response.id.as_ref() != Some(&head_id) {
            self.dropped += 1;
            log::warn!(
                "out-of-order response (expected id {:?}, got {:?}), dropping",
                head_id,
                response.id
            );
            return false;
        }

        let call = self.pending.pop().expect("front() guaranteed a head");
        call.reply.try_send(response).ok();
        true
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_dispatch_known_method() {
        let mut table = DispatchTable::new();
        table.register("ping", |_, _| Ok(Value::from("pong")));

        let request = Request::call(1, "ping", Value::Null);
        let response = table.dispatch(&request);

        assert_eq!(response.id, Some(CallId::Number(1)));
        assert_eq!(response.into_result().unwrap(), Value::from("pong"));
    }

    #[test]
    fn test_dispatch_unknown_method() {
        let mut table = DispatchTable::new();
        let request = Request::call(2, "missing", Value::Null);
        let response = table.dispatch(&request);

        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_wildcard_catches_unknown_methods() {
        let mut table = DispatchTable::new();
        table.register("known", |_, _| Ok(Value::from(1)));
        table.register_wildcard(|method, _| Ok(Value::from(format!("caught {}", method))));

        let response = table.dispatch(&Request::call(3, "anything", Value::Null));
        assert_eq!(
            response.into_result().unwrap(),
            Value::from("caught anything")
        );

        // Named handlers still win over the wildcard
        let response = table.dispatch(&Request::call(4, "known", Value::Null));
        assert_eq!(response.into_result().unwrap(), Value::from(1));
    }

    #[test]
    fn test_handler_error_becomes_error_response() {
        let mut table = DispatchTable::new();
        table.register("strict", |_, _| {
            Err(HandlerError::invalid_params("expected an array"))
        });

        let err = table
            .dispatch(&Request::call(5, "strict", Value::Null))
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.message, "expected an array");
    }

    #[test]
    fn test_handler_panic_becomes_internal_error() {
        let mut table = DispatchTable::new();
        table.register("explode", |_, _| panic!("handler blew up"));

        let err = table
            .dispatch(&Request::call(6, "explode", Value::Null))
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.message.contains("handler blew up"));
    }

    #[test]
    fn test_table_survives_handler_panic() {
        let mut table = DispatchTable::new();
        table.register("explode", |_, _| panic!("boom"));
        table.register("ok", |_, _| Ok(Value::from(true)));

        let _ = table.dispatch(&Request::call(7, "explode", Value::Null));
        let response = table.dispatch(&Request::call(8, "ok", Value::Null));
        assert_eq!(response.into_result().unwrap(), Value::from(true));
    }

    #[test]
    fn test_null_result_is_a_real_result() {
        let mut table = DispatchTable::new();
        table.register("nothing", |_, _| Ok(Value::Null));

        let response = table.dispatch(&Request::call(9, "nothing", Value::Null));
        // An explicitly-null result must not be misread as "no result"
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_notification_for_unknown_method_is_silent() {
        let mut table = DispatchTable::new();
        // Must not panic, must not require a wildcard
        table.dispatch_notification(&Request::notification("nobody-home", Value::Null));
    }

    #[test]
    fn test_wire_format_field_names() {
        let request = Request::call(42, "add", json!([1, 2]));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire, json!({"method": "add", "params": [1, 2], "id": 42}));

        let response = Response::error(
            Some(CallId::Text("abc".into())),
            ErrorObject::internal("oops"),
        );
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(
            wire,
            json!({"id": "abc", "error": {"code": -32603, "message": "oops"}})
        );
    }

    #[test]
    fn test_request_roundtrip_with_jsonrpc_tag() {
        let raw = br#"{"jsonrpc": "2.0", "method": "sum", "params": {"a": 1}, "id": "x1"}"#;
        let request = parse_request(raw).unwrap();
        assert_eq!(request.jsonrpc.as_deref(), Some("2.0"));
        assert_eq!(request.method, "sum");
        assert_eq!(request.id, Some(CallId::Text("x1".into())));
    }

    #[test]
    fn test_parse_error_response() {
        let response = parse_request(b"{not json").unwrap_err();
        let err = response.error.unwrap();
        assert_eq!(err.code, PARSE_ERROR);
    }

    #[test]
    fn test_params_default_to_null() {
        let request = parse_request(br#"{"method": "bare"}"#).unwrap();
        assert_eq!(request.params, Value::Null);
        assert_eq!(request.id, None);
    }

    #[test]
    fn test_client_queue_ordered_completion() {
        let mut queue = ClientQueue::new();
        let (tx1, rx1) = sync_channel(1);
        let (tx2, rx2) = sync_channel(1);

        queue.track(1u64, tx1);
        queue.track(2u64, tx2);
        assert_eq!(queue.in_flight(), 2);

        assert!(queue.complete(Response::result(Some(1u64.into()), Value::from("a"))));
        assert!(queue.complete(Response::result(Some(2u64.into()), Value::from("b"))));

        assert_eq!(rx1.recv().unwrap().into_result().unwrap(), Value::from("a"));
        assert_eq!(rx2.recv().unwrap().into_result().unwrap(), Value::from("b"));
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_client_queue_rejects_mismatched_response() {
        let mut queue = ClientQueue::new();
        let (tx, rx) = sync_channel(1);
        queue.track(1u64, tx);

        assert!(!queue.complete(Response::result(Some(9u64.into()), Value::Null)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.in_flight(), 1);
        assert!(rx.try_recv().is_err());

        // The matching response still gets through afterwards
        assert!(queue.complete(Response::result(Some(1u64.into()), Value::Null)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_client_queue_response_with_nobody_waiting() {
        let mut queue = ClientQueue::new();
        assert!(!queue.complete(Response::result(Some(1u64.into()), Value::Null)));
        assert_eq!(queue.dropped(), 1);
    }
}
