// Copyright 2020 Joyent, Inc.

//! The protocol state machine.
//!
//! An `Engine` owns the service registry, the pending call table and the
//! retry timers for one endpoint on the channel.  It is driven from a single
//! task: inbound text goes to `handle_inbound`, outbound calls to `call`, and
//! whatever `next_event` yields (an expired timer or the late answer of an
//! asynchronous procedure) to `process`.  Nothing inside the engine runs in
//! parallel, so none of its tables are locked.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use slog::{debug, o, trace, warn, Drain, Logger};
use tokio::sync::mpsc;

use crate::acl::OriginPattern;
use crate::binder;
use crate::codec::{
    self, Envelope, MessageId, Outcome, Params, Request, Response, RpcError, JSONRPC_VERSION,
};
use crate::config::{validate_retries, validate_timeout, RpcConfig};
use crate::error::{CallError, ConfigError};
use crate::pending::{
    CallId, CallStatus, CompleteFn, Continuation, ErrorFn, PendingCall, PendingCalls, SuccessFn,
};
use crate::registry::{HandlerResult, Procedure, Registration, Responder, ServiceRegistry};
use crate::scheduler::RetryScheduler;
use crate::transport::{Inbound, Transport};

/// Everything needed to place one outbound call.  Options left unset fall
/// back to the engine's `RpcConfig`.  A call with no continuation at all is
/// sent as a notification.
pub struct CallConfig<H> {
    pub destination: H,
    pub procedure: String,
    pub params: Params,
    pub on_success: Option<SuccessFn>,
    pub on_error: Option<ErrorFn>,
    pub on_complete: Option<CompleteFn>,
    pub retries: Option<i32>,
    pub timeout: Option<Duration>,
    pub destination_origin: Option<String>,
}

/// Call options after defaults are applied and validated.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub destination_origin: OriginPattern,
}

impl<H> CallConfig<H> {
    pub fn new(destination: H, procedure: &str) -> CallConfig<H> {
        CallConfig {
            destination,
            procedure: String::from(procedure),
            params: Params::default(),
            on_success: None,
            on_error: None,
            on_complete: None,
            retries: None,
            timeout: None,
            destination_origin: None,
        }
    }

    pub fn params<P: Into<Params>>(mut self, params: P) -> CallConfig<H> {
        self.params = params.into();
        self
    }

    pub fn on_success<F>(mut self, f: F) -> CallConfig<H>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> CallConfig<H>
    where
        F: FnOnce(CallError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// A single continuation receiving either outcome.  Takes precedence
    /// over `on_success` and `on_error`.
    pub fn on_complete<F>(mut self, f: F) -> CallConfig<H>
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn retries(mut self, retries: i32) -> CallConfig<H> {
        self.retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> CallConfig<H> {
        self.timeout = Some(timeout);
        self
    }

    pub fn destination_origin(mut self, pattern: &str) -> CallConfig<H> {
        self.destination_origin = Some(String::from(pattern));
        self
    }

    /// Drop every continuation, turning the call into a notification.
    pub fn notification(mut self) -> CallConfig<H> {
        self.on_success = None;
        self.on_error = None;
        self.on_complete = None;
        self
    }

    pub fn is_notification(&self) -> bool {
        self.on_success.is_none() && self.on_error.is_none() && self.on_complete.is_none()
    }

    pub fn options(&self, defaults: &RpcConfig) -> Result<CallOptions, ConfigError> {
        let retries = validate_retries(self.retries.unwrap_or(defaults.retries))?;
        let timeout = validate_timeout(self.timeout.unwrap_or_else(|| defaults.timeout()))?;
        let pattern = self
            .destination_origin
            .as_deref()
            .unwrap_or_else(|| defaults.destination_origin.as_str());

        Ok(CallOptions {
            retries,
            timeout,
            destination_origin: OriginPattern::new(pattern)?,
        })
    }

    fn take_continuation(&mut self) -> Option<Continuation> {
        if let Some(on_complete) = self.on_complete.take() {
            return Some(Continuation::joined(on_complete));
        }

        match (self.on_success.take(), self.on_error.take()) {
            (None, None) => None,
            (on_success, on_error) => {
                let on_success: SuccessFn = match on_success {
                    Some(f) => f,
                    None => Box::new(|_: Value| ()),
                };
                let on_error: ErrorFn = match on_error {
                    Some(f) => f,
                    None => Box::new(|_: CallError| ()),
                };
                Some(Continuation::new(on_success, on_error))
            }
        }
    }
}

impl<H: fmt::Debug> fmt::Debug for CallConfig<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CallConfig")
            .field("destination", &self.destination)
            .field("procedure", &self.procedure)
            .field("params", &self.params)
            .field("notification", &self.is_notification())
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("destination_origin", &self.destination_origin)
            .finish()
    }
}

/// The late result of an asynchronous procedure, on its way back to the
/// engine that invoked it.
#[derive(Debug)]
pub struct AsyncReply<H> {
    pub id: MessageId,
    pub destination: H,
    pub origin: String,
    pub result: HandlerResult,
}

#[derive(Debug)]
pub enum EngineEvent<H> {
    Expired(CallId),
    Reply(AsyncReply<H>),
}

pub struct Engine<T: Transport> {
    transport: T,
    registry: ServiceRegistry,
    pending: PendingCalls<T::Handle>,
    scheduler: RetryScheduler,
    config: RpcConfig,
    replies_tx: mpsc::UnboundedSender<AsyncReply<T::Handle>>,
    replies_rx: mpsc::UnboundedReceiver<AsyncReply<T::Handle>>,
    log: Logger,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, config: RpcConfig, log: Option<&Logger>) -> Engine<T> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        Engine {
            transport,
            registry: ServiceRegistry::new(),
            pending: PendingCalls::new(),
            scheduler: RetryScheduler::new(),
            config,
            replies_tx,
            replies_rx,
            log,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn armed_timers(&self) -> usize {
        self.scheduler.len()
    }

    pub fn is_pending(&self, id: &CallId) -> bool {
        self.pending.contains(id)
    }

    pub fn register(&mut self, name: &str, registration: Registration) -> Option<Registration> {
        debug!(self.log, "registering procedure"; "method" => name,
            "async" => registration.procedure.is_async());
        self.registry.register(name, registration)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Registration> {
        debug!(self.log, "unregistering procedure"; "method" => name);
        self.registry.unregister(name)
    }

    /// Place an outbound call.  Returns the call identifier, or `None` for a
    /// notification.  Invalid options are reported before anything is sent.
    pub fn call(&mut self, mut config: CallConfig<T::Handle>) -> Result<Option<CallId>, ConfigError> {
        let options = config.options(&self.config)?;

        let continuation = match config.take_continuation() {
            Some(continuation) => continuation,
            None => {
                let req = Request::new(&config.procedure, config.params, None);
                let text = codec::encode(&Envelope::Request(req));
                debug!(self.log, "sending notification"; "method" => &config.procedure);
                self.send(&config.destination, &text, options.destination_origin.as_str());
                return Ok(None);
            }
        };

        let id = CallId::new();
        let req = Request::new(&config.procedure, config.params, Some(MessageId::from(id)));
        self.pending.insert(PendingCall {
            id,
            procedure: config.procedure,
            destination: config.destination,
            destination_origin: options.destination_origin,
            request: codec::encode(&Envelope::Request(req)),
            continuation,
            retries_left: options.retries,
            attempts: 0,
            timeout: options.timeout,
            status: CallStatus::NotSent,
            timer: None,
        });
        self.transmit(&id);

        Ok(Some(id))
    }

    pub fn handle_inbound(&mut self, msg: Inbound<T::Handle>) {
        let envelope = match codec::decode(&msg.text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                trace!(self.log, "ignoring unframed message"; "origin" => &msg.origin);
                return;
            }
            Err(e) => {
                warn!(self.log, "dropping malformed message";
                    "origin" => &msg.origin, "err" => %e);
                return;
            }
        };

        match envelope {
            Envelope::Request(req) => self.handle_request(req, &msg.origin, &msg.source),
            Envelope::Response(resp) => self.handle_response(resp, &msg.origin),
        }
    }

    fn handle_request(&mut self, req: Request, origin: &str, source: &T::Handle) {
        let id = req.id;

        if req.jsonrpc != JSONRPC_VERSION {
            debug!(self.log, "rejecting request with unsupported version";
                "version" => &req.jsonrpc, "origin" => origin);
            self.reject(id, source, origin, RpcError::invalid_request());
            return;
        }

        let registration = match self.registry.lookup(&req.method) {
            Some(registration) => registration,
            None => {
                debug!(self.log, "no such procedure"; "method" => &req.method, "origin" => origin);
                self.reject(id, source, origin, RpcError::method_not_found(&req.method));
                return;
            }
        };

        if !registration.policy.authorize(origin) {
            warn!(self.log, "access denied"; "method" => &req.method, "origin" => origin);
            self.reject(id, source, origin, RpcError::access_denied());
            return;
        }

        let args = match binder::bind(&registration.param_names, req.params) {
            Ok(args) => args,
            Err(e) => {
                debug!(self.log, "failed to bind parameters";
                    "method" => &req.method, "err" => %e);
                self.reject(id, source, origin, RpcError::invalid_params(e.to_string()));
                return;
            }
        };

        trace!(self.log, "invoking procedure"; "method" => &req.method, "origin" => origin,
            "notification" => id.is_none());

        match (&registration.procedure, id) {
            (Procedure::Sync(procedure), None) => {
                if let Err(e) = procedure(args) {
                    debug!(self.log, "notification failed";
                        "method" => &req.method, "err" => %e);
                }
            }
            (Procedure::Sync(procedure), Some(id)) => {
                let resp = handler_response(id, procedure(args));
                self.reply(source, origin, resp);
            }
            (Procedure::Async(procedure), None) => procedure(args, Responder::new(|_| ())),
            (Procedure::Async(procedure), Some(id)) => {
                let replies = self.replies_tx.clone();
                let destination = source.clone();
                let origin = String::from(origin);
                let responder = Responder::new(move |result| {
                    // The engine owns the receiver; a failed send means it
                    // has already shut down.
                    let _ = replies.send(AsyncReply {
                        id,
                        destination,
                        origin,
                        result,
                    });
                });
                procedure(args, responder);
            }
        }
    }

    fn handle_response(&mut self, resp: Response, origin: &str) {
        // Identifiers we did not generate can never name a pending call.
        let id = match resp.id.as_ref().and_then(MessageId::call_id) {
            Some(id) => id,
            None => {
                debug!(self.log, "dropping response without a call id of ours";
                    "id" => ?resp.id, "origin" => origin);
                return;
            }
        };

        match self.pending.get_mut(&id) {
            None => {
                debug!(self.log, "dropping response for unknown call";
                    "id" => %id, "origin" => origin);
                return;
            }
            Some(call) if !call.destination_origin.matches(origin) => {
                warn!(self.log, "dropping response from unexpected origin";
                    "id" => %id, "origin" => origin,
                    "expected" => call.destination_origin.as_str());
                return;
            }
            Some(_) => (),
        }

        if let Some(call) = self.pending.resolve(&id) {
            if let Some(key) = &call.timer {
                self.scheduler.cancel(key);
            }
            debug!(self.log, "call resolved"; "id" => %id, "method" => &call.procedure,
                "attempts" => call.attempts);

            match resp.outcome {
                Outcome::Success(result) => call.continuation.succeed(result),
                Outcome::Failure(err) => call.continuation.fail(CallError::Remote(err)),
            }
        }
    }

    /// Act on an expired retry timer: resend the request, or fail the call
    /// once its retries are spent.
    pub fn handle_timeout(&mut self, id: CallId) {
        let exhausted = match self.pending.get_mut(&id) {
            Some(call) => {
                // The queue has already given this key back.
                call.timer = None;
                call.retries_left == 0
            }
            None => {
                trace!(self.log, "timer fired for settled call"; "id" => %id);
                return;
            }
        };

        if exhausted {
            if let Some(call) = self.pending.resolve(&id) {
                warn!(self.log, "call timed out"; "id" => %id, "method" => &call.procedure,
                    "attempts" => call.attempts);
                let attempts = call.attempts;
                call.continuation.fail(CallError::Timeout { attempts });
            }
            return;
        }

        if let Some(call) = self.pending.get_mut(&id) {
            call.retries_left -= 1;
            debug!(self.log, "retrying call"; "id" => %id, "method" => &call.procedure,
                "retries_left" => call.retries_left);
        }
        self.transmit(&id);
    }

    /// Send the deferred response of an asynchronous procedure.
    pub fn complete_async(&mut self, reply: AsyncReply<T::Handle>) {
        let resp = handler_response(reply.id, reply.result);
        self.reply(&reply.destination, &reply.origin, resp);
    }

    /// Wait for the next timer expiry or asynchronous reply.  Returns `None`
    /// only if neither can ever arrive.
    pub async fn next_event(&mut self) -> Option<EngineEvent<T::Handle>> {
        let has_timers = !self.scheduler.is_empty();

        tokio::select! {
            Some(id) = self.scheduler.next_expired(), if has_timers => {
                Some(EngineEvent::Expired(id))
            }
            Some(reply) = self.replies_rx.recv() => Some(EngineEvent::Reply(reply)),
            else => None,
        }
    }

    pub fn process(&mut self, event: EngineEvent<T::Handle>) {
        match event {
            EngineEvent::Expired(id) => self.handle_timeout(id),
            EngineEvent::Reply(reply) => self.complete_async(reply),
        }
    }

    /// Release every timer and fail every pending call.  Calling this more
    /// than once is harmless.
    pub fn shutdown(&mut self) {
        self.scheduler.clear();

        let calls = self.pending.drain();
        if !calls.is_empty() {
            debug!(self.log, "failing pending calls on shutdown"; "count" => calls.len());
        }
        for call in calls {
            call.continuation.fail(CallError::Shutdown);
        }
    }

    fn transmit(&mut self, id: &CallId) {
        let call = match self.pending.get_mut(id) {
            Some(call) => call,
            None => return,
        };

        call.attempts += 1;
        trace!(self.log, "sending request"; "id" => %id, "method" => &call.procedure,
            "attempt" => call.attempts);
        if let Err(e) = self.transport.send(
            &call.destination,
            &call.request,
            call.destination_origin.as_str(),
        ) {
            // Treated as a lost message; the retry timer covers it.
            warn!(self.log, "failed to send request"; "id" => %id, "err" => %e);
        }
        call.status = CallStatus::Sent;
        call.timer = Some(self.scheduler.arm(*id, call.timeout));
    }

    fn reject(&self, id: Option<MessageId>, destination: &T::Handle, origin: &str, err: RpcError) {
        if let Some(id) = id {
            self.reply(destination, origin, Response::failure(Some(id), err));
        }
    }

    fn reply(&self, destination: &T::Handle, origin: &str, resp: Response) {
        let text = codec::encode(&Envelope::Response(resp));
        self.send(destination, &text, origin);
    }

    fn send(&self, destination: &T::Handle, text: &str, origin_constraint: &str) {
        if let Err(e) = self.transport.send(destination, text, origin_constraint) {
            warn!(self.log, "failed to send message";
                "destination" => ?destination, "err" => %e);
        }
    }
}

impl<T: Transport> Drop for Engine<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handler_response(id: MessageId, result: HandlerResult) -> Response {
    match result {
        Ok(value) => Response::success(Some(id), value),
        Err(e) => Response::failure(Some(id), RpcError::remote_fault(&e.message, e.data)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io;
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::time::Instant;

    use crate::acl::AccessPolicy;
    use crate::error::ErrorKind;
    use crate::scheduler::MAX_TIMEOUT;
    use crate::registry::HandlerError;

    type Sent = Arc<Mutex<Vec<(u32, String, String)>>>;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Sent,
    }

    impl Recorder {
        fn take(&self) -> Vec<(u32, String, String)> {
            self.sent.lock().unwrap().drain(..).collect()
        }
    }

    impl Transport for Recorder {
        type Handle = u32;

        fn send(&self, destination: &u32, text: &str, origin_constraint: &str) -> io::Result<()> {
            self.sent.lock().unwrap().push((
                *destination,
                String::from(text),
                String::from(origin_constraint),
            ));
            Ok(())
        }
    }

    type Outcomes = Arc<Mutex<Vec<Result<Value, CallError>>>>;

    fn engine() -> (Engine<Recorder>, Recorder) {
        let recorder = Recorder::default();
        (Engine::new(recorder.clone(), RpcConfig::default(), None), recorder)
    }

    fn collecting(outcomes: &Outcomes) -> impl FnOnce(Result<Value, CallError>) + Send + 'static {
        let outcomes = Arc::clone(outcomes);
        move |r: Result<Value, CallError>| outcomes.lock().unwrap().push(r)
    }

    fn request(method: &str, params: Value, id: Option<CallId>) -> String {
        let params = match params {
            Value::Array(list) => Params::Positional(list),
            Value::Object(map) => Params::Named(map),
            _ => panic!("params must be an array or object"),
        };
        codec::encode(&Envelope::Request(Request::new(method, params, id.map(MessageId::from))))
    }

    fn response_of(text: &str) -> Response {
        match codec::decode(text) {
            Ok(Some(Envelope::Response(resp))) => resp,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    fn request_of(text: &str) -> Request {
        match codec::decode(text) {
            Ok(Some(Envelope::Request(req))) => req,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    fn inbound(text: String, origin: &str) -> Inbound<u32> {
        Inbound::new(text, origin, 9)
    }

    #[tokio::test]
    async fn request_is_answered_with_result() {
        let (mut engine, recorder) = engine();
        engine.register(
            "add",
            Registration::new(|args| {
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            }),
        );

        let id = CallId::new();
        engine.handle_inbound(inbound(request("add", json!([1, 2, 3]), Some(id)), "a.example.com"));

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        let (dest, text, origin) = &sent[0];
        assert_eq!(*dest, 9);
        assert_eq!(origin, "a.example.com");
        let resp = response_of(text);
        assert_eq!(resp.id, Some(MessageId::from(id)));
        assert_eq!(resp.outcome, Outcome::Success(json!(6)));
    }

    #[tokio::test]
    async fn named_params_are_bound_by_declared_names() {
        let (mut engine, recorder) = engine();
        engine.register(
            "sub",
            Registration::new(|args| {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Ok(json!(a - b))
            })
            .params(vec!["a", "b"]),
        );

        let id = CallId::new();
        engine.handle_inbound(inbound(request("sub", json!({"b": 2, "a": 10}), Some(id)), "x"));
        let resp = response_of(&recorder.take()[0].1);
        assert_eq!(resp.outcome, Outcome::Success(json!(8)));

        engine.handle_inbound(inbound(request("sub", json!({"c": 1}), Some(id)), "x"));
        match response_of(&recorder.take()[0].1).outcome {
            Outcome::Failure(err) => assert_eq!(err.code, codec::INVALID_PARAMS),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_method_and_denied_origin() {
        let (mut engine, recorder) = engine();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let policy = AccessPolicy::new(vec!["*.example.com"], vec!["bad.example.com"]).unwrap();
        engine.register(
            "guarded",
            Registration::new(move |_| {
                *h.lock().unwrap() += 1;
                Ok(Value::Null)
            })
            .policy(policy),
        );

        let id = CallId::new();
        engine.handle_inbound(inbound(request("missing", json!([]), Some(id)), "a.example.com"));
        engine.handle_inbound(inbound(request("guarded", json!([]), Some(id)), "bad.example.com"));
        engine.handle_inbound(inbound(request("guarded", json!([]), Some(id)), "example.org"));

        let codes: Vec<i64> = recorder
            .take()
            .iter()
            .map(|(_, text, _)| match response_of(text).outcome {
                Outcome::Failure(err) => err.code,
                Outcome::Success(_) => 0,
            })
            .collect();
        assert_eq!(
            codes,
            vec![codec::METHOD_NOT_FOUND, codec::ACCESS_DENIED, codec::ACCESS_DENIED]
        );
        assert_eq!(*hits.lock().unwrap(), 0);

        // Notifications are dropped without a word.
        engine.handle_inbound(inbound(request("missing", json!([]), None), "a.example.com"));
        engine.handle_inbound(inbound(request("guarded", json!([]), None), "bad.example.com"));
        assert!(recorder.take().is_empty());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn handler_failure_becomes_remote_fault() {
        let (mut engine, recorder) = engine();
        engine.register(
            "fail",
            Registration::new(|_| Err(HandlerError::with_data("boom", json!({"why": "testing"})))),
        );

        let id = CallId::new();
        engine.handle_inbound(inbound(request("fail", json!([]), Some(id)), "x"));
        match response_of(&recorder.take()[0].1).outcome {
            Outcome::Failure(err) => {
                assert_eq!(err.code, codec::REMOTE_FAULT);
                assert_eq!(err.data, Some(json!({"why": "testing"})));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        engine.handle_inbound(inbound(request("fail", json!([]), None), "x"));
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn wrong_version_is_an_invalid_request() {
        let (mut engine, recorder) = engine();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        engine.register(
            "echo",
            Registration::new(move |args| {
                *h.lock().unwrap() += 1;
                Ok(Value::Array(args))
            }),
        );

        let texts = vec![
            r#"relayrpc.{"jsonrpc":"1.0","method":"echo","params":[],"id":"v1"}"#,
            r#"relayrpc.{"method":"echo","params":[],"id":"v1"}"#,
            r#"relayrpc.{"jsonrpc":2.0,"method":"echo","params":[],"id":"v1"}"#,
        ];
        for text in texts {
            engine.handle_inbound(inbound(String::from(text), "x"));
            let sent = recorder.take();
            assert_eq!(sent.len(), 1, "no answer to {}", text);
            let resp = response_of(&sent[0].1);
            assert_eq!(resp.id, Some(MessageId::from("v1")));
            match resp.outcome {
                Outcome::Failure(err) => assert_eq!(err.code, codec::INVALID_REQUEST),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        // Without an id there is nobody to tell.
        engine.handle_inbound(inbound(String::from(r#"relayrpc.{"method":"echo"}"#), "x"));
        assert!(recorder.take().is_empty());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn peer_chosen_ids_are_echoed() {
        let (mut engine, recorder) = engine();
        engine.register("echo", Registration::new(|args| Ok(Value::Array(args))));

        let text = r#"relayrpc.{"jsonrpc":"2.0","method":"echo","params":[1],"id":"req-1"}"#;
        engine.handle_inbound(inbound(String::from(text), "x"));

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, r#"relayrpc.{"jsonrpc":"2.0","id":"req-1","result":[1]}"#);

        engine.handle_inbound(inbound(
            String::from(r#"relayrpc.{"jsonrpc":"2.0","method":"nope","id":"req-2"}"#),
            "x",
        ));
        let resp = response_of(&recorder.take()[0].1);
        assert_eq!(resp.id, Some(MessageId::from("req-2")));
    }

    #[tokio::test]
    async fn responses_with_foreign_ids_are_dropped() {
        let (mut engine, _recorder) = engine();
        let outcomes: Outcomes = Arc::default();
        let id = engine
            .call(CallConfig::new(3, "echo").on_complete(collecting(&outcomes)))
            .unwrap()
            .unwrap();

        let reply = Response::success(Some(MessageId::from("req-1")), json!(1));
        engine.handle_inbound(inbound(codec::encode(&Envelope::Response(reply)), "peer"));
        assert!(engine.is_pending(&id));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_and_malformed_traffic_is_ignored() {
        let (mut engine, recorder) = engine();
        engine.handle_inbound(inbound(String::from("some other protocol"), "x"));
        engine.handle_inbound(inbound(String::from("relayrpc.{broken"), "x"));
        engine.handle_inbound(inbound(String::from("relayrpc.[]"), "x"));
        assert!(recorder.take().is_empty());
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn response_resolves_call_once() {
        let (mut engine, recorder) = engine();
        let outcomes: Outcomes = Arc::default();

        let id = engine
            .call(
                CallConfig::new(3, "echo")
                    .params(vec![json!("hi")])
                    .on_complete(collecting(&outcomes)),
            )
            .unwrap()
            .expect("correlated call has an id");
        assert!(engine.is_pending(&id));
        assert_eq!(engine.armed_timers(), 1);

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].2, "*");
        let req = request_of(&sent[0].1);
        assert_eq!(req.id, Some(MessageId::from(id)));
        assert_eq!(req.method, "echo");

        let reply = codec::encode(&Envelope::Response(Response::success(Some(MessageId::from(id)), json!("hi"))));
        engine.handle_inbound(inbound(reply.clone(), "peer"));
        engine.handle_inbound(inbound(reply, "peer"));

        assert_eq!(*outcomes.lock().unwrap(), vec![Ok(json!("hi"))]);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.armed_timers(), 0);
    }

    #[tokio::test]
    async fn error_response_reaches_error_continuation() {
        let (mut engine, recorder) = engine();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);

        let id = engine
            .call(
                CallConfig::new(3, "nope")
                    .on_error(move |err: CallError| e.lock().unwrap().push(err.kind())),
            )
            .unwrap()
            .unwrap();
        recorder.take();

        let reply = Response::failure(Some(MessageId::from(id)), RpcError::method_not_found("nope"));
        engine.handle_inbound(inbound(codec::encode(&Envelope::Response(reply)), "peer"));
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::MethodNotFound]);
    }

    #[tokio::test]
    async fn response_from_wrong_origin_is_ignored() {
        let (mut engine, _recorder) = engine();
        let outcomes: Outcomes = Arc::default();

        let id = engine
            .call(
                CallConfig::new(3, "echo")
                    .destination_origin("https://trusted.example")
                    .on_complete(collecting(&outcomes)),
            )
            .unwrap()
            .unwrap();

        let reply = codec::encode(&Envelope::Response(Response::success(Some(MessageId::from(id)), json!(1))));
        engine.handle_inbound(inbound(reply.clone(), "https://evil.example"));
        assert!(outcomes.lock().unwrap().is_empty());
        assert!(engine.is_pending(&id));

        engine.handle_inbound(inbound(reply, "https://trusted.example"));
        assert_eq!(*outcomes.lock().unwrap(), vec![Ok(json!(1))]);
    }

    #[tokio::test]
    async fn notification_creates_no_pending_entry() {
        let (mut engine, recorder) = engine();
        let id = engine
            .call(CallConfig::new(3, "log").params(vec![json!("line")]))
            .unwrap();
        assert!(id.is_none());
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.armed_timers(), 0);

        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert!(request_of(&sent[0].1).is_notification());
    }

    #[tokio::test]
    async fn negative_retries_fail_before_sending() {
        let (mut engine, recorder) = engine();
        let result = engine.call(CallConfig::new(3, "echo").retries(-1).on_success(|_| ()));
        match result {
            Err(ConfigError::NegativeRetries(-1)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(recorder.take().is_empty());
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn oversized_timeout_fails_before_sending() {
        let (mut engine, recorder) = engine();
        let outcomes: Outcomes = Arc::default();

        let result = engine.call(
            CallConfig::new(3, "x")
                .timeout(Duration::from_secs(5 * 365 * 24 * 60 * 60))
                .on_complete(collecting(&outcomes)),
        );
        match result {
            Err(ConfigError::TimeoutTooLarge(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(recorder.take().is_empty());
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.armed_timers(), 0);

        let mut config = RpcConfig::default();
        config.timeout_ms = u64::MAX;
        let mut engine = Engine::new(recorder.clone(), config, None);
        match engine.call(CallConfig::new(3, "x").on_success(|_| ())) {
            Err(ConfigError::TimeoutTooLarge(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }

        // The largest accepted timeout arms a timer.
        let id = engine
            .call(CallConfig::new(3, "x").timeout(MAX_TIMEOUT).on_success(|_| ()))
            .unwrap()
            .unwrap();
        assert!(engine.is_pending(&id));
        assert_eq!(engine.armed_timers(), 1);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_times_out() {
        let (mut engine, recorder) = engine();
        let outcomes: Outcomes = Arc::default();
        let start = Instant::now();

        let id = engine
            .call(
                CallConfig::new(3, "slow")
                    .retries(2)
                    .timeout(Duration::from_millis(50))
                    .on_complete(collecting(&outcomes)),
            )
            .unwrap()
            .unwrap();

        while engine.is_pending(&id) {
            let event = engine.next_event().await.expect("timer should be armed");
            engine.process(event);
        }

        let sent = recorder.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, text, _)| *text == sent[0].1));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![Err(CallError::Timeout { attempts: 3 })]
        );
        assert_eq!(engine.armed_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_cancels_the_retry_timer() {
        let (mut engine, recorder) = engine();
        let outcomes: Outcomes = Arc::default();

        let id = engine
            .call(
                CallConfig::new(3, "echo")
                    .timeout(Duration::from_millis(50))
                    .on_complete(collecting(&outcomes)),
            )
            .unwrap()
            .unwrap();

        // First attempt lost, second one answered.
        let event = engine.next_event().await.unwrap();
        engine.process(event);
        assert_eq!(recorder.take().len(), 2);

        let reply = codec::encode(&Envelope::Response(Response::success(Some(MessageId::from(id)), json!(true))));
        engine.handle_inbound(inbound(reply, "peer"));
        assert_eq!(engine.armed_timers(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(recorder.take().is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![Ok(json!(true))]);

        // A stale timer event for a settled call does nothing.
        engine.handle_timeout(id);
        assert!(recorder.take().is_empty());
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn async_procedure_answers_later() {
        let (mut engine, recorder) = engine();
        let parked: Arc<Mutex<Vec<Responder>>> = Arc::default();
        let p = Arc::clone(&parked);
        engine.register(
            "later",
            Registration::asynchronous(move |_args, responder| p.lock().unwrap().push(responder)),
        );

        let id = CallId::new();
        engine.handle_inbound(inbound(request("later", json!([]), Some(id)), "x"));
        assert!(recorder.take().is_empty());

        let responder = parked.lock().unwrap().pop().unwrap();
        responder.resolve(Ok(json!("finally")));

        let event = engine.next_event().await.unwrap();
        engine.process(event);
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "x");
        let resp = response_of(&sent[0].1);
        assert_eq!(resp.id, Some(MessageId::from(id)));
        assert_eq!(resp.outcome, Outcome::Success(json!("finally")));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_calls_once() {
        let (mut engine, _recorder) = engine();
        let outcomes: Outcomes = Arc::default();
        for _ in 0..3 {
            engine
                .call(CallConfig::new(3, "echo").on_complete(collecting(&outcomes)))
                .unwrap();
        }

        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.armed_timers(), 0);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|r| *r == Err(CallError::Shutdown)));
    }
}
