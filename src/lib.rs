// Copyright 2020 Joyent, Inc.

//! relay-rpc: JSON RPC over best-effort message channels
//!
//! relay-rpc turns a channel that can only post text between execution
//! contexts (frames, workers, tabs, processes) into remote procedure calls.
//! The channel is assumed to lose messages and to reorder unrelated ones; it
//! offers no correlation between a request and its answer.  relay-rpc adds
//! framing, correlation, retries with timeouts, and origin-based access
//! control on top of it.
//!
//! Protocol definition
//!
//! Every message is the ASCII marker `relayrpc.` followed by a JSON object
//! shaped after JSON-RPC 2.0.  Text without the marker belongs to some other
//! user of the channel and is ignored.
//!
//! * Request   `{"jsonrpc": "2.0", "method": NAME, "params": PARAMS, "id": ID}`
//!
//!     * PARAMS  either an array of positional values or an object of named
//!               values.  Named values are bound using the parameter names a
//!               procedure declared when it was registered.
//!
//!     * ID      a string chosen by the caller and echoed back unchanged in
//!               the response.  relay-rpc itself uses version 4 UUIDs.  A
//!               request without an id is a notification: it is never
//!               answered, retried or reported on.
//!
//! * Response  `{"jsonrpc": "2.0", "id": ID, "result": VALUE}` or
//!             `{"jsonrpc": "2.0", "id": ID, "error": {"code": CODE,
//!             "message": TEXT, "data": VALUE}}`
//!
//! * Error codes
//!
//!     * -32700  parse error
//!
//!     * -32600  invalid request
//!
//!     * -32601  method not found
//!
//!     * -32602  invalid params
//!
//!     * -32099  access denied: the caller's origin failed the procedure's
//!               whitelist/blacklist
//!
//!     * -32098  remote fault: the procedure reported a failure
//!
//! Delivery: a correlated request is re-sent, unchanged, every time its
//! timeout expires without an answer until its retry budget is spent, at
//! which point the caller sees a local timeout.  A receiver may therefore run
//! a procedure more than once for one call.  Answers for calls that are no
//! longer pending are dropped, so each call resolves exactly once.

#![allow(missing_docs)]

pub mod acl;
pub mod binder;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod pending;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use crate::acl::{AccessPolicy, OriginPattern};
pub use crate::client::{CallFuture, RpcClient};
pub use crate::codec::{MessageId, Params, RpcError};
pub use crate::config::RpcConfig;
pub use crate::dispatcher::{CallConfig, Engine};
pub use crate::error::{CallError, ConfigError, ErrorKind};
pub use crate::pending::CallId;
pub use crate::registry::{HandlerError, HandlerResult, Registration, Responder};
pub use crate::transport::{Inbound, Transport};
