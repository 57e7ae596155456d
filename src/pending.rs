// Copyright 2020 Joyent, Inc.

//! Caller-side bookkeeping for correlated calls awaiting a response.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::acl::OriginPattern;
use crate::error::CallError;
use crate::scheduler::TimerKey;

/// Identifier of a correlated call: a version 4 UUID, so identifiers of
/// concurrently pending calls never collide and cannot be guessed by other
/// users of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> CallId {
        CallId(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        CallId::new()
    }
}

impl FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<CallId, uuid::Error> {
        Uuid::parse_str(s).map(CallId)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

pub type SuccessFn = Box<dyn FnOnce(Value) + Send>;
pub type ErrorFn = Box<dyn FnOnce(CallError) + Send>;
pub type CompleteFn = Box<dyn FnOnce(Result<Value, CallError>) + Send>;

/// What runs when a correlated call resolves.  Both resolving methods consume
/// the value, so at most one continuation ever runs, and it runs once.
pub enum Continuation {
    Split { on_success: SuccessFn, on_error: ErrorFn },
    Joined(CompleteFn),
}

impl Continuation {
    pub fn new(on_success: SuccessFn, on_error: ErrorFn) -> Continuation {
        Continuation::Split {
            on_success,
            on_error,
        }
    }

    pub fn joined(on_complete: CompleteFn) -> Continuation {
        Continuation::Joined(on_complete)
    }

    pub fn succeed(self, result: Value) {
        match self {
            Continuation::Split { on_success, .. } => on_success(result),
            Continuation::Joined(on_complete) => on_complete(Ok(result)),
        }
    }

    pub fn fail(self, err: CallError) {
        match self {
            Continuation::Split { on_error, .. } => on_error(err),
            Continuation::Joined(on_complete) => on_complete(Err(err)),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Continuation::Split { .. } => f.write_str("Continuation::Split"),
            Continuation::Joined(_) => f.write_str("Continuation::Joined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    NotSent,
    Sent,
    Resolved,
}

#[derive(Debug)]
pub struct PendingCall<H> {
    pub id: CallId,
    pub procedure: String,
    pub destination: H,
    pub destination_origin: OriginPattern,
    pub request: String,
    pub continuation: Continuation,
    pub retries_left: u32,
    pub attempts: u32,
    pub timeout: Duration,
    pub status: CallStatus,
    pub timer: Option<TimerKey>,
}

/// Table of every correlated call that has not yet resolved, keyed by call
/// identifier.
#[derive(Debug)]
pub struct PendingCalls<H> {
    calls: HashMap<CallId, PendingCall<H>>,
}

impl<H> PendingCalls<H> {
    pub fn new() -> PendingCalls<H> {
        PendingCalls {
            calls: HashMap::new(),
        }
    }

    pub fn insert(&mut self, call: PendingCall<H>) {
        self.calls.insert(call.id, call);
    }

    pub fn get_mut(&mut self, id: &CallId) -> Option<&mut PendingCall<H>> {
        self.calls.get_mut(id)
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    /// Remove a call from the table, marking it resolved.  A second removal
    /// of the same identifier returns `None`.
    pub fn resolve(&mut self, id: &CallId) -> Option<PendingCall<H>> {
        self.calls.remove(id).map(|mut call| {
            call.status = CallStatus::Resolved;
            call
        })
    }

    pub fn drain(&mut self) -> Vec<PendingCall<H>> {
        self.calls
            .drain()
            .map(|(_, mut call)| {
                call.status = CallStatus::Resolved;
                call
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl<H> Default for PendingCalls<H> {
    fn default() -> Self {
        PendingCalls::new()
    }
}
