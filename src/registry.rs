// Copyright 2020 Joyent, Inc.

//! Procedures callable by remote peers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::acl::AccessPolicy;

/// Failure reported by a procedure.  Travels back to a correlated caller as a
/// remote fault carrying `data`, or `message` when there is no data.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: &str) -> HandlerError {
        HandlerError {
            message: String::from(message),
            data: None,
        }
    }

    pub fn with_data(message: &str, data: Value) -> HandlerError {
        HandlerError {
            message: String::from(message),
            data: Some(data),
        }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

type SyncFn = dyn Fn(Vec<Value>) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Vec<Value>, Responder) + Send + Sync;

/// Completion handle given to asynchronous procedures.  Resolving consumes
/// it; a responder dropped without resolving reports a remote fault.
pub struct Responder {
    complete: Option<Box<dyn FnOnce(HandlerResult) + Send>>,
}

impl Responder {
    pub fn new<F>(complete: F) -> Responder
    where
        F: FnOnce(HandlerResult) + Send + 'static,
    {
        Responder {
            complete: Some(Box::new(complete)),
        }
    }

    pub fn resolve(mut self, result: HandlerResult) {
        if let Some(complete) = self.complete.take() {
            complete(result)
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            complete(Err(HandlerError::new("procedure dropped its responder")))
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Responder")
            .field("resolved", &self.complete.is_none())
            .finish()
    }
}

#[derive(Clone)]
pub enum Procedure {
    /// Returns its result before the dispatcher moves on.
    Sync(Arc<SyncFn>),
    /// Receives a `Responder` and may resolve it later.
    Async(Arc<AsyncFn>),
}

impl Procedure {
    pub fn is_async(&self) -> bool {
        matches!(self, Procedure::Async(_))
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Procedure::Sync(_) => f.write_str("Procedure::Sync"),
            Procedure::Async(_) => f.write_str("Procedure::Async"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub procedure: Procedure,
    pub param_names: Vec<String>,
    pub policy: AccessPolicy,
}

impl Registration {
    pub fn new<F>(procedure: F) -> Registration
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        Registration::from_procedure(Procedure::Sync(Arc::new(procedure)))
    }

    pub fn asynchronous<F>(procedure: F) -> Registration
    where
        F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
    {
        Registration::from_procedure(Procedure::Async(Arc::new(procedure)))
    }

    /// A synchronous procedure invoked as a method on `context`.
    pub fn bound<C>(context: Arc<C>, method: fn(&C, Vec<Value>) -> HandlerResult) -> Registration
    where
        C: Send + Sync + 'static,
    {
        Registration::new(move |args| method(&context, args))
    }

    fn from_procedure(procedure: Procedure) -> Registration {
        Registration {
            procedure,
            param_names: Vec::new(),
            policy: AccessPolicy::default(),
        }
    }

    /// Declare the ordered parameter names used to bind named parameters.
    pub fn params<I>(mut self, names: I) -> Registration
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.param_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn policy(mut self, policy: AccessPolicy) -> Registration {
        self.policy = policy;
        self
    }
}

/// Table of registered procedures, keyed by public name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Registration>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    /// Register `registration` under `name`, returning whatever it replaced.
    pub fn register(&mut self, name: &str, registration: Registration) -> Option<Registration> {
        self.services.insert(String::from(name), registration)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Registration> {
        self.services.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&Registration> {
        self.services.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
