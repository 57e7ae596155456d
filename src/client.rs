// Copyright 2020 Joyent, Inc.

//! Handle used by application code to talk to a running engine.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::RpcConfig;
use crate::dispatcher::CallConfig;
use crate::error::{CallError, ConfigError};
use crate::registry::Registration;

/// Requests from an `RpcClient` to the task that owns the engine.
pub enum Command<H> {
    Call(CallConfig<H>),
    Register(String, Registration),
    Unregister(String),
    Shutdown,
}

/// Resolves to the outcome of a correlated call.
#[derive(Debug)]
pub struct CallFuture {
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl Future for CallFuture {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the engine went away with the call still
        // queued.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::Shutdown)))
    }
}

#[derive(Debug)]
pub struct RpcClient<H> {
    commands: mpsc::UnboundedSender<Command<H>>,
    defaults: RpcConfig,
}

impl<H> Clone for RpcClient<H> {
    fn clone(&self) -> Self {
        RpcClient {
            commands: self.commands.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<H> RpcClient<H> {
    pub fn new(commands: mpsc::UnboundedSender<Command<H>>, defaults: RpcConfig) -> RpcClient<H> {
        RpcClient { commands, defaults }
    }

    /// Place a correlated call and return a future for its outcome.  Any
    /// continuations already set on `config` are replaced by the future.
    pub fn call(&self, config: CallConfig<H>) -> Result<CallFuture, ConfigError> {
        config.options(&self.defaults)?;

        let (tx, rx) = oneshot::channel();
        let config = config.notification().on_complete(move |outcome| {
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        });
        self.submit(Command::Call(config))?;

        Ok(CallFuture { rx })
    }

    /// Place a call with the continuations set on `config`, or as a
    /// notification if it has none.
    pub fn call_with(&self, config: CallConfig<H>) -> Result<(), ConfigError> {
        config.options(&self.defaults)?;
        self.submit(Command::Call(config))
    }

    /// Fire and forget: nothing is correlated, retried or reported back.
    pub fn notify(&self, config: CallConfig<H>) -> Result<(), ConfigError> {
        self.call_with(config.notification())
    }

    pub fn register(&self, name: &str, registration: Registration) -> Result<(), ConfigError> {
        self.submit(Command::Register(String::from(name), registration))
    }

    pub fn unregister(&self, name: &str) -> Result<(), ConfigError> {
        self.submit(Command::Unregister(String::from(name)))
    }

    /// Stop the engine.  Calls still pending fail with `CallError::Shutdown`.
    pub fn shutdown(&self) -> Result<(), ConfigError> {
        self.submit(Command::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn submit(&self, command: Command<H>) -> Result<(), ConfigError> {
        self.commands.send(command).map_err(|_| ConfigError::Closed)
    }
}
