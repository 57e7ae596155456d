// Copyright 2020 Joyent, Inc.

//! The task that drives an engine.
//!
//! All engine state lives on this one task.  Inbound channel messages,
//! commands from `RpcClient` handles, expired retry timers and late answers
//! from asynchronous procedures are taken one at a time, so registry and
//! pending-call mutations are always sequenced.

use slog::{debug, info, o, warn, Drain, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{Command, RpcClient};
use crate::dispatcher::Engine;
use crate::transport::{Inbound, Transport};

/// Move `engine` onto its own task and return a client handle for it.  Must
/// be called from within a tokio runtime.
pub fn spawn<T>(
    engine: Engine<T>,
    inbound: mpsc::UnboundedReceiver<Inbound<T::Handle>>,
    log: Option<&Logger>,
) -> (RpcClient<T::Handle>, JoinHandle<()>)
where
    T: Transport,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let (tx, rx) = mpsc::unbounded_channel();
    let client = RpcClient::new(tx, engine.config().clone());
    let task = tokio::spawn(run(engine, inbound, rx, log));

    (client, task)
}

/// Run `engine` until it is told to shut down or the channel stops
/// delivering messages.  Dropping every client handle leaves the engine
/// serving inbound requests.  Pending calls are failed on the way out.
pub async fn run<T>(
    mut engine: Engine<T>,
    mut inbound: mpsc::UnboundedReceiver<Inbound<T::Handle>>,
    mut commands: mpsc::UnboundedReceiver<Command<T::Handle>>,
    log: Logger,
) where
    T: Transport,
{
    info!(log, "rpc engine started");
    let mut accepting = true;

    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(msg) => engine.handle_inbound(msg),
                None => {
                    debug!(log, "inbound channel closed");
                    break;
                }
            },
            cmd = commands.recv(), if accepting => match cmd {
                Some(Command::Call(config)) => {
                    if let Err(e) = engine.call(config) {
                        warn!(log, "rejected call"; "err" => %e);
                    }
                }
                Some(Command::Register(name, registration)) => {
                    engine.register(&name, registration);
                }
                Some(Command::Unregister(name)) => {
                    engine.unregister(&name);
                }
                Some(Command::Shutdown) => {
                    debug!(log, "shutdown requested");
                    break;
                }
                None => {
                    debug!(log, "all client handles dropped");
                    accepting = false;
                }
            },
            Some(event) = engine.next_event() => engine.process(event),
        }
    }

    engine.shutdown();
    info!(log, "rpc engine stopped");
}
