// Copyright 2020 Joyent, Inc.

//! An in-process message channel.
//!
//! Peers join a `MemoryHub` under an origin and get back a transport plus the
//! receiving end of their inbox.  Like any best-effort channel the hub may
//! lose messages: `set_loss` sets the probability that a send is silently
//! dropped.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use slog::{debug, o, trace, Drain, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::acl::OriginPattern;
use crate::client::RpcClient;
use crate::config::RpcConfig;
use crate::dispatcher::Engine;
use crate::server;
use crate::transport::{Inbound, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

#[derive(Debug)]
struct Peer {
    origin: String,
    inbox: mpsc::UnboundedSender<Inbound<PeerId>>,
}

#[derive(Debug, Default)]
struct HubState {
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
    loss: f64,
}

#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    log: Logger,
}

impl MemoryHub {
    pub fn new(log: Option<&Logger>) -> MemoryHub {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        MemoryHub {
            state: Arc::new(Mutex::new(HubState::default())),
            log,
        }
    }

    /// Add a peer claiming `origin`.
    pub fn join(&self, origin: &str) -> (MemoryTransport, mpsc::UnboundedReceiver<Inbound<PeerId>>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let peer = PeerId(state.next_id);
        state.next_id += 1;
        state.peers.insert(
            peer,
            Peer {
                origin: String::from(origin),
                inbox,
            },
        );
        debug!(self.log, "peer joined"; "peer" => peer.0, "origin" => origin);

        let transport = MemoryTransport {
            hub: self.clone(),
            peer,
            origin: String::from(origin),
        };
        (transport, rx)
    }

    /// Join the hub and run an engine for the new peer on its own task.
    pub fn spawn_engine(
        &self,
        origin: &str,
        config: RpcConfig,
    ) -> (PeerId, RpcClient<PeerId>, JoinHandle<()>) {
        let (transport, inbound) = self.join(origin);
        let peer = transport.peer();
        let log = self.log.new(o!("peer" => peer.0, "origin" => String::from(origin)));
        let engine = Engine::new(transport, config, Some(&log));
        let (client, task) = server::spawn(engine, inbound, Some(&log));

        (peer, client, task)
    }

    /// Remove a peer.  Its engine sees the inbound channel close.
    pub fn leave(&self, peer: PeerId) {
        self.lock().peers.remove(&peer);
    }

    /// Probability, clamped to `[0, 1]`, that any one send is lost.
    pub fn set_loss(&self, probability: f64) {
        self.lock().loss = probability.max(0.0).min(1.0);
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    peer: PeerId,
    origin: String,
}

impl MemoryTransport {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Transport for MemoryTransport {
    type Handle = PeerId;

    fn send(&self, destination: &PeerId, text: &str, origin_constraint: &str) -> io::Result<()> {
        let constraint = OriginPattern::new(origin_constraint)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let state = self.hub.lock();
        let log = &self.hub.log;

        let peer = match state.peers.get(destination) {
            Some(peer) => peer,
            None => {
                trace!(log, "no such peer"; "destination" => destination.0);
                return Ok(());
            }
        };

        if !constraint.matches(&peer.origin) {
            trace!(log, "destination origin does not match";
                "destination" => destination.0, "constraint" => origin_constraint);
            return Ok(());
        }

        if state.loss > 0.0 && rand::thread_rng().gen_bool(state.loss) {
            trace!(log, "message lost"; "source" => self.peer.0, "destination" => destination.0);
            return Ok(());
        }

        // A closed inbox looks the same as a lost message to the sender.
        let _ = peer
            .inbox
            .send(Inbound::new(String::from(text), &self.origin, self.peer));
        Ok(())
    }
}
