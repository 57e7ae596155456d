// Copyright 2020 Joyent, Inc.

//! The seam between the rpc engine and whatever message channel carries its
//! text.

use std::fmt;
use std::io;

/// A best-effort channel.  `send` hands text to the channel and returns; the
/// text may be lost, duplicated by retries, or reordered with respect to
/// other messages.  `origin_constraint` is a wildcard pattern the
/// destination's origin must match for the text to be delivered.
pub trait Transport: Send + 'static {
    type Handle: Clone + fmt::Debug + Send + 'static;

    fn send(&self, destination: &Self::Handle, text: &str, origin_constraint: &str)
        -> io::Result<()>;
}

/// A message delivered by the channel, along with the origin the sender
/// claims and a handle that reaches the sender.
#[derive(Debug, Clone)]
pub struct Inbound<H> {
    pub text: String,
    pub origin: String,
    pub source: H,
}

impl<H> Inbound<H> {
    pub fn new(text: String, origin: &str, source: H) -> Inbound<H> {
        Inbound {
            text,
            origin: String::from(origin),
            source,
        }
    }
}
