//! Readiness multiplexer.
//!
//! Wraps `mio::Poll` and tracks the set of live registrations so that
//! duplicate registration and modification of unknown tokens surface as
//! explicit errors instead of backend-dependent syscall failures.
//!
//! mio registers descriptors edge-triggered on epoll: once a token
//! reports readable, the owner must drain the descriptor (read until it
//! would block) before the next `wait` reports it again. The dispatcher's
//! drain loops rely on this.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Multiplexer errors.
///
/// `AlreadyRegistered` and `NotRegistered` indicate multiplexer misuse, a
/// programming error in the caller. They never occur in steady state.
#[derive(Debug)]
pub(crate) enum PollerError {
    /// `register` was called for a token that is already live.
    AlreadyRegistered(usize),
    /// `modify` or `unregister` was called for an unknown token.
    NotRegistered(usize),
    /// The underlying readiness facility failed.
    Io(io::Error),
}

impl std::fmt::Display for PollerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerError::AlreadyRegistered(token) => {
                write!(f, "token {} is already registered", token)
            }
            PollerError::NotRegistered(token) => {
                write!(f, "token {} is not registered", token)
            }
            PollerError::Io(e) => write!(f, "poll error: {}", e),
        }
    }
}

impl std::error::Error for PollerError {}

impl From<io::Error> for PollerError {
    fn from(e: io::Error) -> Self {
        PollerError::Io(e)
    }
}

impl PollerError {
    /// Flatten into an `io::Error` for callers that only speak I/O.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            PollerError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Readiness multiplexer over a set of registered descriptors.
///
/// Exactly one registration exists per live listening socket or
/// connection; the registration is keyed by token and carries the
/// current interest mask. The poller holds no ownership of the sources
/// it watches, only the token used for lookup.
pub(crate) struct Poller {
    poll: Poll,
    registered: HashMap<usize, Interest>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            registered: HashMap::new(),
        })
    }

    /// Create a waker that can interrupt a blocked `wait` from another
    /// thread. The waker token is delivered like any other event.
    pub(crate) fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    /// Register a source for the given interest.
    pub(crate) fn register(
        &mut self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> Result<(), PollerError> {
        if self.registered.contains_key(&token.0) {
            return Err(PollerError::AlreadyRegistered(token.0));
        }
        self.poll.registry().register(source, token, interest)?;
        self.registered.insert(token.0, interest);
        Ok(())
    }

    /// Replace the interest mask of a live registration.
    pub(crate) fn modify(
        &mut self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> Result<(), PollerError> {
        if !self.registered.contains_key(&token.0) {
            return Err(PollerError::NotRegistered(token.0));
        }
        self.poll.registry().reregister(source, token, interest)?;
        self.registered.insert(token.0, interest);
        Ok(())
    }

    /// Drop a live registration.
    pub(crate) fn unregister(
        &mut self,
        source: &mut impl Source,
        token: Token,
    ) -> Result<(), PollerError> {
        if self.registered.remove(&token.0).is_none() {
            return Err(PollerError::NotRegistered(token.0));
        }
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Block until at least one registered source is ready or the timeout
    /// elapses.
    ///
    /// `None` blocks indefinitely; `Some(Duration::ZERO)` polls without
    /// blocking. Timeout expiry leaves `events` empty and returns `Ok`.
    /// Interrupted waits are retried.
    pub(crate) fn wait(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        loop {
            match self.poll.poll(events, timeout) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Interest currently registered for a token, if any.
    #[cfg(test)]
    pub(crate) fn registration(&self, token: Token) -> Option<Interest> {
        self.registered.get(&token.0).copied()
    }

    /// Number of live registrations.
    pub(crate) fn registered_count(&self) -> usize {
        self.registered.len()
    }
}
