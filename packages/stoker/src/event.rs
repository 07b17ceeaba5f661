//! The event demultiplexer: one mio poll per process with fixed token
//! ranges for the control channel, the shared listeners and accepted
//! connections. Listener interest is armed only while the worker holds the
//! accept lock.

use std::io;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;

pub const TOKEN_CHANNEL: Token = Token(0);
const LISTENER_BASE: usize = 1;

/// First token handed to accepted connections.
pub const CONN_BASE: usize = 1024;

/// A shared listening socket plus its poll token. The socket itself is
/// created by the embedder before fork; every worker registers the same
/// descriptor in its own poll.
pub struct Listener {
    pub socket: TcpListener,
    pub token: Token,
}

/// Converts the inherited std listeners into pollable ones.
pub fn adopt_listeners(listeners: Vec<std::net::TcpListener>) -> Result<Vec<Listener>> {
    listeners
        .into_iter()
        .enumerate()
        .map(|(i, listener)| {
            listener.set_nonblocking(true)?;
            Ok(Listener {
                socket: TcpListener::from_std(listener),
                token: Token(LISTENER_BASE + i),
            })
        })
        .collect()
}

pub struct Demux {
    poll: Poll,
    events: Events,
    accept_armed: bool,
}

impl Demux {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            accept_armed: false,
        })
    }

    pub fn register_channel(&mut self, stream: &mut UnixStream) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, TOKEN_CHANNEL, Interest::READABLE)
    }

    /// Watches the listeners for readiness. Only the accept-lock holder
    /// arms them, which is what keeps the pool off the thundering herd.
    pub fn arm_accept(&mut self, listeners: &mut [Listener]) -> io::Result<()> {
        if self.accept_armed {
            return Ok(());
        }
        for listener in listeners.iter_mut() {
            self.poll
                .registry()
                .register(&mut listener.socket, listener.token, Interest::READABLE)?;
        }
        self.accept_armed = true;
        Ok(())
    }

    pub fn disarm_accept(&mut self, listeners: &mut [Listener]) -> io::Result<()> {
        if !self.accept_armed {
            return Ok(());
        }
        for listener in listeners.iter_mut() {
            self.poll.registry().deregister(&mut listener.socket)?;
        }
        self.accept_armed = false;
        Ok(())
    }

    pub fn accept_armed(&self) -> bool {
        self.accept_armed
    }

    pub fn register_conn(&mut self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister_conn(&mut self, stream: &mut TcpStream) {
        let _ = self.poll.registry().deregister(stream);
    }

    /// The loop's only blocking call, bounded by `timeout`. EINTR means a
    /// signal arrived and surfaces as an empty event set.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn is_listener_token(token: Token) -> bool {
        (LISTENER_BASE..CONN_BASE).contains(&token.0)
    }
}
