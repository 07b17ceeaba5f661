//! The per-worker connection table. Accept draining, activity stamps, the
//! periodic inactivity sweep and disconnect pruning live here; protocol
//! work on the streams belongs to the engines.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use log::{debug, warn};
use mio::Token;
use mio::net::TcpStream;

use crate::event::{CONN_BASE, Demux, Listener};

pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub last_active: u64,
    pub disconnected: bool,
}

pub struct ConnectionTable {
    conns: HashMap<Token, Connection>,
    next_token: usize,
    idle_timeout_ms: u64,
}

impl ConnectionTable {
    pub fn new(idle_timeout_ms: u64) -> Self {
        Self {
            conns: HashMap::new(),
            next_token: CONN_BASE,
            idle_timeout_ms,
        }
    }

    /// Live connections, the first accept-lock load gate.
    pub fn active(&self) -> u32 {
        self.conns.len() as u32
    }

    /// Drains the listener's accept queue into the table. Returns how many
    /// connections were accepted.
    pub fn accept_from(&mut self, listener: &mut Listener, demux: &mut Demux, now: u64) -> u32 {
        let mut accepted = 0;
        loop {
            match listener.socket.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = demux.register_conn(&mut stream, token) {
                        warn!("failed to register connection from {peer}: {e}");
                        continue;
                    }
                    debug!("accepted connection from {peer}");
                    self.conns.insert(
                        token,
                        Connection {
                            stream,
                            peer,
                            last_active: now,
                            disconnected: false,
                        },
                    );
                    accepted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept: {e}");
                    break;
                }
            }
        }
        accepted
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    pub fn touch(&mut self, token: Token, now: u64) {
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.last_active = now;
        }
    }

    pub fn mark_disconnected(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.disconnected = true;
        }
    }

    /// Marks connections idle past the deadline. The loop runs this at
    /// most every 500 ms.
    pub fn check_timeouts(&mut self, now: u64) {
        for (token, conn) in self.conns.iter_mut() {
            if !conn.disconnected && now.saturating_sub(conn.last_active) >= self.idle_timeout_ms {
                debug!("connection {:?} from {} timed out", token, conn.peer);
                conn.disconnected = true;
            }
        }
    }

    /// Drops everything marked disconnected and releases the poll
    /// registrations.
    pub fn prune(&mut self, demux: &mut Demux) {
        let dead: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.disconnected)
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.conns.remove(&token) {
                demux.deregister_conn(&mut conn.stream);
            }
        }
    }

    /// Teardown: closes every connection.
    pub fn clear(&mut self, demux: &mut Demux) {
        for (_, conn) in self.conns.iter_mut() {
            demux.deregister_conn(&mut conn.stream);
        }
        self.conns.clear();
    }
}
