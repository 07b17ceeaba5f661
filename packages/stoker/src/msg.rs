//! The typed control channel between the supervisor and each worker: a
//! non-blocking stream socketpair carrying length-prefixed frames. FIFO per
//! pair, best-effort beyond the backlog bound; lifecycle traffic is retried
//! logically by the callers' periodic ticks.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream as StdUnixStream;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};
use mio::net::UnixStream;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::error::{Result, StokerError};

/// Destination codes carried in the frame header. General workers use
/// their logical id (1..K); the rest of the u16 space is reserved.
pub const ADDR_PARENT: u16 = 0;
pub const ADDR_ACME: u16 = 0xFFFD;
pub const ADDR_KEYMGR: u16 = 0xFFFE;
pub const ADDR_ALL: u16 = 0xFFFF;

/// kind + src + dst + payload length.
pub const FRAME_HEADER_LEN: usize = 1 + 2 + 2 + 4;

/// Payloads past this are refused at send time.
pub const MAX_PAYLOAD: usize = 256 * 1024;

/// Unflushed outbound bytes past this cause frames to drop with a log
/// instead of stalling the event loop.
pub const MAX_BACKLOG: usize = 512 * 1024;

/// Control message kinds understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    AcceptAvailable = 1,
    Shutdown = 2,
    EntropyReq = 3,
    EntropyResp = 4,
    CertificateReq = 5,
    Certificate = 6,
    Crl = 7,
    AcmeChallengeSetCert = 8,
    AcmeChallengeClearCert = 9,
}

impl MsgKind {
    pub fn from_u8(raw: u8) -> Option<MsgKind> {
        match raw {
            1 => Some(MsgKind::AcceptAvailable),
            2 => Some(MsgKind::Shutdown),
            3 => Some(MsgKind::EntropyReq),
            4 => Some(MsgKind::EntropyResp),
            5 => Some(MsgKind::CertificateReq),
            6 => Some(MsgKind::Certificate),
            7 => Some(MsgKind::Crl),
            8 => Some(MsgKind::AcmeChallengeSetCert),
            9 => Some(MsgKind::AcmeChallengeClearCert),
            _ => None,
        }
    }
}

/// One decoded control-channel message. The kind stays raw so unknown
/// values survive to the dispatch layer, which logs and drops them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub src: u16,
    pub dst: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn msg_kind(&self) -> Option<MsgKind> {
        MsgKind::from_u8(self.kind)
    }
}

fn encode_raw(buf: &mut BytesMut, kind: u8, src: u16, dst: u16, payload: &[u8]) {
    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(kind);
    buf.put_u16_le(src);
    buf.put_u16_le(dst);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Splits one complete frame off the front of `buf`, or returns `None`
/// until more bytes arrive. A declared length past [`MAX_PAYLOAD`] means
/// the stream is corrupt; the buffer is discarded.
fn decode_frame(buf: &mut BytesMut) -> Option<Frame> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if len > MAX_PAYLOAD {
        warn!("corrupt control frame (declared {len} bytes), discarding stream buffer");
        buf.clear();
        return None;
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    let kind = buf.get_u8();
    let src = buf.get_u16_le();
    let dst = buf.get_u16_le();
    let _ = buf.get_u32_le();
    let payload = buf.split_to(len).freeze();
    Some(Frame {
        kind,
        src,
        dst,
        payload,
    })
}

/// One endpoint of a supervisor<->worker control pipe.
pub struct Channel {
    stream: UnixStream,
    inbuf: BytesMut,
    outbuf: BytesMut,
    dropped: u64,
}

impl Channel {
    /// Creates the socketpair for one worker slot, both ends non-blocking:
    /// (supervisor side, worker side).
    pub fn pair() -> Result<(Channel, Channel)> {
        let (sup, wrk) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| StokerError::sys("socketpair", e))?;
        Ok((Channel::from_fd(sup)?, Channel::from_fd(wrk)?))
    }

    fn from_fd(fd: OwnedFd) -> Result<Channel> {
        let stream = StdUnixStream::from(fd);
        stream.set_nonblocking(true)?;
        Ok(Channel {
            stream: UnixStream::from_std(stream),
            inbuf: BytesMut::with_capacity(4096),
            outbuf: BytesMut::new(),
            dropped: 0,
        })
    }

    /// The raw stream, for demultiplexer registration.
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Queues a frame and flushes opportunistically. Returns false when
    /// the frame was dropped (oversized payload or full backlog).
    pub fn send(&mut self, kind: MsgKind, src: u16, dst: u16, payload: &[u8]) -> bool {
        self.send_raw(kind as u8, src, dst, payload)
    }

    /// Forwards an already-decoded frame verbatim, unknown kinds included.
    pub fn send_frame(&mut self, frame: &Frame) -> bool {
        self.send_raw(frame.kind, frame.src, frame.dst, &frame.payload)
    }

    fn send_raw(&mut self, kind: u8, src: u16, dst: u16, payload: &[u8]) -> bool {
        if payload.len() > MAX_PAYLOAD {
            warn!("refusing oversized control message kind {kind} ({} bytes)", payload.len());
            return false;
        }
        if self.outbuf.len() + FRAME_HEADER_LEN + payload.len() > MAX_BACKLOG {
            self.dropped += 1;
            warn!(
                "control channel backlog full, dropping message kind {kind} ({} dropped)",
                self.dropped
            );
            return false;
        }
        encode_raw(&mut self.outbuf, kind, src, dst, payload);
        self.flush();
        true
    }

    /// Writes as much buffered output as the socket accepts right now.
    pub fn flush(&mut self) {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => break,
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("control channel write: {e}");
                    break;
                }
            }
        }
    }

    /// Reads everything available and returns the complete frames, in
    /// arrival order.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                // EOF: the peer is gone; the reaper finds out via SIGCHLD.
                Ok(0) => break,
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("control channel read: {e}");
                    break;
                }
            }
        }
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut self.inbuf) {
            frames.push(frame);
        }
        frames
    }

    pub fn has_backlog(&self) -> bool {
        !self.outbuf.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Dispatch table mapping message kinds to handlers over some state `S`.
/// Unknown kinds are logged and dropped.
pub struct MsgRegistry<S> {
    handlers: HashMap<u8, fn(&mut S, &Frame)>,
}

impl<S> Default for MsgRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> MsgRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MsgKind, handler: fn(&mut S, &Frame)) {
        self.handlers.insert(kind as u8, handler);
    }

    pub fn dispatch(&self, state: &mut S, frame: &Frame) {
        match self.handlers.get(&frame.kind) {
            Some(handler) => handler(state, frame),
            None => warn!("unknown control message kind {}", frame.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_round_trips() {
        let mut buf = BytesMut::new();
        encode_raw(&mut buf, MsgKind::Certificate as u8, 3, ADDR_KEYMGR, b"pem bytes");

        let frame = decode_frame(&mut buf).expect("complete frame");
        assert_eq!(frame.msg_kind(), Some(MsgKind::Certificate));
        assert_eq!(frame.src, 3);
        assert_eq!(frame.dst, ADDR_KEYMGR);
        assert_eq!(&frame.payload[..], b"pem bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_a_complete_frame() {
        let mut full = BytesMut::new();
        encode_raw(&mut full, MsgKind::EntropyResp as u8, 0, 1, &[7u8; 32]);

        let mut partial = BytesMut::new();
        for (i, b) in full.iter().enumerate() {
            partial.put_u8(*b);
            if i + 1 < full.len() {
                assert!(decode_frame(&mut partial).is_none());
            }
        }
        let frame = decode_frame(&mut partial).expect("frame after final byte");
        assert_eq!(frame.payload.len(), 32);
    }

    #[test]
    fn decode_discards_corrupt_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(MsgKind::Crl as u8);
        buf.put_u16_le(1);
        buf.put_u16_le(2);
        buf.put_u32_le((MAX_PAYLOAD + 1) as u32);
        buf.put_slice(b"junk");

        assert!(decode_frame(&mut buf).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn channel_pair_delivers_in_fifo_order() {
        let (mut sup, mut wrk) = Channel::pair().expect("socketpair");

        assert!(wrk.drain().is_empty());

        assert!(sup.send(MsgKind::EntropyReq, ADDR_PARENT, 1, &[]));
        assert!(sup.send(MsgKind::Certificate, ADDR_PARENT, 1, b"cert"));

        let frames = wrk.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_kind(), Some(MsgKind::EntropyReq));
        assert!(frames[0].payload.is_empty());
        assert_eq!(frames[1].msg_kind(), Some(MsgKind::Certificate));
        assert_eq!(&frames[1].payload[..], b"cert");
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (mut sup, _wrk) = Channel::pair().expect("socketpair");
        let huge = vec![0u8; MAX_PAYLOAD + 1];
        assert!(!sup.send(MsgKind::Certificate, ADDR_PARENT, 1, &huge));
    }

    #[test]
    fn backlog_overflow_drops_instead_of_blocking() {
        let (mut sup, _wrk) = Channel::pair().expect("socketpair");

        // The peer never reads, so the kernel buffer and then the backlog
        // fill up. Eventually sends must start failing without blocking.
        let payload = vec![0u8; 64 * 1024];
        let mut dropped = false;
        for _ in 0..64 {
            if !sup.send(MsgKind::EntropyResp, ADDR_PARENT, 1, &payload) {
                dropped = true;
                break;
            }
        }
        assert!(dropped);
        assert!(sup.dropped() > 0);
    }

    #[test]
    fn registry_dispatches_by_kind_and_drops_unknown() {
        struct Counts {
            accepts: u32,
        }
        fn on_accept(state: &mut Counts, _frame: &Frame) {
            state.accepts += 1;
        }

        let mut registry: MsgRegistry<Counts> = MsgRegistry::new();
        registry.register(MsgKind::AcceptAvailable, on_accept);

        let mut counts = Counts { accepts: 0 };
        let frame = Frame {
            kind: MsgKind::AcceptAvailable as u8,
            src: 2,
            dst: ADDR_ALL,
            payload: Bytes::new(),
        };
        registry.dispatch(&mut counts, &frame);
        registry.dispatch(&mut counts, &frame);
        assert_eq!(counts.accepts, 2);

        let unknown = Frame {
            kind: 0xEE,
            src: 2,
            dst: ADDR_ALL,
            payload: Bytes::new(),
        };
        // Logged and dropped; nothing observable changes.
        registry.dispatch(&mut counts, &unknown);
        assert_eq!(counts.accepts, 2);
    }
}
