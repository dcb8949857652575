//! Per-peer connection state: receive buffer, sequence/tag bookkeeping,
//! the completion-callback table, BAR table, and config-0 handlers.

use std::any::Any;
use std::io::{self, Read, Write};

use mio::net::TcpStream;

use crate::crc;
use crate::dllp::Dllp;
use crate::error::Error;
use crate::proto::{self, CplStatus, DL_HEADER_LEN, LCRC_LEN, MAX_FRAME};
use crate::tlp::Tlp;

pub type ReadHandler = Box<dyn FnMut(u64, &mut [u8]) -> bool>;
pub type WriteHandler = Box<dyn FnMut(u64, &[u8])>;
pub type CompletionHandler = Box<dyn FnOnce(CplStatus, &[u8])>;

const TAG_COUNT: usize = 32;
const BAR_COUNT: usize = 6;

pub struct BarSlot {
    pub base: u64,
    pub size: u64,
    pub read: Option<ReadHandler>,
    pub write: Option<WriteHandler>,
}

/// Result of one `read_once` step.
pub enum Received {
    /// A CRC-valid TLP ready for the router.
    Tlp(Tlp),
    /// Nothing for the router to act on (a DLLP, a NAK'd TLP, a spurious
    /// wakeup).
    None,
}

pub struct Connection {
    socket: TcpStream,
    /// This endpoint's own requester/completer ID, stamped into outbound
    /// requests and completions.
    pub id: u16,
    active: bool,
    seq: u16,
    tag_counter: u8,
    completions: [Option<CompletionHandler>; TAG_COUNT],
    pub bars: [Option<BarSlot>; BAR_COUNT],
    pub cfg0_read: Option<ReadHandler>,
    pub cfg0_write: Option<WriteHandler>,
    pub user_data: Option<Box<dyn Any>>,
}

fn seq_to_dl_header(seq: u16) -> [u8; 2] {
    [((seq >> 8) & 0xF) as u8, (seq & 0xFF) as u8]
}

fn dl_header_to_seq(h: [u8; 2]) -> u16 {
    (((h[0] & 0xF) as u16) << 8) | h[1] as u16
}

impl Connection {
    pub fn new(socket: TcpStream, id: u16) -> Self {
        Connection {
            socket,
            id,
            active: true,
            seq: 0,
            tag_counter: 0,
            completions: std::array::from_fn(|_| None),
            bars: std::array::from_fn(|_| None),
            cfg0_read: None,
            cfg0_write: None,
            user_data: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn close(&mut self) {
        self.active = false;
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Allocates a free completion tag, or `Err(TagsExhausted)` when all 32
    /// slots are occupied by in-flight requests.
    pub fn alloc_tag(&mut self) -> Result<u8, Error> {
        for _ in 0..TAG_COUNT {
            let t = self.tag_counter & 0x1F;
            self.tag_counter = self.tag_counter.wrapping_add(1) & 0x1F;
            if self.completions[t as usize].is_none() {
                return Ok(t);
            }
        }
        Err(Error::TagsExhausted)
    }

    pub fn install_completion(&mut self, tag: u8, cb: CompletionHandler) {
        self.completions[(tag & 0x1F) as usize] = Some(cb);
    }

    pub fn take_completion(&mut self, tag: u8) -> Option<CompletionHandler> {
        self.completions[(tag & 0x1F) as usize].take()
    }

    /// Drops every pending completion without invoking it, as happens when
    /// the connection is torn down (peer EOF, framing error, shutdown).
    pub fn drop_pending_completions(&mut self) {
        for slot in self.completions.iter_mut() {
            *slot = None;
        }
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1) & 0xFFF;
        self.seq
    }

    fn write_all_or_close(&mut self, frame: &[u8]) -> Result<(), Error> {
        match self.socket.write(frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(_) => {
                self.active = false;
                Err(Error::Closed)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.active = false;
                Err(Error::Closed)
            }
            Err(e) => {
                self.active = false;
                Err(Error::Io(e))
            }
        }
    }

    /// Sends a framed TLP: pre-increments the sequence counter, stamps the
    /// DL header, computes the LCRC, and writes the whole frame in one
    /// `send`.
    pub fn send_tlp(&mut self, tlp: &Tlp) -> Result<(), Error> {
        let seq = self.next_seq();
        let header_and_data = tlp.encode();

        let mut covered = Vec::with_capacity(DL_HEADER_LEN + header_and_data.len());
        covered.extend_from_slice(&seq_to_dl_header(seq));
        covered.extend_from_slice(&header_and_data);
        let lcrc = crc::tlp_lcrc32(&covered);

        let mut frame = Vec::with_capacity(1 + covered.len() + LCRC_LEN);
        frame.push(proto::PROTO_TLP);
        frame.extend_from_slice(&covered);
        frame.extend_from_slice(&lcrc);

        self.write_all_or_close(&frame)
    }

    /// Sends a DLLP: computes the CRC-16 and writes the 7-byte frame.
    pub fn send_dllp(&mut self, dllp: &Dllp) -> Result<(), Error> {
        let wire = dllp.encode();
        let mut frame = Vec::with_capacity(1 + wire.len());
        frame.push(proto::PROTO_DLLP);
        frame.extend_from_slice(&wire);
        self.write_all_or_close(&frame)
    }

    /// Reads and decodes exactly one transport unit. Returns `Ok(None)`
    /// immediately on `WouldBlock`, on a recognized-but-inert DLLP, or on a
    /// CRC-failed TLP (which gets NAK'd but not dispatched).
    pub fn read_once(&mut self) -> Result<Received, Error> {
        let mut prefix = [0u8; 1 + DL_HEADER_LEN + 4];
        match self.socket.read(&mut prefix) {
            Ok(0) => {
                self.active = false;
                return Err(Error::Closed);
            }
            Ok(n) if n < prefix.len() => {
                self.active = false;
                return Err(Error::Framing("short transport prefix read".into()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::None),
            Err(e) => {
                self.active = false;
                return Err(Error::Io(e));
            }
        }

        match prefix[0] {
            proto::PROTO_DLLP => {
                let body_and_crc: [u8; 6] = prefix[1..7].try_into().unwrap();
                match Dllp::decode(&body_and_crc) {
                    Ok(Dllp::Ack(seq)) => log::debug!("got ACK DLLP for seqno 0x{:03x}", seq),
                    Ok(Dllp::Nak(seq)) => log::debug!("got NAK DLLP for seqno 0x{:03x}", seq),
                    Ok(Dllp::FlowControl(_)) => log::debug!("got credit DLLP"),
                    Ok(Dllp::Other(ty)) => log::warn!("unknown DLLP type: {}", ty),
                    Err(_) => log::warn!("DLLP CRC mismatch, dropping"),
                }
                Ok(Received::None)
            }
            proto::PROTO_TLP => self.read_tlp_tail(&prefix),
            other => {
                self.active = false;
                Err(Error::Framing(format!("unknown transport proto byte {}", other)))
            }
        }
    }

    fn read_tlp_tail(&mut self, prefix: &[u8; 7]) -> Result<Received, Error> {
        let header_prefix: [u8; 4] = prefix[3..7].try_into().unwrap();
        let total_length = match Tlp::total_length_from_prefix(&header_prefix) {
            Ok(n) => n,
            Err(e) => {
                self.active = false;
                return Err(e);
            }
        };

        let frame_len = 1 + DL_HEADER_LEN + total_length as usize + LCRC_LEN;
        if frame_len > MAX_FRAME {
            self.active = false;
            return Err(Error::Framing("frame exceeds maximum size".into()));
        }

        let mut buf = vec![0u8; frame_len];
        buf[..7].copy_from_slice(prefix);
        let mut filled = 7;
        while filled < frame_len {
            match self.socket.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.active = false;
                    return Err(Error::Closed);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    self.active = false;
                    return Err(Error::Io(e));
                }
            }
        }

        let dl_header: [u8; 2] = buf[1..3].try_into().unwrap();
        let seq = dl_header_to_seq(dl_header);
        let covered = &buf[1..frame_len - LCRC_LEN];
        let trailer: [u8; 4] = buf[frame_len - LCRC_LEN..].try_into().unwrap();

        if !crc::tlp_lcrc32_valid(covered, trailer) {
            log::warn!("TLP LCRC mismatch for seq {}, sending NAK", seq);
            let _ = self.send_dllp(&Dllp::Nak(seq));
            return Ok(Received::None);
        }

        self.send_dllp(&Dllp::Ack(seq))?;

        let header_and_data = &buf[3..frame_len - LCRC_LEN];
        let tlp = Tlp::decode(header_and_data)?;
        Ok(Received::Tlp(tlp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A connected loopback pair, the server half wrapped as a `Connection`.
    fn make_pair() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        (Connection::new(TcpStream::from_std(server), 0), client)
    }

    #[test]
    fn dl_header_seq_roundtrip() {
        for seq in [0u16, 1, 4095, 2048, 17] {
            let h = seq_to_dl_header(seq);
            assert_eq!(dl_header_to_seq(h), seq);
        }
    }

    #[test]
    fn tag_allocator_refuses_when_exhausted() {
        let (mut conn, _peer) = make_pair();
        for _ in 0..TAG_COUNT {
            let tag = conn.alloc_tag().unwrap();
            conn.install_completion(tag, Box::new(|_, _| {}));
        }
        assert!(matches!(conn.alloc_tag(), Err(Error::TagsExhausted)));
    }

    #[test]
    fn tag_freed_after_take_completion() {
        let (mut conn, _peer) = make_pair();
        let tag = conn.alloc_tag().unwrap();
        conn.install_completion(tag, Box::new(|_, _| {}));
        assert!(conn.take_completion(tag).is_some());
        assert!(conn.take_completion(tag).is_none());
    }

    #[test]
    fn send_tlp_increments_sequence_and_not_dllp() {
        use crate::proto::tlp_type;
        let (mut conn, mut peer) = make_pair();
        let tlp = Tlp::new_request(false, tlp_type::MRD32 & 0x1F, 0, 0, 0x100, 4, vec![]);
        conn.send_tlp(&tlp).unwrap();
        assert_eq!(conn.seq, 1);
        conn.send_dllp(&Dllp::Ack(0)).unwrap();
        assert_eq!(conn.seq, 1);

        let mut buf = [0u8; 64];
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = std::io::Read::read(&mut peer, &mut buf).unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], proto::PROTO_TLP);
    }

    /// S6: a TLP delivered with a single-bit-flipped LCRC trailer is NAK'd
    /// with the received sequence number, never reaches the router, and
    /// leaves the connection active.
    #[test]
    fn corrupted_lcrc_is_nakd_and_connection_stays_active() {
        use crate::proto::tlp_type;
        use std::io::{Read as _, Write as _};

        let (mut conn, mut peer) = make_pair();
        let seq: u16 = 0x123;
        let tlp = Tlp::new_request(false, tlp_type::MRD32 & 0x1F, 0x1, 0, 0x100, 4, vec![]);

        let mut covered = Vec::new();
        covered.extend_from_slice(&seq_to_dl_header(seq));
        covered.extend_from_slice(&tlp.encode());
        let mut lcrc = crc::tlp_lcrc32(&covered);
        lcrc[0] ^= 0x01;

        let mut frame = Vec::new();
        frame.push(proto::PROTO_TLP);
        frame.extend_from_slice(&covered);
        frame.extend_from_slice(&lcrc);
        peer.write_all(&frame).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let received = conn.read_once().unwrap();
        assert!(matches!(received, Received::None));
        assert!(conn.is_active());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf[0], proto::PROTO_DLLP);
        let dllp = Dllp::decode(&buf[1..7].try_into().unwrap()).unwrap();
        assert_eq!(dllp, Dllp::Nak(seq));
    }
}
