//! Public entry points for driving a `Connection` as a Requester (issuing
//! reads/writes and DLLP ACK/NAK) or wiring it up as a Completer
//! (registering BARs and config-0 handlers).

use crate::connection::{BarSlot, CompletionHandler, Connection, ReadHandler, WriteHandler};
use crate::dllp::Dllp;
use crate::error::Error;
use crate::proto::tlp_type;
use crate::tlp::Tlp;

const BAR_COUNT: usize = 6;

/// Which DLLP [`Connection::ack`] should emit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckKind {
    Ack,
    Nak,
}

/// Lays `data` into a DW-aligned payload buffer at `addr`'s byte offset
/// within its first DW, matching the placement `tlp_req_set_addr` assumes
/// on the read side.
fn pack_write_payload(addr: u64, data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let align = (addr & 3) as usize;
    let padded = ((align + data.len() + 3) / 4) * 4;
    let mut buf = vec![0u8; padded];
    buf[align..align + data.len()].copy_from_slice(data);
    buf
}

impl Connection {
    /// Registers BAR `idx` at `[base, base+size)`. `size` must be a power
    /// of two and `base` must be `size`-aligned; `idx` must not already be
    /// in use.
    pub fn register_bar(
        &mut self,
        idx: usize,
        base: u64,
        size: u64,
        read: Option<ReadHandler>,
        write: Option<WriteHandler>,
    ) -> Result<(), Error> {
        if idx >= BAR_COUNT {
            return Err(Error::InvalidBar(format!("BAR index {} out of range", idx)));
        }
        if size == 0 || !size.is_power_of_two() {
            return Err(Error::InvalidBar(format!("BAR size {} is not a power of two", size)));
        }
        if base & (size - 1) != 0 {
            return Err(Error::InvalidBar(format!(
                "BAR base {:#x} is not {}-aligned",
                base, size
            )));
        }
        if self.bars[idx].is_some() {
            return Err(Error::InvalidBar(format!("BAR {} is already registered", idx)));
        }
        self.bars[idx] = Some(BarSlot { base, size, read, write });
        Ok(())
    }

    pub fn register_cfg0_read(&mut self, handler: ReadHandler) {
        self.cfg0_read = Some(handler);
    }

    pub fn register_cfg0_write(&mut self, handler: WriteHandler) {
        self.cfg0_write = Some(handler);
    }

    /// Issues a memory read against `bar_idx` at `offset`, delivering the
    /// result to `completion_cb` once the matching `CplD` arrives.
    pub fn read(
        &mut self,
        bar_idx: usize,
        offset: u64,
        length: usize,
        completion_cb: CompletionHandler,
    ) -> Result<(), Error> {
        let base = self
            .bars
            .get(bar_idx)
            .and_then(|slot| slot.as_ref())
            .map(|bar| bar.base)
            .ok_or_else(|| Error::InvalidBar(format!("BAR {} is not registered", bar_idx)))?;
        self.issue_read(tlp_type::MRD64 & 0x1F, base + offset, length, completion_cb)
    }

    /// Issues a `CfgRd0` at `offset`, delivering the result to
    /// `completion_cb`.
    pub fn config0_read(
        &mut self,
        offset: u64,
        length: usize,
        completion_cb: CompletionHandler,
    ) -> Result<(), Error> {
        self.issue_read(tlp_type::CFGRD0 & 0x1F, offset, length, completion_cb)
    }

    fn issue_read(
        &mut self,
        ty: u8,
        addr: u64,
        length: usize,
        completion_cb: CompletionHandler,
    ) -> Result<(), Error> {
        let tag = self.alloc_tag()?;
        let tlp = Tlp::new_request(false, ty, self.id, tag, addr, length, vec![]);
        self.install_completion(tag, completion_cb);
        if let Err(e) = self.send_tlp(&tlp) {
            self.take_completion(tag);
            return Err(e);
        }
        Ok(())
    }

    /// Issues a memory write of `data` against `bar_idx` at `offset`. No
    /// completion is generated or expected.
    pub fn write(&mut self, bar_idx: usize, offset: u64, data: &[u8]) -> Result<(), Error> {
        let base = self
            .bars
            .get(bar_idx)
            .and_then(|slot| slot.as_ref())
            .map(|bar| bar.base)
            .ok_or_else(|| Error::InvalidBar(format!("BAR {} is not registered", bar_idx)))?;
        self.issue_write(tlp_type::MWR64 & 0x1F, base + offset, data)
    }

    /// Issues a `CfgWr0` of `data` at `offset`.
    pub fn config0_write(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.issue_write(tlp_type::CFGWR0 & 0x1F, offset, data)
    }

    fn issue_write(&mut self, ty: u8, addr: u64, data: &[u8]) -> Result<(), Error> {
        let payload = pack_write_payload(addr, data);
        let tlp = Tlp::new_request(true, ty, self.id, 0, addr, data.len(), payload);
        self.send_tlp(&tlp)
    }

    /// Emits a DLLP ACK or NAK carrying `seqno`.
    pub fn ack(&mut self, kind: AckKind, seqno: u16) -> Result<(), Error> {
        let dllp = match kind {
            AckKind::Ack => Dllp::Ack(seqno),
            AckKind::Nak => Dllp::Nak(seqno),
        };
        self.send_dllp(&dllp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CplStatus;
    use crate::tlp::TlpBody;
    use mio::net::TcpStream;
    use std::io::Read;

    fn make_pair() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        (Connection::new(TcpStream::from_std(server), 0x0100), client)
    }

    #[test]
    fn register_bar_rejects_non_power_of_two_size() {
        let (mut conn, _peer) = make_pair();
        assert!(matches!(
            conn.register_bar(0, 0, 1000, None, None),
            Err(Error::InvalidBar(_))
        ));
    }

    #[test]
    fn register_bar_rejects_misaligned_base() {
        let (mut conn, _peer) = make_pair();
        assert!(matches!(
            conn.register_bar(0, 0x10, 1024, None, None),
            Err(Error::InvalidBar(_))
        ));
    }

    #[test]
    fn register_bar_rejects_reused_index() {
        let (mut conn, _peer) = make_pair();
        conn.register_bar(0, 0x1000, 1024, None, None).unwrap();
        assert!(matches!(
            conn.register_bar(0, 0x2000, 1024, None, None),
            Err(Error::InvalidBar(_))
        ));
    }

    #[test]
    fn read_without_registered_bar_fails_without_touching_connection() {
        let (mut conn, _peer) = make_pair();
        let result = conn.read(0, 0, 4, Box::new(|_, _| {}));
        assert!(matches!(result, Err(Error::InvalidBar(_))));
    }

    #[test]
    fn read_composes_mrd64_request_with_tag() {
        let (mut conn, mut peer) = make_pair();
        conn.register_bar(2, 0x5000, 0x1000, None, None).unwrap();
        conn.read(2, 0x10, 16, Box::new(|_, _| {})).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        let decoded = Tlp::decode(&buf[3..n - 4]).unwrap();
        match decoded.body {
            TlpBody::Request { requester_id, addr, .. } => {
                assert_eq!(requester_id, 0x0100);
                assert_eq!(addr, 0x5010);
            }
            _ => panic!("expected a request"),
        }
    }

    #[test]
    fn write_places_data_at_alignment_offset() {
        let (mut conn, mut peer) = make_pair();
        conn.register_bar(0, 0x1000, 0x1000, None, None).unwrap();
        conn.write(0, 0x3, &[0xAA, 0xBB]).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        let decoded = Tlp::decode(&buf[3..n - 4]).unwrap();
        // addr 0x1003 has align=3, so the 2 data bytes start at byte offset 3
        // of the DW-aligned payload (spilling into a second DW).
        assert_eq!(decoded.data, vec![0x00, 0x00, 0x00, 0xAA, 0xBB, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn ack_emits_dllp_not_tlp() {
        let (mut conn, mut peer) = make_pair();
        conn.ack(AckKind::Ack, 99).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf[0], crate::proto::PROTO_DLLP);
    }

    #[test]
    fn config0_read_uses_cfgrd0_request_type() {
        let (mut conn, mut peer) = make_pair();
        conn.config0_read(0x4, 4, Box::new(|_, _| {})).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        let decoded = Tlp::decode(&buf[3..n - 4]).unwrap();
        assert_eq!(decoded.ty, tlp_type::CFGRD0 & 0x1F);
    }

    #[test]
    fn config0_write_uses_cfgwr0_request_type_and_carries_data() {
        let (mut conn, mut peer) = make_pair();
        conn.config0_write(0x8, &[1, 2, 3, 4]).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        let decoded = Tlp::decode(&buf[3..n - 4]).unwrap();
        assert_eq!(decoded.ty, tlp_type::CFGWR0 & 0x1F);
        assert_eq!(decoded.data, vec![1, 2, 3, 4]);
        let _ = CplStatus::Successful;
    }
}
