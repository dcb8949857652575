//! Turns a decoded, CRC-valid TLP into an invocation of whatever handler
//! the owning connection has registered for it: a BAR, the config-0
//! handlers, or a pending completion callback.

use crate::connection::Connection;
use crate::proto::CplStatus;
use crate::tlp::{Tlp, TlpBody, TlpKind};

/// Finds the BAR slot covering `addr`, returning its index and the
/// offset within the BAR to hand the handler.
fn match_bar(conn: &Connection, addr: u64) -> Option<(usize, u64)> {
    conn.bars.iter().enumerate().find_map(|(i, slot)| {
        let bar = slot.as_ref()?;
        if addr & !(bar.size - 1) == bar.base {
            Some((i, addr & (bar.size - 1)))
        } else {
            None
        }
    })
}

/// Dispatches `tlp`, received on `conn`, to the appropriate handler.
pub fn dispatch(conn: &mut Connection, tlp: Tlp) {
    match tlp.kind() {
        TlpKind::MemRead | TlpKind::IoRead => handle_read(conn, &tlp, true),
        TlpKind::Cfg0Read => handle_read(conn, &tlp, false),
        TlpKind::MemWrite | TlpKind::IoWrite => handle_write(conn, &tlp, true),
        TlpKind::Cfg0Write => handle_write(conn, &tlp, false),
        TlpKind::Completion => handle_completion(conn, &tlp),
        TlpKind::MemReadLocked => log::debug!("got locked read request TLP, not dispatched"),
        TlpKind::Cfg1Read | TlpKind::Cfg1Write => {
            log::warn!("type 1 configuration requests are not supported")
        }
        TlpKind::Unknown => log::warn!("unrecognized TLP (fmt, type) pair, dropping"),
    }
}

fn request_fields(tlp: &Tlp) -> (u16, u8, u8, u8, u64) {
    match tlp.body {
        TlpBody::Request {
            requester_id,
            tag,
            first_be,
            last_be,
            addr,
        } => (requester_id, tag, first_be, last_be, addr),
        TlpBody::Completion { .. } => unreachable!("request_fields called on a completion TLP"),
    }
}

fn handle_read(conn: &mut Connection, tlp: &Tlp, memory: bool) {
    let (requester_id, tag, first_be, last_be, addr) = request_fields(tlp);
    let data_dw = tlp.data_length();
    let data_bytes = match Tlp::data_length_bytes(first_be, last_be, data_dw) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("malformed read request byte-enables: {}", e);
            return;
        }
    };

    let filled = if memory {
        match match_bar(conn, addr) {
            Some((idx, offset)) => {
                let mut buf = vec![0u8; data_bytes as usize];
                let ok = match conn.bars[idx].as_mut().and_then(|b| b.read.as_mut()) {
                    Some(handler) => handler(offset, &mut buf),
                    None => {
                        log::warn!("BAR {} has no read handler registered", idx);
                        false
                    }
                };
                ok.then_some(buf)
            }
            None => {
                log::warn!("read request targets unmapped address {:#x}", addr);
                None
            }
        }
    } else {
        let mut buf = vec![0u8; data_bytes as usize];
        let ok = match conn.cfg0_read.as_mut() {
            Some(handler) => handler(addr, &mut buf),
            None => {
                log::warn!("no config-0 read handler registered");
                false
            }
        };
        ok.then_some(buf)
    };

    let (status, data) = match filled {
        Some(buf) => (CplStatus::Successful, buf),
        None => (CplStatus::UnsupportedRequest, Vec::new()),
    };

    send_completion(conn, requester_id, tag, status, (addr & 0x7F) as u8, data_bytes, data);
}

fn handle_write(conn: &mut Connection, tlp: &Tlp, memory: bool) {
    let (_requester_id, _tag, first_be, last_be, addr) = request_fields(tlp);
    let data_dw = tlp.data_length();
    let data_bytes = match Tlp::data_length_bytes(first_be, last_be, data_dw) {
        Ok(n) => n as usize,
        Err(e) => {
            log::warn!("malformed write request byte-enables: {}", e);
            return;
        }
    };
    let align = if data_bytes == 0 || first_be == 0 {
        0
    } else {
        first_be.trailing_zeros() as usize
    };
    if tlp.data.len() < align + data_bytes {
        log::warn!("write request data shorter than its byte-enables imply, dropping");
        return;
    }
    let payload = &tlp.data[align..align + data_bytes];

    if memory {
        match match_bar(conn, addr) {
            Some((idx, offset)) => match conn.bars[idx].as_mut().and_then(|b| b.write.as_mut()) {
                Some(handler) => handler(offset, payload),
                None => log::warn!("BAR {} has no write handler registered", idx),
            },
            None => log::warn!("write request targets unmapped address {:#x}", addr),
        }
    } else {
        match conn.cfg0_write.as_mut() {
            Some(handler) => handler(addr, payload),
            None => log::warn!("no config-0 write handler registered"),
        }
    }
}

/// Looks up the callback for a `CplD`/`Cpl` by tag and delivers the payload.
/// `Cpl` (no data) never reaches here with a registered callback in
/// practice, since this crate only allocates tags for reads; an empty
/// payload is still delivered faithfully if one arrives.
fn handle_completion(conn: &mut Connection, tlp: &Tlp) {
    let (status, byte_count, tag) = match tlp.body {
        TlpBody::Completion {
            status,
            byte_count,
            tag,
            ..
        } => (status, byte_count, tag),
        TlpBody::Request { .. } => unreachable!("handle_completion called on a request TLP"),
    };
    match conn.take_completion(tag) {
        Some(cb) => {
            let n = (byte_count as usize).min(tlp.data.len());
            cb(status, &tlp.data[..n]);
        }
        None => log::warn!("completion for unknown or already-delivered tag {}", tag),
    }
}

fn send_completion(
    conn: &mut Connection,
    requester_id: u16,
    tag: u8,
    status: CplStatus,
    lower_address: u8,
    byte_count: u16,
    data: Vec<u8>,
) {
    let dw_count = if byte_count == 0 {
        1
    } else {
        (byte_count as u32 + 3) / 4
    };
    let length_field = (dw_count % 1024) as u16;
    let completer_id = conn.id;
    let completion = Tlp::new_completion(
        completer_id,
        status,
        requester_id,
        tag,
        byte_count,
        lower_address,
        length_field,
        data,
    );
    if let Err(e) = conn.send_tlp(&completion) {
        log::warn!("failed to send completion: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tlp_type;
    use mio::net::TcpStream;
    use std::io::Read;

    fn make_pair() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        (Connection::new(TcpStream::from_std(server), 0), client)
    }

    /// S5 from the testable-properties scenarios: a BAR-backed read request
    /// is answered with a `CplD` carrying the handler's bytes.
    #[test]
    fn bar_dispatch_answers_with_completion_data() {
        let (mut conn, mut peer) = make_pair();
        conn.register_bar(
            0,
            0x1000,
            1024,
            Some(Box::new(|offset, buf| {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (offset as usize + i) as u8;
                }
                true
            })),
            None,
        )
        .unwrap();

        let req = Tlp::new_request(false, tlp_type::MRD64 & 0x1F, 0x1234, 3, 0x1000, 40, vec![]);
        dispatch(&mut conn, req);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], crate::proto::PROTO_TLP);
        let tlp_bytes = &buf[3..n - 4];
        let decoded = Tlp::decode(tlp_bytes).unwrap();
        match decoded.body {
            TlpBody::Completion { tag, byte_count, .. } => {
                assert_eq!(tag, 3);
                assert_eq!(byte_count, 40);
            }
            _ => panic!("expected a completion"),
        }
        assert_eq!(decoded.data, (0u8..40).collect::<Vec<u8>>());
    }

    #[test]
    fn read_to_unmapped_address_gets_unsupported_completion() {
        let (mut conn, mut peer) = make_pair();
        let req = Tlp::new_request(false, tlp_type::MRD32 & 0x1F, 0x1, 1, 0xDEAD_0000, 4, vec![]);
        dispatch(&mut conn, req);

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        let decoded = Tlp::decode(&buf[3..n - 4]).unwrap();
        match decoded.body {
            TlpBody::Completion { status, byte_count, .. } => {
                assert_eq!(status, CplStatus::UnsupportedRequest);
                assert_eq!(byte_count, 4);
            }
            _ => panic!("expected a completion"),
        }
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn write_request_invokes_handler_with_translated_offset() {
        let (mut conn, _peer) = make_pair();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        conn.register_bar(
            1,
            0x2000,
            0x1000,
            None,
            Some(Box::new(move |offset, data| {
                *seen2.borrow_mut() = Some((offset, data.to_vec()));
            })),
        )
        .unwrap();

        let req = Tlp::new_request(
            true,
            tlp_type::MWR32 & 0x1F,
            0x1,
            0,
            0x2010,
            4,
            vec![0xAA, 0xBB, 0xCC, 0xDD],
        );
        dispatch(&mut conn, req);

        let (offset, data) = seen.borrow().clone().unwrap();
        assert_eq!(offset, 0x10);
        assert_eq!(data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    /// A write whose address isn't DW-aligned carries its bytes starting at
    /// `first_be`'s alignment offset within the payload, not at byte 0 (the
    /// same placement `requester.rs::pack_write_payload` produces on send).
    /// The handler must see the real written bytes, not the leading padding.
    #[test]
    fn write_request_with_unaligned_address_skips_leading_padding() {
        let (mut conn, _peer) = make_pair();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        conn.register_bar(
            0,
            0x2000,
            0x1000,
            None,
            Some(Box::new(move |offset, data| {
                *seen2.borrow_mut() = Some((offset, data.to_vec()));
            })),
        )
        .unwrap();

        // addr 0x2003 has align=3, so a 2-byte write pads to an 8-byte DW
        // payload with the real bytes at offset 3 (as pack_write_payload
        // lays it out on the wire).
        let req = Tlp::new_request(
            true,
            tlp_type::MWR32 & 0x1F,
            0x1,
            0,
            0x2003,
            2,
            vec![0x00, 0x00, 0x00, 0xAA, 0xBB, 0x00, 0x00, 0x00],
        );
        dispatch(&mut conn, req);

        let (offset, data) = seen.borrow().clone().unwrap();
        assert_eq!(offset, 0x3);
        assert_eq!(data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn completion_delivers_to_registered_callback_and_clears_slot() {
        let (mut conn, _peer) = make_pair();
        let got = std::rc::Rc::new(std::cell::RefCell::new(None));
        let got2 = got.clone();
        let tag = conn.alloc_tag().unwrap();
        conn.install_completion(
            tag,
            Box::new(move |status, data| {
                *got2.borrow_mut() = Some((status, data.to_vec()));
            }),
        );

        let cpl = Tlp::new_completion(0x42, CplStatus::Successful, 0x1, tag, 4, 0, 1, vec![1, 2, 3, 4]);
        dispatch(&mut conn, cpl);

        let (status, data) = got.borrow().clone().unwrap();
        assert_eq!(status, CplStatus::Successful);
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert!(conn.take_completion(tag).is_none());
    }

    #[test]
    fn completion_for_unknown_tag_is_dropped_without_panic() {
        let (mut conn, _peer) = make_pair();
        let cpl = Tlp::new_completion(0x42, CplStatus::Successful, 0x1, 7, 4, 0, 1, vec![1, 2, 3, 4]);
        dispatch(&mut conn, cpl);
    }
}
