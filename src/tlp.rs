//! TLP header encode/decode and the address/byte-enable arithmetic.
//!
//! Header fields that PCIe ordering/QoS depend on (TC, TH, LN, Attr, AT, TD,
//! EP) are preserved byte-for-byte across decode/encode but are not
//! semantically interpreted — ordering and QoS enforcement are explicitly
//! out of scope. Only `fmt`, `type`, and `length` are parsed, since those
//! are the only DW0 fields any operation in this crate reads.

use crate::error::Error;
use crate::proto::{fmt, tlp_type, CplStatus};

/// What kind of transaction a decoded TLP represents, derived from its
/// `(fmt, type)` pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TlpKind {
    MemRead,
    MemWrite,
    MemReadLocked,
    IoRead,
    IoWrite,
    Cfg0Read,
    Cfg0Write,
    Cfg1Read,
    Cfg1Write,
    Completion,
    Unknown,
}

/// The non-header-common part of a TLP: either a request (memory/IO/config
/// read or write) or a completion.
#[derive(Clone, Debug)]
pub enum TlpBody {
    Request {
        requester_id: u16,
        tag: u8,
        first_be: u8,
        last_be: u8,
        /// DW-aligned address. Whether this was serialized as a 32-bit or
        /// 64-bit wire address is determined by the TLP's `fmt` DW4 bit.
        addr: u64,
    },
    Completion {
        completer_id: u16,
        status: CplStatus,
        bcm: bool,
        byte_count: u16,
        requester_id: u16,
        tag: u8,
        lower_address: u8,
    },
}

#[derive(Clone, Debug)]
pub struct Tlp {
    pub fmt: u8,
    pub ty: u8,
    /// Raw byte1 of DW0 (TC/TH/LN/Attr-hi/reserved), preserved as-is.
    flags_hi: u8,
    /// Raw top 6 bits of byte2 of DW0 (AT/Attr-lo/TD/EP), preserved as-is.
    flags_lo: u8,
    /// Raw 10-bit length field as it appears on the wire (0 means 1024 DW).
    length_field: u16,
    pub body: TlpBody,
    pub data: Vec<u8>,
}

impl Tlp {
    pub fn kind(&self) -> TlpKind {
        let has_data = self.fmt & fmt::DATA_BIT != 0;
        match (self.ty, has_data) {
            (t, _) if t == (tlp_type::CPL & 0x1F) => TlpKind::Completion,
            (0x00, false) => TlpKind::MemRead,
            (0x00, true) => TlpKind::MemWrite,
            (0x01, _) => TlpKind::MemReadLocked,
            (0x02, false) => TlpKind::IoRead,
            (0x02, true) => TlpKind::IoWrite,
            (0x04, false) => TlpKind::Cfg0Read,
            (0x04, true) => TlpKind::Cfg0Write,
            (0x05, false) => TlpKind::Cfg1Read,
            (0x05, true) => TlpKind::Cfg1Write,
            _ => TlpKind::Unknown,
        }
    }

    fn header_dw(&self) -> u8 {
        if self.fmt & fmt::DW4_BIT != 0 {
            4
        } else {
            3
        }
    }

    fn has_data(&self) -> bool {
        self.fmt & fmt::DATA_BIT != 0
    }

    /// DW count encoded in the length field, `1..=1024`.
    pub fn data_length(&self) -> u16 {
        (self.length_field.wrapping_sub(1) & 0x3FF) + 1
    }

    /// Total on-wire size of header + data, in bytes. `Err` when `fmt` is
    /// outside `{0,1,2,3}`.
    pub fn total_length(&self) -> Result<u16, Error> {
        if self.fmt > 0b011 {
            return Err(Error::Framing(format!("unsupported TLP fmt {}", self.fmt)));
        }
        let data_dw = if self.has_data() { self.data_length() } else { 0 };
        Ok((self.header_dw() as u16 + data_dw) * 4)
    }

    /// Exact byte count of a request's data transfer, from its byte-enables
    /// and DW count. `data_dw` is irrelevant for the single-DW case.
    pub fn data_length_bytes(first_be: u8, last_be: u8, data_dw: u16) -> Result<u16, Error> {
        if last_be == 0 {
            if first_be == 0 {
                return Ok(0);
            }
            return Ok(first_be.count_ones() as u16);
        }
        let total = data_dw
            .checked_mul(4)
            .ok_or_else(|| Error::Framing("data length overflow".into()))?;
        let low_zeros = first_be.trailing_zeros() as u16;
        let high_zeros = last_be
            .leading_zeros()
            .checked_sub(4)
            .ok_or_else(|| Error::Framing("invalid last_be".into()))? as u16;
        total
            .checked_sub(low_zeros)
            .and_then(|v| v.checked_sub(high_zeros))
            .ok_or_else(|| Error::Framing("non-contiguous byte-enables".into()))
    }

    /// Builds the request header fields (`fmt`'s addressing-width bit,
    /// length, first/last byte-enable, DW-aligned address) for a request of
    /// `length` bytes starting at `addr`.
    pub fn pack_request_addr(addr: u64, length: usize) -> (u8, u16, u8, u8, u64) {
        let align = (addr & 3) as u32;
        let length_with_align = length as u32 + align;
        let addr_aligned = addr & !3;

        let mut first_be = (0xFu8 << align) & 0xF;
        let mut last_be = (0xFu8 >> ((4 - (length_with_align % 4)) % 4)) & 0xF;

        if length_with_align <= 4 {
            first_be &= last_be;
            last_be = 0;
        }

        let dw_count = if length == 0 {
            first_be = 0;
            last_be = 0;
            1u32
        } else {
            (length_with_align + 3) / 4
        };
        let length_field = (dw_count % 1024) as u16;

        let fmt_dw4 = if addr_aligned < (1u64 << 32) { 0 } else { fmt::DW4_BIT };

        (fmt_dw4, length_field, first_be, last_be, addr_aligned)
    }

    /// Builds a memory/IO/config request TLP.
    #[allow(clippy::too_many_arguments)]
    pub fn new_request(
        data_present: bool,
        ty: u8,
        requester_id: u16,
        tag: u8,
        addr: u64,
        length: usize,
        data: Vec<u8>,
    ) -> Tlp {
        let (fmt_dw4, length_field, first_be, last_be, addr_aligned) =
            Self::pack_request_addr(addr, length);
        let fmt = fmt_dw4 | if data_present { fmt::DATA_BIT } else { 0 };
        Tlp {
            fmt,
            ty,
            flags_hi: 0,
            flags_lo: 0,
            length_field,
            body: TlpBody::Request {
                requester_id,
                tag,
                first_be,
                last_be,
                addr: addr_aligned,
            },
            data,
        }
    }

    /// Builds a completion TLP (`CplD` if `data` is non-empty, `Cpl`
    /// otherwise) answering a request TLP's tag/length.
    #[allow(clippy::too_many_arguments)]
    pub fn new_completion(
        completer_id: u16,
        status: CplStatus,
        requester_id: u16,
        tag: u8,
        byte_count: u16,
        lower_address: u8,
        length_field: u16,
        data: Vec<u8>,
    ) -> Tlp {
        let fmt = if data.is_empty() { 0 } else { fmt::DATA_BIT };
        Tlp {
            fmt,
            ty: tlp_type::CPL & 0x1F,
            flags_hi: 0,
            flags_lo: 0,
            length_field,
            body: TlpBody::Completion {
                completer_id,
                status,
                bcm: false,
                byte_count,
                requester_id,
                tag,
                lower_address: lower_address & 0x7F,
            },
            data,
        }
    }

    /// Address a request TLP targets, DW-aligned (low 2 bits always zero).
    pub fn request_addr(&self) -> Option<u64> {
        match self.body {
            TlpBody::Request { addr, .. } => Some(addr),
            TlpBody::Completion { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.data.len());
        out.push((self.fmt << 5) | (self.ty & 0x1F));
        out.push(self.flags_hi);
        let len_hi = ((self.length_field >> 8) & 0x3) as u8;
        out.push((self.flags_lo & 0xFC) | len_hi);
        out.push((self.length_field & 0xFF) as u8);

        match &self.body {
            TlpBody::Request {
                requester_id,
                tag,
                first_be,
                last_be,
                addr,
            } => {
                out.extend_from_slice(&requester_id.to_be_bytes());
                out.push(*tag);
                out.push(((last_be & 0xF) << 4) | (first_be & 0xF));
                if self.fmt & fmt::DW4_BIT != 0 {
                    out.extend_from_slice(&addr.to_be_bytes());
                } else {
                    out.extend_from_slice(&(*addr as u32).to_be_bytes());
                }
            }
            TlpBody::Completion {
                completer_id,
                status,
                bcm,
                byte_count,
                requester_id,
                tag,
                lower_address,
            } => {
                out.extend_from_slice(&completer_id.to_be_bytes());
                let hi = ((byte_count >> 8) & 0xF) as u8;
                out.push((status.to_bits() << 5) | ((*bcm as u8) << 4) | hi);
                out.push((byte_count & 0xFF) as u8);
                out.extend_from_slice(&requester_id.to_be_bytes());
                out.push(*tag);
                out.push(lower_address & 0x7F);
            }
        }

        out.extend_from_slice(&self.data);
        out
    }

    /// Decodes a complete TLP (header + data, no DL header / LCRC) from
    /// `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Tlp, Error> {
        if bytes.len() < 4 {
            return Err(Error::Framing("TLP header truncated".into()));
        }
        let fmt = bytes[0] >> 5;
        let ty = bytes[0] & 0x1F;
        let flags_hi = bytes[1];
        let flags_lo = bytes[2] & 0xFC;
        let length_field = (((bytes[2] & 0x3) as u16) << 8) | bytes[3] as u16;

        let header_dw = if fmt & fmt::DW4_BIT != 0 { 4usize } else { 3 };
        let header_len = header_dw * 4;
        if bytes.len() < header_len {
            return Err(Error::Framing("TLP header truncated".into()));
        }

        let is_completion = ty == (tlp_type::CPL & 0x1F);
        let body = if is_completion {
            if bytes.len() < 12 {
                return Err(Error::Framing("completion header truncated".into()));
            }
            let completer_id = u16::from_be_bytes([bytes[4], bytes[5]]);
            let status = CplStatus::from_bits(bytes[6] >> 5);
            let bcm = (bytes[6] >> 4) & 1 != 0;
            let byte_count = (((bytes[6] & 0xF) as u16) << 8) | bytes[7] as u16;
            let requester_id = u16::from_be_bytes([bytes[8], bytes[9]]);
            let tag = bytes[10];
            let lower_address = bytes[11] & 0x7F;
            TlpBody::Completion {
                completer_id,
                status,
                bcm,
                byte_count,
                requester_id,
                tag,
                lower_address,
            }
        } else {
            let requester_id = u16::from_be_bytes([bytes[4], bytes[5]]);
            let tag = bytes[6];
            let first_be = bytes[7] & 0xF;
            let last_be = (bytes[7] >> 4) & 0xF;
            let addr = if header_dw == 4 {
                u64::from_be_bytes(bytes[8..16].try_into().unwrap())
            } else {
                u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as u64
            };
            TlpBody::Request {
                requester_id,
                tag,
                first_be,
                last_be,
                addr,
            }
        };

        let data = bytes[header_len..].to_vec();

        Ok(Tlp {
            fmt,
            ty,
            flags_hi,
            flags_lo,
            length_field,
            body,
            data,
        })
    }

    /// Peeks `fmt`/`type`/`length` out of the first 4 bytes of a TLP header
    /// to compute `total_length` before the rest of the frame has arrived.
    pub fn total_length_from_prefix(prefix: &[u8; 4]) -> Result<u16, Error> {
        let fmt = prefix[0] >> 5;
        if fmt > 0b011 {
            return Err(Error::Framing(format!("unsupported TLP fmt {}", fmt)));
        }
        let has_data = fmt & fmt::DATA_BIT != 0;
        let header_dw = if fmt & fmt::DW4_BIT != 0 { 4u16 } else { 3 };
        let length_field = (((prefix[2] & 0x3) as u16) << 8) | prefix[3] as u16;
        let data_dw = if has_data {
            (length_field.wrapping_sub(1) & 0x3FF) + 1
        } else {
            0
        };
        Ok((header_dw + data_dw) * 4)
    }
}
