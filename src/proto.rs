//! Wire constants for the transport frame, DLLP, and TLP formats.

/// Transport frame discriminant: this unit is a DLLP.
pub const PROTO_DLLP: u8 = 2;
/// Transport frame discriminant: this unit is a TLP.
pub const PROTO_TLP: u8 = 3;

/// DLLP `dl_type` for ACK.
pub const DLLP_ACK: u8 = 0x00;
/// DLLP `dl_type` for NAK.
pub const DLLP_NAK: u8 = 0x10;
/// DLLP `dl_type` for a no-op keepalive, recognized but not acted on.
pub const DLLP_NOP: u8 = 0x31;

/// TLP `fmt` field values.
pub mod fmt {
    pub const DW3_NODATA: u8 = 0b000;
    pub const DW4_NODATA: u8 = 0b001;
    pub const DW3_DATA: u8 = 0b010;
    pub const DW4_DATA: u8 = 0b011;

    pub const DATA_BIT: u8 = 0b010;
    pub const DW4_BIT: u8 = 0b001;
}

/// `(fmt << 5) | type` combinations for the transaction kinds this crate
/// understands.
pub mod tlp_type {
    pub const MRD32: u8 = 0x00;
    pub const MRD64: u8 = 0x20;
    pub const MRDLK32: u8 = 0x01;
    pub const MRDLK64: u8 = 0x21;
    pub const MWR32: u8 = 0x40;
    pub const MWR64: u8 = 0x60;
    pub const IORD: u8 = 0x02;
    pub const IOWR: u8 = 0x42;
    pub const CPL: u8 = 0x0A;
    pub const CPLD: u8 = 0x4A;
    pub const CFGRD0: u8 = 0x04;
    pub const CFGWR0: u8 = 0x44;
    pub const CFGRD1: u8 = 0x05;
    pub const CFGWR1: u8 = 0x45;
}

/// Completion status codes carried in the 3-bit `c_status` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CplStatus {
    Successful,
    UnsupportedRequest,
    ConfigRequestRetry,
    CompleterAbort,
}

impl CplStatus {
    pub(crate) fn to_bits(self) -> u8 {
        match self {
            CplStatus::Successful => 0,
            CplStatus::UnsupportedRequest => 1,
            CplStatus::ConfigRequestRetry => 2,
            CplStatus::CompleterAbort => 4,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> CplStatus {
        match bits & 0x7 {
            1 => CplStatus::UnsupportedRequest,
            2 => CplStatus::ConfigRequestRetry,
            4 => CplStatus::CompleterAbort,
            _ => CplStatus::Successful,
        }
    }
}

/// Size of a DLLP on the wire: 4-byte body + 2-byte CRC-16.
pub const DLLP_WIRE_LEN: usize = 6;
/// Size of the DL header that precedes a framed TLP.
pub const DL_HEADER_LEN: usize = 2;
/// Size of the LCRC-32 trailer that follows a framed TLP.
pub const LCRC_LEN: usize = 4;
/// Max TLP payload the receive buffer is sized for.
pub const MAX_TLP_DATA: usize = 4096;
/// Max TLP header size (4DW).
pub const MAX_TLP_HEADER: usize = 16;
/// Largest possible on-wire frame: proto + DL header + header + data + LCRC.
pub const MAX_FRAME: usize = 1 + DL_HEADER_LEN + MAX_TLP_HEADER + MAX_TLP_DATA + LCRC_LEN;
