//! ACK/NAK data link layer packet encode/decode.
//!
//! A DLLP body is 4 bytes: `dl_type`, a full reserved byte, then the 16-bit
//! sequence number being acknowledged, big-endian. It is followed by a
//! 2-byte CRC-16 trailer.

use crate::crc;
use crate::error::Error;
use crate::proto::{DLLP_ACK, DLLP_NAK, DLLP_NOP};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dllp {
    Ack(u16),
    Nak(u16),
    /// A VC flow-control update (InitFC1/InitFC2/UpdateFC for the header or
    /// data credit class). Accepted for diagnostics only; this crate does
    /// not meter credits.
    FlowControl(u8),
    /// Recognized but otherwise ignored: keepalives and anything else this
    /// crate doesn't act on.
    Other(u8),
}

/// `dl_type`'s top two bits are `fc_type` and bit 3 is `fc_rsvd1` when the
/// byte is read as a flow-control header rather than an ACK/NAK discriminant
/// (`pcie_dllp.dl_fc` in the reference layout). A flow-control DLLP is any
/// `dl_type` with a nonzero `fc_type` and a zero `fc_rsvd1`.
fn is_flow_control(dl_type: u8) -> bool {
    let fc_type = (dl_type >> 6) & 0x3;
    let fc_rsvd1 = (dl_type >> 3) & 0x1;
    fc_type != 0 && fc_rsvd1 == 0
}

impl Dllp {
    fn body(&self) -> [u8; 4] {
        match *self {
            Dllp::Ack(seq) => {
                let s = seq.to_be_bytes();
                [DLLP_ACK, s[0], s[1], 0]
            }
            Dllp::Nak(seq) => {
                let s = seq.to_be_bytes();
                [DLLP_NAK, s[0], s[1], 0]
            }
            Dllp::FlowControl(ty) | Dllp::Other(ty) => [ty, 0, 0, 0],
        }
    }

    /// Encodes the 4-byte body plus its CRC-16 trailer: 6 bytes total.
    pub fn encode(&self) -> [u8; 6] {
        let body = self.body();
        let trailer = crc::dllp_crc16(&body);
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&body);
        out[4..].copy_from_slice(&trailer);
        out
    }

    /// Decodes a 6-byte DLLP (body + CRC-16), verifying the trailer.
    pub fn decode(bytes: &[u8; 6]) -> Result<Dllp, Error> {
        let body: [u8; 4] = bytes[..4].try_into().unwrap();
        let trailer: [u8; 2] = bytes[4..].try_into().unwrap();
        if !crc::dllp_crc16_valid(&body, trailer) {
            return Err(Error::Crc);
        }
        let seq = u16::from_be_bytes([body[1], body[2]]);
        Ok(match body[0] {
            DLLP_ACK => Dllp::Ack(seq),
            DLLP_NAK => Dllp::Nak(seq),
            other if is_flow_control(other) => Dllp::FlowControl(other),
            other => Dllp::Other(other),
        })
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Dllp::Other(ty) if *ty == DLLP_NOP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_encodes_s1_scenario_bytes() {
        // dl_type=ACK, seqno=1234 (0x04D2), reserved trailer byte zero.
        let dllp = Dllp::Ack(1234);
        let body = dllp.body();
        assert_eq!(body, [0x00, 0x04, 0xD2, 0x00]);
    }

    #[test]
    fn ack_roundtrip() {
        let dllp = Dllp::Ack(1234);
        let wire = dllp.encode();
        assert_eq!(Dllp::decode(&wire).unwrap(), dllp);
    }

    #[test]
    fn nak_roundtrip() {
        let dllp = Dllp::Nak(7);
        let wire = dllp.encode();
        assert_eq!(Dllp::decode(&wire).unwrap(), dllp);
    }

    #[test]
    fn corrupt_crc_rejected() {
        let dllp = Dllp::Ack(42);
        let mut wire = dllp.encode();
        wire[0] ^= 0xFF;
        assert!(matches!(Dllp::decode(&wire), Err(Error::Crc)));
    }

    #[test]
    fn flow_control_type_recognized() {
        // fc_type=0b01 (bits 7:6), fc_rsvd1=0 (bit 3): an InitFC1 header credit update.
        let dllp = Dllp::decode(&Dllp::FlowControl(0x40).encode()).unwrap();
        assert!(matches!(dllp, Dllp::FlowControl(0x40)));
    }

    #[test]
    fn nop_recognized_as_other() {
        let dllp = Dllp::Other(DLLP_NOP);
        assert!(dllp.is_nop());
        let wire = dllp.encode();
        assert_eq!(Dllp::decode(&wire).unwrap(), Dllp::Other(DLLP_NOP));
    }
}
