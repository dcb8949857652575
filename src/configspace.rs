//! Type 0 PCI configuration-space header (64 bytes) and BAR size-probe
//! semantics.
//!
//! Parsing a header out of an external file format (YAML or otherwise) is
//! not this crate's concern; callers build a `ConfigSpace0` field by field
//! or via [`ConfigSpace0::from_bytes`]/[`ConfigSpace0::to_bytes`] and wire
//! it up to a connection's cfg0 handlers themselves.

pub const CONFIG_SPACE_LEN: usize = 64;

/// BAR write sentinel: writing this value to a BAR register is a size
/// probe, not a registration.
pub const BAR_PROBE_VALUE: u32 = 0xFFFF_FFFF;

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigSpace0 {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision_id: u8,
    pub class_code: [u8; 3],
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub bar: [u32; 6],
    pub cardbus_cis_pointer: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom_base_address: u32,
    pub capabilities_pointer: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_gnt: u8,
    pub max_lat: u8,
}

impl Default for ConfigSpace0 {
    fn default() -> Self {
        ConfigSpace0 {
            vendor_id: 0,
            device_id: 0,
            command: 0,
            status: 0,
            revision_id: 0,
            class_code: [0; 3],
            cache_line_size: 0,
            latency_timer: 0,
            header_type: 0,
            bist: 0,
            bar: [0; 6],
            cardbus_cis_pointer: 0,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            expansion_rom_base_address: 0,
            capabilities_pointer: 0,
            interrupt_line: 0,
            interrupt_pin: 0,
            min_gnt: 0,
            max_lat: 0,
        }
    }
}

impl ConfigSpace0 {
    pub fn to_bytes(&self) -> [u8; CONFIG_SPACE_LEN] {
        let mut out = [0u8; CONFIG_SPACE_LEN];
        out[0..2].copy_from_slice(&self.vendor_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.device_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.command.to_le_bytes());
        out[6..8].copy_from_slice(&self.status.to_le_bytes());
        out[8] = self.revision_id;
        out[9..12].copy_from_slice(&self.class_code);
        out[12] = self.cache_line_size;
        out[13] = self.latency_timer;
        out[14] = self.header_type;
        out[15] = self.bist;
        for (i, bar) in self.bar.iter().enumerate() {
            out[16 + i * 4..20 + i * 4].copy_from_slice(&bar.to_le_bytes());
        }
        out[40..44].copy_from_slice(&self.cardbus_cis_pointer.to_le_bytes());
        out[44..46].copy_from_slice(&self.subsystem_vendor_id.to_le_bytes());
        out[46..48].copy_from_slice(&self.subsystem_id.to_le_bytes());
        out[48..52].copy_from_slice(&self.expansion_rom_base_address.to_le_bytes());
        out[52] = self.capabilities_pointer;
        // bytes 53..60 reserved
        out[60] = self.interrupt_line;
        out[61] = self.interrupt_pin;
        out[62] = self.min_gnt;
        out[63] = self.max_lat;
        out
    }

    pub fn from_bytes(b: &[u8; CONFIG_SPACE_LEN]) -> Self {
        let mut bar = [0u32; 6];
        for (i, slot) in bar.iter_mut().enumerate() {
            *slot = u32::from_le_bytes(b[16 + i * 4..20 + i * 4].try_into().unwrap());
        }
        ConfigSpace0 {
            vendor_id: u16::from_le_bytes([b[0], b[1]]),
            device_id: u16::from_le_bytes([b[2], b[3]]),
            command: u16::from_le_bytes([b[4], b[5]]),
            status: u16::from_le_bytes([b[6], b[7]]),
            revision_id: b[8],
            class_code: [b[9], b[10], b[11]],
            cache_line_size: b[12],
            latency_timer: b[13],
            header_type: b[14],
            bist: b[15],
            bar,
            cardbus_cis_pointer: u32::from_le_bytes(b[40..44].try_into().unwrap()),
            subsystem_vendor_id: u16::from_le_bytes([b[44], b[45]]),
            subsystem_id: u16::from_le_bytes([b[46], b[47]]),
            expansion_rom_base_address: u32::from_le_bytes(b[48..52].try_into().unwrap()),
            capabilities_pointer: b[52],
            interrupt_line: b[60],
            interrupt_pin: b[61],
            min_gnt: b[62],
            max_lat: b[63],
        }
    }

    /// Applies a BAR register write. Returns `true` if this write registered
    /// the BAR (as opposed to being a size probe or a no-op on an
    /// already-registered slot).
    pub fn write_bar(&mut self, idx: usize, value: u32, size: u32) -> bool {
        if value == BAR_PROBE_VALUE {
            return false;
        }
        if self.bar[idx] != 0 {
            return false;
        }
        self.bar[idx] = value & !(size.wrapping_sub(1));
        true
    }
}
