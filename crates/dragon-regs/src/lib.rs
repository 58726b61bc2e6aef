//! Register layer for the Dragon acquisition board.
//!
//! This crate is pure data: it knows which logical registers the FPGA exposes,
//! where each one lives in BAR0 for a given board generation, and how the
//! acquisition parameters are packed into 32-bit register words. It performs
//! no I/O.
//!
//! Board generations differ in packet geometry, limits and register layout.
//! Rather than compiling per-board variants, each generation is described by a
//! [`FamilyDescriptor`] resolved at startup:
//!
//! | Family      | Packet unit | Max frame | Bytes/buffer ceiling | Extra fields          |
//! |-------------|-------------|-----------|----------------------|-----------------------|
//! | `Legacy`    | 90          | 49140     | 32768 * 90           | switch period/auto/state |
//! | `Packet120` | 120         | 65520     | 32760 * 120          | pulse mask            |
//!
//! # Example
//!
//! ```
//! use dragon_regs::{DeviceFamily, Register};
//!
//! let desc = DeviceFamily::Legacy.descriptor();
//! assert_eq!(desc.registers.offset(Register::SubmitAddress), Some(2));
//! assert_eq!(desc.frame_length_word(49140), 8189);
//! ```

use serde::{Deserialize, Serialize};

/// Host page size assumed for DMA allocations.
pub const PAGE_SIZE: usize = 4096;

/// Largest page order a single acquisition buffer may use (1024 pages, 4 MiB).
pub const MAX_BUFFER_ORDER: u32 = 10;

/// Hard upper bound on buffers owned by one device.
pub const MAX_BUFFER_COUNT: usize = 512;

/// Largest accepted `sync_offset`, in ticks.
pub const SYNC_OFFSET_MAX: u32 = 511;

/// Largest accepted `sync_width`, in ticks.
pub const SYNC_WIDTH_MAX: u32 = 127;

/// Largest accepted legacy `switch_period`, in frames.
pub const SWITCH_PERIOD_MAX: u32 = 1 << 24;

/// Logical register index.
///
/// The core never deals with BAR offsets; it names registers by function and
/// the active [`RegisterMap`] resolves the dword offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    /// Reset line. `1` holds the acquisition core in reset.
    Reset,
    /// DMA enable. `1` lets the board write into submitted buffers.
    Enable,
    /// Write-only FIFO of bus addresses for the next buffers to fill.
    SubmitAddress,
    /// Four adjustment DAC bytes.
    Dac,
    /// Sync/channel bitfield, see [`MiscBits`].
    Misc,
    /// Legacy boards: frames between input switch toggles.
    SwitchPeriod,
    /// Packet120 boards: sync pulse mask.
    PulseMask,
    /// Packets per buffer.
    FramesPerBuffer,
    /// Encoded frame length.
    FrameLength,
    /// Board identification word.
    DeviceId,
    /// Bus address of the buffer most recently completed by the board.
    LastAddress,
}

/// Logical register → dword offset table for one board generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    entries: &'static [(Register, u32)],
}

impl RegisterMap {
    /// Builds a map from a static table.
    pub const fn new(entries: &'static [(Register, u32)]) -> Self {
        Self { entries }
    }

    /// Dword offset of `reg`, or `None` when this generation lacks it.
    #[must_use]
    pub fn offset(&self, reg: Register) -> Option<u32> {
        self.entries
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, offset)| *offset)
    }

    /// Byte offset of `reg` inside BAR0.
    #[must_use]
    pub fn byte_offset(&self, reg: Register) -> Option<usize> {
        self.offset(reg).map(|dw| (dw as usize) << 2)
    }

    /// Whether this generation implements `reg`.
    #[must_use]
    pub fn has(&self, reg: Register) -> bool {
        self.offset(reg).is_some()
    }

    /// Highest dword offset in the table; sizes the MMIO window.
    #[must_use]
    pub fn max_offset(&self) -> u32 {
        self.entries.iter().map(|(_, o)| *o).max().unwrap_or(0)
    }
}

const LEGACY_REGISTERS: &[(Register, u32)] = &[
    (Register::Reset, 0),
    (Register::Enable, 1),
    (Register::SubmitAddress, 2),
    (Register::Dac, 3),
    (Register::Misc, 4),
    (Register::SwitchPeriod, 5),
    (Register::FramesPerBuffer, 6),
    (Register::FrameLength, 7),
    (Register::DeviceId, 8),
    (Register::LastAddress, 9),
];

const PACKET120_REGISTERS: &[(Register, u32)] = &[
    (Register::Reset, 0),
    (Register::Enable, 1),
    (Register::SubmitAddress, 2),
    (Register::Dac, 3),
    (Register::Misc, 4),
    (Register::PulseMask, 5),
    (Register::FramesPerBuffer, 6),
    (Register::FrameLength, 7),
    (Register::DeviceId, 8),
    (Register::LastAddress, 9),
];

/// Board generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// Red KNJN board: 90-byte packets, input switch control.
    #[default]
    Legacy,
    /// Green board: 120-byte packets, pulse mask.
    Packet120,
}

impl DeviceFamily {
    /// Static descriptor for this generation.
    #[must_use]
    pub fn descriptor(self) -> &'static FamilyDescriptor {
        match self {
            DeviceFamily::Legacy => &LEGACY,
            DeviceFamily::Packet120 => &PACKET120,
        }
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

/// Optional parameter groups a generation supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `switch_period`, `switch_auto`, `switch_state` are meaningful.
    pub input_switch: bool,
    /// `pulse_mask` is meaningful.
    pub pulse_mask: bool,
}

/// Factory parameter values for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyDefaults {
    /// Bytes per frame.
    pub frame_length: u32,
    /// Frames the board writes into one buffer.
    pub frames_per_buffer: u32,
    /// Frames between input switch toggles; zero where unsupported.
    pub switch_period: u32,
    /// Sync pulse width, in ticks.
    pub sync_width: u32,
    /// Sync pulse mask; zero where unsupported.
    pub pulse_mask: u32,
}

/// Everything that differs between board generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyDescriptor {
    /// Generation this descriptor belongs to.
    pub family: DeviceFamily,
    /// Short name used in logs and configuration.
    pub name: &'static str,
    /// Sample bytes carried by one packet; frame lengths are multiples of it.
    pub packet_data_unit: u32,
    /// Smallest accepted `frame_length`, checked before rounding.
    pub min_frame_length: u32,
    /// Largest accepted `frame_length`.
    pub max_frame_length: u32,
    /// Largest accepted `frames_per_buffer`.
    pub max_frames_per_buffer: u32,
    /// Ceiling on `frame_length * frames_per_buffer`.
    pub max_data_in_buffer: u32,
    /// Most buffers one device may own.
    pub max_buffer_count: usize,
    /// Ticks per frame-length register unit.
    pub frame_length_divisor: u32,
    /// Optional parameter groups.
    pub capabilities: Capabilities,
    /// Factory parameter values.
    pub defaults: FamilyDefaults,
    /// Register layout.
    pub registers: RegisterMap,
}

static LEGACY: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Legacy,
    name: "legacy",
    packet_data_unit: 90,
    min_frame_length: 90,
    max_frame_length: 49140,
    max_frames_per_buffer: 32768,
    max_data_in_buffer: 32768 * 90,
    max_buffer_count: MAX_BUFFER_COUNT,
    frame_length_divisor: 6,
    capabilities: Capabilities {
        input_switch: true,
        pulse_mask: false,
    },
    defaults: FamilyDefaults {
        frame_length: 49140,
        frames_per_buffer: 60,
        switch_period: SWITCH_PERIOD_MAX,
        sync_width: 50,
        pulse_mask: 0,
    },
    registers: RegisterMap::new(LEGACY_REGISTERS),
};

static PACKET120: FamilyDescriptor = FamilyDescriptor {
    family: DeviceFamily::Packet120,
    name: "packet120",
    packet_data_unit: 120,
    min_frame_length: 120,
    max_frame_length: 65520,
    max_frames_per_buffer: 32768,
    max_data_in_buffer: 32760 * 120,
    max_buffer_count: MAX_BUFFER_COUNT,
    frame_length_divisor: 6,
    capabilities: Capabilities {
        input_switch: false,
        pulse_mask: true,
    },
    defaults: FamilyDefaults {
        frame_length: 49200,
        frames_per_buffer: 60,
        switch_period: 0,
        sync_width: 50,
        pulse_mask: 0,
    },
    registers: RegisterMap::new(PACKET120_REGISTERS),
};

impl FamilyDescriptor {
    /// Word written to [`Register::FrameLength`].
    #[must_use]
    pub fn frame_length_word(&self, frame_length: u32) -> u32 {
        (frame_length / self.frame_length_divisor).saturating_sub(1)
    }

    /// Word written to [`Register::FramesPerBuffer`]: packets per buffer.
    #[must_use]
    pub fn frames_per_buffer_word(&self, frames_per_buffer: u32, frame_length: u32) -> u32 {
        let packets =
            u64::from(frames_per_buffer) * u64::from(frame_length) / u64::from(self.packet_data_unit);
        u32::try_from(packets).unwrap_or(u32::MAX)
    }

    /// Rounds `frame_length` up to the next packet boundary, or `None` when
    /// the result does not fit in a `u32`.
    #[must_use]
    pub fn round_frame_length(&self, frame_length: u32) -> Option<u32> {
        let unit = u64::from(self.packet_data_unit);
        u32::try_from(u64::from(frame_length).div_ceil(unit) * unit).ok()
    }
}

/// Fields packed into [`Register::Misc`].
///
/// Layout, LSB first: `sync_width[6:0]`, `channel[7]`, `channel_auto[8]`,
/// `half_shift[9]`, `sync_offset[18:10]`, `switch_auto[19]`, `switch_state[20]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiscBits {
    /// Sync pulse width, bits 6:0.
    pub sync_width: u32,
    /// Manual channel select, bit 7.
    pub channel: bool,
    /// Automatic channel alternation, bit 8.
    pub channel_auto: bool,
    /// Half-sample shift, bit 9.
    pub half_shift: bool,
    /// Sync offset, bits 18:10.
    pub sync_offset: u32,
    /// Legacy automatic input switching, bit 19.
    pub switch_auto: bool,
    /// Legacy manual input switch state, bit 20.
    pub switch_state: bool,
}

impl MiscBits {
    /// Packs the fields into one register word. Out-of-range values are masked.
    #[must_use]
    pub fn pack(&self) -> u32 {
        (self.sync_width & SYNC_WIDTH_MAX)
            | (u32::from(self.channel) << 7)
            | (u32::from(self.channel_auto) << 8)
            | (u32::from(self.half_shift) << 9)
            | ((self.sync_offset & SYNC_OFFSET_MAX) << 10)
            | (u32::from(self.switch_auto) << 19)
            | (u32::from(self.switch_state) << 20)
    }

    /// Inverse of [`MiscBits::pack`].
    #[must_use]
    pub fn unpack(word: u32) -> Self {
        Self {
            sync_width: word & SYNC_WIDTH_MAX,
            channel: word & (1 << 7) != 0,
            channel_auto: word & (1 << 8) != 0,
            half_shift: word & (1 << 9) != 0,
            sync_offset: (word >> 10) & SYNC_OFFSET_MAX,
            switch_auto: word & (1 << 19) != 0,
            switch_state: word & (1 << 20) != 0,
        }
    }
}

/// Smallest page order whose allocation holds `bytes`.
#[must_use]
pub fn page_order(bytes: usize) -> u32 {
    let pages = bytes.div_ceil(PAGE_SIZE).max(1);
    pages.next_power_of_two().trailing_zeros()
}

/// Byte length of an allocation of `order` pages.
#[must_use]
pub fn order_bytes(order: u32) -> usize {
    PAGE_SIZE << order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_register_layout() {
        let map = DeviceFamily::Legacy.descriptor().registers;
        assert_eq!(map.offset(Register::Reset), Some(0));
        assert_eq!(map.offset(Register::FrameLength), Some(7));
        assert_eq!(map.byte_offset(Register::SubmitAddress), Some(8));
        assert!(map.has(Register::SwitchPeriod));
        assert!(!map.has(Register::PulseMask));
        assert_eq!(map.max_offset(), 9);
    }

    #[test]
    fn test_packet120_swaps_switch_for_pulse_mask() {
        let map = DeviceFamily::Packet120.descriptor().registers;
        assert!(!map.has(Register::SwitchPeriod));
        assert_eq!(map.offset(Register::PulseMask), Some(5));
    }

    #[test]
    fn test_misc_packing_matches_fpga_layout() {
        let bits = MiscBits {
            sync_width: 50,
            channel: true,
            channel_auto: false,
            half_shift: true,
            sync_offset: 3,
            switch_auto: false,
            switch_state: false,
        };
        assert_eq!(bits.pack(), 50 | (1 << 7) | (1 << 9) | (3 << 10));
        assert_eq!(MiscBits::unpack(bits.pack()), bits);
    }

    #[test]
    fn test_misc_masks_oversized_fields() {
        let bits = MiscBits {
            sync_width: 0xFF,
            sync_offset: 0x3FF,
            ..Default::default()
        };
        let word = bits.pack();
        assert_eq!(word & 0x7F, 0x7F);
        assert_eq!(word & (1 << 7), 0);
        assert_eq!((word >> 10) & 0x1FF, 0x1FF);
        assert_eq!(word & (1 << 19), 0);
    }

    #[test]
    fn test_geometry_words() {
        let desc = DeviceFamily::Legacy.descriptor();
        assert_eq!(desc.frame_length_word(90), 14);
        assert_eq!(desc.frames_per_buffer_word(60, 49140), 60 * 49140 / 90);
        assert_eq!(desc.round_frame_length(91), Some(180));
        assert_eq!(desc.round_frame_length(90), Some(90));
    }

    #[test]
    fn test_round_frame_length_near_u32_max() {
        let desc = DeviceFamily::Legacy.descriptor();
        assert_eq!(desc.round_frame_length(u32::MAX), None);
        let top = u32::MAX / 90 * 90;
        assert_eq!(desc.round_frame_length(top), Some(top));
        assert_eq!(
            DeviceFamily::Packet120.descriptor().round_frame_length(u32::MAX - 10),
            None
        );
    }

    #[test]
    fn test_page_order() {
        assert_eq!(page_order(1), 0);
        assert_eq!(page_order(PAGE_SIZE), 0);
        assert_eq!(page_order(PAGE_SIZE + 1), 1);
        assert_eq!(page_order(60 * 49140), 10);
        assert_eq!(order_bytes(10), 4 * 1024 * 1024);
    }

    #[test]
    fn test_defaults_fit_their_family() {
        for family in [DeviceFamily::Legacy, DeviceFamily::Packet120] {
            let d = family.descriptor();
            assert_eq!(d.defaults.frame_length % d.packet_data_unit, 0);
            assert!(d.defaults.frame_length <= d.max_frame_length);
            assert!(d.defaults.frame_length * d.defaults.frames_per_buffer <= d.max_data_in_buffer);
        }
    }

    #[test]
    fn test_family_serde_names() {
        let json = serde_json::to_string(&DeviceFamily::Packet120).unwrap();
        assert_eq!(json, "\"packet120\"");
        let family: DeviceFamily = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(family, DeviceFamily::Legacy);
    }
}
