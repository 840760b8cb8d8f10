//! Shared-memory layout of the firmware interface.
//!
//! Everything the host touches on the chip lives behind the byte bus: a status block the
//! firmware keeps current, the Tx result table, the command mailbox, the Tx data path
//! FIFO and a small register window for doorbells. All multi-byte fields are
//! little-endian on the wire.

use macro_bits::bit;

use crate::hwq::NUM_CLASSES;

/// Address of the combined interrupt-status register and firmware status block.
pub const FW_STATUS: u32 = 0x0001_4FC0;
/// Address of the Tx result table (counters plus cyclic entry queue).
pub const TX_RESULT_IF: u32 = 0x0001_5000;
/// Address of the command mailbox (header plus payload).
pub const CMD_MAILBOX: u32 = 0x0001_5800;
/// Fixed data-path address packet writes are bound to.
pub const DATA_PATH: u32 = 0x0002_0000;
/// Address of the shipped-descriptor counter mirrored to the firmware.
pub const HOST_DESC_COUNT: u32 = 0x0002_FC00;
/// Interrupt trigger register in the register window.
pub const REG_INTR_TRIG: u32 = 0x0003_0008;

/// The firmware watchdog expired.
pub const INTR_WATCHDOG: u32 = bit!(0);
/// Firmware finished booting.
pub const INTR_INIT_COMPLETE: u32 = bit!(1);
/// A mailbox command was answered.
pub const INTR_CMD_COMPLETE: u32 = bit!(2);
/// Event mailbox slot A has data.
pub const INTR_EVENT_A: u32 = bit!(3);
/// Event mailbox slot B has data.
pub const INTR_EVENT_B: u32 = bit!(4);
/// Shared data-path bit: RX frames, freed Tx blocks or Tx results.
pub const INTR_DATA: u32 = bit!(5);

/// Events the host reacts to before the firmware has fully booted.
pub const INTR_SCOPE_INIT: u32 = INTR_WATCHDOG | INTR_INIT_COMPLETE | INTR_CMD_COMPLETE;
/// All events the host reacts to during normal operation.
pub const INTR_SCOPE_ALL: u32 =
    INTR_SCOPE_INIT | INTR_EVENT_A | INTR_EVENT_B | INTR_DATA;

/// Value written to [REG_INTR_TRIG] to ring the command doorbell.
pub const INTR_TRIG_CMD: u32 = bit!(0);

/// Length of the combined status read: 4 bytes of interrupt vector, 64 bytes of status.
pub const FW_STATUS_LEN: usize = 68;

const STATUS_LOCALTIME: usize = 4;
const STATUS_TX_RESULT_COUNTER: usize = 8;
const STATUS_TX_DESCR_COUNTER: usize = 9;
const STATUS_FREED_BLOCKS: usize = 12;

/// Writes on the bus must be padded to this many bytes.
pub const BUS_ALIGN: usize = 4;

/// Round `len` up to the bus write alignment.
pub(crate) const fn pad_len(len: usize) -> usize {
    (len + BUS_ALIGN - 1) & !(BUS_ALIGN - 1)
}

#[inline]
pub(crate) fn le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// One cycle's snapshot of the firmware status block.
///
/// The interrupt-status register is clear-on-read, so a snapshot can only be taken once
/// per read and is handed around by value afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwStatus {
    /// Raw interrupt vector, not yet masked.
    pub intr: u32,
    /// Firmware local clock in microseconds.
    pub fw_localtime: u32,
    /// Wrapping count of Tx results the firmware has produced.
    pub tx_result_counter: u8,
    /// Wrapping count of Tx descriptors the firmware has consumed.
    pub tx_descr_counter: u8,
    /// Accumulated freed-block counters, one per access class.
    pub freed_blocks: [u32; NUM_CLASSES],
}
impl FwStatus {
    /// Decode a raw status read.
    pub fn parse(buf: &[u8; FW_STATUS_LEN]) -> Self {
        let mut freed_blocks = [0u32; NUM_CLASSES];
        let mut class = 0;
        while class < NUM_CLASSES {
            freed_blocks[class] = le32(buf, STATUS_FREED_BLOCKS + class * 4);
            class += 1;
        }
        Self {
            intr: le32(buf, 0),
            fw_localtime: le32(buf, STATUS_LOCALTIME),
            tx_result_counter: buf[STATUS_TX_RESULT_COUNTER],
            tx_descr_counter: buf[STATUS_TX_DESCR_COUNTER],
            freed_blocks,
        }
    }
}
