//! Register offsets and front-end command encoding for the GC820 2D core.
//!
//! Offsets are byte offsets into the core's register window. Command words are
//! 32-bit little-endian and every command occupies a multiple of 8 bytes.

// ===============================================================================================
// Host interface
// ===============================================================================================

pub const AQ_HI_CLOCK_CONTROL: u32 = 0x0000;
pub const AQ_HI_IDLE: u32 = 0x0004;
pub const AQ_INTR_ACKNOWLEDGE: u32 = 0x0010;
pub const AQ_INTR_ENABLE: u32 = 0x0014;
pub const CHIP_FEATURES: u32 = 0x001C;
pub const CHIP_ID: u32 = 0x0020;
pub const CHIP_REV: u32 = 0x0024;
pub const CHIP_DATE: u32 = 0x0028;
pub const CHIP_MINOR_FEATURES0: u32 = 0x0034;
/// Running count of AXI write bursts, sampled by the hang monitor.
pub const HI_TOTAL_WRITES: u32 = 0x0044;

/// Clock control value written at power-on.
pub const CLOCK_DEFAULT: u32 = 0x0007_0100;

/// `AQ_HI_IDLE` bit reporting the front end as idle.
pub const IDLE_FE: u32 = 1 << 0;
/// All modules idle.
pub const IDLE_ALL: u32 = 0x7FFF_FFFF;

/// Minor feature bit: the front end supports the WAIT/LINK loop.
pub const MINOR0_WAIT_LINK: u32 = 1 << 2;
/// Minor feature bit: the core has an MMU.
pub const MINOR0_MMU: u32 = 1 << 5;

// ===============================================================================================
// Interrupts
// ===============================================================================================

/// Number of event IDs the front end can raise.
pub const EVENT_COUNT: usize = 29;
pub const EVENT_MASK: u32 = (1 << EVENT_COUNT) - 1;
pub const INTR_MMU_EXCEPTION: u32 = 1 << 30;
pub const INTR_AXI_BUS_ERROR: u32 = 1 << 31;

// ===============================================================================================
// Front end
// ===============================================================================================

pub const FE_CMD_BUFFER_ADDR: u32 = 0x0654;
pub const FE_CMD_BUFFER_CTRL: u32 = 0x0658;
pub const FE_DEBUG_STATE: u32 = 0x0660;
pub const FE_DEBUG_CUR_CMD_ADDR: u32 = 0x0664;
pub const FE_DEBUG_CMD_LOW: u32 = 0x0668;

/// Enable bit of `FE_CMD_BUFFER_CTRL`; the low 16 bits are the prefetch count.
pub const FE_CTRL_ENABLE: u32 = 1 << 16;

pub const MMU_CONTROL: u32 = 0x0388;
pub const MMU_CONTROL_ENABLE: u32 = 1 << 0;

// ===============================================================================================
// Debug signatures
// ===============================================================================================

pub const DEBUG_CONTROL0: u32 = 0x0470;
pub const DEBUG_CONTROL1: u32 = 0x0474;
pub const DEBUG_CONTROL2: u32 = 0x0478;

/// A functional block whose debug signatures are captured on a GPU dump.
#[derive(Debug, Clone, Copy)]
pub struct DebugBlock {
    pub name: &'static str,
    pub select_reg: u32,
    pub select_shift: u32,
    pub data_reg: u32,
    pub count: u32,
}

pub const DEBUG_BLOCKS: [DebugBlock; 10] = [
    DebugBlock { name: "RA", select_reg: DEBUG_CONTROL1, select_shift: 16, data_reg: 0x0448, count: 16 },
    DebugBlock { name: "TX", select_reg: DEBUG_CONTROL1, select_shift: 24, data_reg: 0x044C, count: 16 },
    DebugBlock { name: "FE", select_reg: DEBUG_CONTROL0, select_shift: 0, data_reg: 0x0450, count: 16 },
    DebugBlock { name: "PE", select_reg: DEBUG_CONTROL0, select_shift: 16, data_reg: 0x0454, count: 16 },
    DebugBlock { name: "DE", select_reg: DEBUG_CONTROL0, select_shift: 8, data_reg: 0x0458, count: 16 },
    DebugBlock { name: "SH", select_reg: DEBUG_CONTROL0, select_shift: 24, data_reg: 0x045C, count: 16 },
    DebugBlock { name: "PA", select_reg: DEBUG_CONTROL1, select_shift: 0, data_reg: 0x0460, count: 16 },
    DebugBlock { name: "SE", select_reg: DEBUG_CONTROL1, select_shift: 8, data_reg: 0x0464, count: 16 },
    DebugBlock { name: "MC", select_reg: DEBUG_CONTROL2, select_shift: 0, data_reg: 0x0468, count: 16 },
    DebugBlock { name: "HI", select_reg: DEBUG_CONTROL2, select_shift: 8, data_reg: 0x046C, count: 16 },
];

// ===============================================================================================
// Command stream
// ===============================================================================================

pub const OPCODE_MASK: u32 = 0xF800_0000;
pub const OPCODE_LOAD_STATE: u32 = 0x0800_0000;
pub const OPCODE_END: u32 = 0x1000_0000;
pub const OPCODE_WAIT: u32 = 0x3800_0000;
pub const OPCODE_LINK: u32 = 0x4000_0000;
pub const OPCODE_STALL: u32 = 0x4800_0000;

/// State addresses (register offset / 4) written through LOAD_STATE.
pub const STATE_EVENT: u32 = 0x0E01;
pub const STATE_SEMAPHORE: u32 = 0x0E02;
pub const STATE_FLUSH: u32 = 0x0E03;
pub const STATE_MMU_CONFIG: u32 = 0x0061;
pub const STATE_MMU_SAFE_ADDRESS: u32 = 0x0062;
pub const STATE_MMU_FLUSH: u32 = 0x0063;

pub const EVENT_FROM_PE: u32 = 1 << 6;
pub const FLUSH_PE2D: u32 = 1 << 3;
pub const MMU_FLUSH_ALL: u32 = 0x10;
pub const MMU_CONFIG_MODE_4K: u32 = 0x1;
/// Semaphore token FE -> PE.
pub const SEMAPHORE_FE_TO_PE: u32 = 0x01 | (0x07 << 8);

/// Cycles the front end idles in a WAIT before re-fetching the LINK.
pub const WAIT_CYCLES: u32 = 200;

/// Bytes in a WAIT + LINK pair.
pub const WAIT_LINK_SIZE: usize = 16;
pub const LINK_SIZE: usize = 8;
pub const END_SIZE: usize = 8;
pub const EVENT_SIZE: usize = 8;
/// Pipe flush, MMU flush and the FE->PE semaphore stall.
pub const MMU_FLUSH_SIZE: usize = 32;

#[must_use]
pub const fn load_state(state: u32, count: u32) -> u32 {
    OPCODE_LOAD_STATE | ((count & 0x3FF) << 16) | (state & 0xFFFF)
}

#[must_use]
pub const fn wait(cycles: u32) -> u32 {
    OPCODE_WAIT | (cycles & 0xFFFF)
}

/// LINK command word; `prefetch` is counted in 64-bit units.
#[must_use]
pub const fn link(prefetch: u32) -> u32 {
    OPCODE_LINK | (prefetch & 0xFFFF)
}

#[must_use]
pub const fn opcode(word: u32) -> u32 {
    word & OPCODE_MASK
}

/// Prefetch count for a run of `bytes`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn prefetch_of(bytes: usize) -> u32 {
    bytes.div_ceil(8) as u32
}

/// Appends command words to a fragment being assembled in host memory.
#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    words: Vec<u32>,
}

impl CommandWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn load_state(&mut self, state: u32, value: u32) -> &mut Self {
        self.words.extend_from_slice(&[load_state(state, 1), value]);
        self
    }

    pub fn event(&mut self, id: u32) -> &mut Self {
        self.load_state(STATE_EVENT, (id & 0x1F) | EVENT_FROM_PE)
    }

    pub fn semaphore_stall(&mut self) -> &mut Self {
        self.load_state(STATE_SEMAPHORE, SEMAPHORE_FE_TO_PE);
        self.words.extend_from_slice(&[OPCODE_STALL, SEMAPHORE_FE_TO_PE]);
        self
    }

    /// Pipe flush followed by an MMU TLB flush, fenced by a semaphore stall.
    pub fn mmu_flush(&mut self) -> &mut Self {
        self.load_state(STATE_FLUSH, FLUSH_PE2D);
        self.load_state(STATE_MMU_FLUSH, MMU_FLUSH_ALL);
        self.semaphore_stall()
    }

    pub fn link(&mut self, address: u32, prefetch: u32) -> &mut Self {
        self.words.extend_from_slice(&[link(prefetch), address]);
        self
    }

    /// WAIT followed by a LINK back to the WAIT at `self_address`.
    pub fn wait_link(&mut self, self_address: u32) -> &mut Self {
        self.words.extend_from_slice(&[
            wait(WAIT_CYCLES),
            0,
            link(prefetch_of(WAIT_LINK_SIZE)),
            self_address,
        ]);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.words.extend_from_slice(&[OPCODE_END, 0]);
        self
    }

    pub fn append(&mut self, other: &Self) -> &mut Self {
        self.words.extend_from_slice(&other.words);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_sizes_match_constants() {
        let mut w = CommandWriter::new();
        w.mmu_flush();
        assert_eq!(w.len_bytes(), MMU_FLUSH_SIZE);

        let mut w = CommandWriter::new();
        w.wait_link(0x1000);
        assert_eq!(w.len_bytes(), WAIT_LINK_SIZE);
        assert_eq!(opcode(w.words()[0]), OPCODE_WAIT);
        assert_eq!(opcode(w.words()[2]), OPCODE_LINK);
        assert_eq!(w.words()[3], 0x1000);

        let mut w = CommandWriter::new();
        w.event(3).end();
        assert_eq!(w.len_bytes(), EVENT_SIZE + END_SIZE);
        assert_eq!(w.words()[1] & 0x1F, 3);
    }

    #[test]
    fn debug_blocks_are_unique() {
        let mut regs: Vec<u32> = DEBUG_BLOCKS.iter().map(|b| b.data_reg).collect();
        regs.sort_unstable();
        regs.dedup();
        assert_eq!(regs.len(), DEBUG_BLOCKS.len());
    }
}
