use super::cmdbuf::CommandBuffer;
use crate::kernel::platform::RegisterIo;
use crate::kernel::regs::{self, DebugBlock};
use std::fmt::Write as _;

/// Ring words logged on either side of the FE's current address.
const RING_WINDOW: usize = 8;

/// Reads the `count` signatures of one debug block.
pub fn block_signatures(io: &dyn RegisterIo, core: usize, block: &DebugBlock) -> Vec<u32> {
    let signatures = (0..block.count)
        .map(|i| {
            io.poke(core, block.select_reg, i << block.select_shift);
            io.peek(core, block.data_reg)
        })
        .collect();
    io.poke(core, block.select_reg, 0);
    signatures
}

/// Logs the front-end state, block signatures, recent spans and the ring
/// around the FE position.
pub fn dump_gpu_state(io: &dyn RegisterIo, core: usize, ring: &CommandBuffer) {
    let state = io.peek(core, regs::FE_DEBUG_STATE);
    let current = io.peek(core, regs::FE_DEBUG_CUR_CMD_ADDR);
    let low = io.peek(core, regs::FE_DEBUG_CMD_LOW);
    let idle = io.peek(core, regs::AQ_HI_IDLE);

    log::error!("gpu{core}: **** GPU STATE DUMP ****");
    log::error!(
        "gpu{core}: idle 0x{idle:08x} FE state 0x{state:08x} addr 0x{current:08x} cmd 0x{low:08x}"
    );

    for block in &regs::DEBUG_BLOCKS {
        let mut line = String::new();
        for sig in block_signatures(io, core, block) {
            let _ = write!(line, " {sig:08x}");
        }
        log::error!("gpu{core}: {}:{line}", block.name);
    }

    for (i, span) in ring.fifo().enumerate() {
        log::error!(
            "gpu{core}: fifo[{i}] 0x{:08x} +{}",
            span.address,
            span.size
        );
    }

    if ring.contains(current) {
        let at = ((current - ring.gpu_address()) as usize) & !3;
        let start = at.saturating_sub(RING_WINDOW * 4);
        let end = (at + RING_WINDOW * 4).min(ring.size());
        let mut line = String::new();
        for offset in (start..end).step_by(4) {
            if let Ok(word) = ring.read_word(offset) {
                let mark = if offset == at { '>' } else { ' ' };
                let _ = write!(line, "{mark}{word:08x}");
            }
        }
        log::error!("gpu{core}: ring @0x{:08x}:{line}", ring.gpu_at(start));
    } else {
        log::error!("gpu{core}: FE outside the kernel ring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sim::SimulatedGpu;

    #[test]
    fn signature_reads_walk_the_selector() {
        let gpu = SimulatedGpu::new(1);
        let block = &regs::DEBUG_BLOCKS[3];
        gpu.set_register(0, block.data_reg, 0xABCD);

        let sigs = block_signatures(&gpu, 0, block);
        assert_eq!(sigs.len(), block.count as usize);
        assert!(sigs.iter().all(|&s| s == 0xABCD));

        let selects = gpu.pokes_to(block.select_reg);
        assert_eq!(selects[1], 1 << block.select_shift);
        assert_eq!(selects.last(), Some(&0));
    }
}
