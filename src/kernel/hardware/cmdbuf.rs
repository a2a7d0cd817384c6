//! The kernel command ring and the two front-end submission models.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{N2dError, N2dResult};
use crate::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemAllocator, VidmemNode, VidmemType};
use crate::kernel::platform::RegisterIo;
use crate::kernel::regs::{self, CommandWriter};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bytes past `size` every user span must leave for the kernel's tail.
pub const COMMAND_RESERVED_TAIL: usize = 16;
/// Recently executed user spans kept for post-mortem dumps.
pub const CMD_FIFO_SIZE: usize = 8;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Front-end execution model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeMode {
    /// The FE spins on a WAIT-LINK at the ring tail and is redirected per commit.
    WaitLink,
    /// Every commit is started by register writes and runs to an END.
    End,
}

/// A user command span inside a GPU-mapped node.
#[derive(Debug, Clone)]
pub struct UserSpan {
    pub node: Arc<VidmemNode>,
    pub offset: usize,
    pub size: usize,
}

impl UserSpan {
    /// Checks the span and returns its GPU address.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty or unaligned span, one without room for
    /// the reserved tail, or a node without a GPU mapping.
    pub fn gpu_address(&self) -> N2dResult<u32> {
        if self.size == 0
            || self.offset % 8 != 0
            || self.size % 8 != 0
            || self.offset + self.size + COMMAND_RESERVED_TAIL > self.node.size()
        {
            return Err(N2dError::InvalidArgument);
        }
        let base = self.node.gpu_address().ok_or(N2dError::InvalidArgument)?;
        Ok(base + self.offset as u32)
    }

    fn write_tail(&self, words: &[u32]) -> N2dResult<()> {
        self.node.write_words(self.offset + self.size, words)
    }
}

/// An executed span as recorded for dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoEntry {
    pub address: u32,
    pub size: u32,
}

/// The per-core kernel ring.
#[derive(Debug)]
pub struct CommandBuffer {
    node: Arc<VidmemNode>,
    gpu_address: u32,
    physical: u64,
    offset: usize,
    /// Ring offset of the WAIT the FE is spinning on.
    wait_link: Option<usize>,
    fifo: VecDeque<FifoEntry>,
}

impl CommandBuffer {
    /// Allocates a contiguous ring and maps it for the kernel and the GPU.
    ///
    /// # Errors
    /// Allocation or mapping failures; on error nothing is leaked.
    pub fn new(allocator: &VidmemAllocator, size: usize) -> N2dResult<Self> {
        let node = allocator.allocate(
            size,
            0,
            AllocFlags::CONTIGUOUS,
            VidmemType::Command,
            Pool::Default,
        )?;

        if let Err(e) = allocator.map(0, MapFlags::KERNEL | MapFlags::GPU, &node) {
            allocator.release(&node)?;
            return Err(e);
        }

        let (Some(gpu_address), Some(physical)) = (node.gpu_address(), node.contiguous_base())
        else {
            allocator.unmap(0, MapFlags::KERNEL | MapFlags::GPU, &node)?;
            allocator.release(&node)?;
            return Err(N2dError::InvalidArgument);
        };

        log::debug!(
            "ring: {} bytes at GPU 0x{gpu_address:08x} phys 0x{physical:x}",
            node.size()
        );

        Ok(Self {
            node,
            gpu_address,
            physical,
            offset: 0,
            wait_link: None,
            fifo: VecDeque::with_capacity(CMD_FIFO_SIZE),
        })
    }

    /// Returns the ring's node to the allocator.
    ///
    /// # Errors
    /// Allocator failures.
    pub fn destroy(&self, allocator: &VidmemAllocator) -> N2dResult<()> {
        allocator.unmap(0, MapFlags::KERNEL | MapFlags::GPU, &self.node)?;
        allocator.release(&self.node)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.node.size()
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u32 {
        self.gpu_address
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn wait_link_offset(&self) -> Option<usize> {
        self.wait_link
    }

    #[must_use]
    pub fn fifo(&self) -> impl Iterator<Item = &FifoEntry> {
        self.fifo.iter()
    }

    #[must_use]
    pub const fn gpu_at(&self, offset: usize) -> u32 {
        self.gpu_address + offset as u32
    }

    /// Whether `address` falls inside the ring's GPU range.
    #[must_use]
    pub fn contains(&self, address: u32) -> bool {
        address >= self.gpu_address && ((address - self.gpu_address) as usize) < self.size()
    }

    /// Reads the ring word at `offset`.
    ///
    /// # Errors
    /// `InvalidArgument` past the end.
    pub fn read_word(&self, offset: usize) -> N2dResult<u32> {
        self.node.read_word(offset)
    }

    /// Claims `bytes` at the current offset, wrapping to the start when the
    /// tail is too short.
    fn reserve(&mut self, bytes: usize) -> N2dResult<usize> {
        if bytes > self.size() {
            return Err(N2dError::InvalidArgument);
        }
        if self.offset + bytes > self.size() {
            log::trace!("ring: wrap at 0x{:x}", self.offset);
            self.offset = 0;
        }
        let at = self.offset;
        self.offset += bytes;
        Ok(at)
    }

    fn write(&self, offset: usize, w: &CommandWriter) -> N2dResult<()> {
        self.node.write_words(offset, w.words())
    }

    pub(crate) fn record(&mut self, entry: FifoEntry) {
        if self.fifo.len() == CMD_FIFO_SIZE {
            self.fifo.pop_front();
        }
        self.fifo.push_back(entry);
    }

    /// Forgets the FE position, e.g. after a power cycle.
    pub(crate) fn reset(&mut self) {
        self.offset = 0;
        self.wait_link = None;
        self.fifo.clear();
    }
}

/// What a submitter needs from its core.
pub struct SubmitContext<'a> {
    pub core: usize,
    pub regs: &'a dyn RegisterIo,
    pub timeout: Duration,
}

impl SubmitContext<'_> {
    /// Points the FE at `address` and lets it fetch `prefetch` 64-bit units.
    pub fn start_fe(&self, address: u32, prefetch: u32) {
        self.regs.poke(self.core, regs::FE_CMD_BUFFER_ADDR, address);
        self.regs.poke(
            self.core,
            regs::FE_CMD_BUFFER_CTRL,
            regs::FE_CTRL_ENABLE | (prefetch & 0xFFFF),
        );
    }

    /// Polls the FE idle bit every millisecond until the timeout.
    ///
    /// # Errors
    /// `Timeout` when the FE stays busy.
    pub fn wait_fe_idle(&self) -> N2dResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.regs.peek(self.core, regs::AQ_HI_IDLE) & regs::IDLE_FE != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(N2dError::Timeout);
            }
            std::thread::sleep(IDLE_POLL);
        }
    }

    /// Runs `w` from the ring by physical address and waits for it.
    ///
    /// # Errors
    /// `NotSupported` for a ring above 4 GiB, `Timeout` from the FE.
    pub fn execute_physical(&self, ring: &mut CommandBuffer, w: &CommandWriter) -> N2dResult<()> {
        let mut fragment = w.clone();
        fragment.end();
        let at = ring.reserve(fragment.len_bytes())?;
        ring.write(at, &fragment)?;
        let address =
            u32::try_from(ring.physical + at as u64).map_err(|_| N2dError::NotSupported)?;
        self.start_fe(address, regs::prefetch_of(fragment.len_bytes()));
        self.wait_fe_idle()
    }
}

/// One of the two ways of feeding the front end.
pub trait CommandSubmitter: Send + Sync {
    fn mode(&self) -> FeMode;

    /// Brings the FE into its running state (Suspend -> On).
    fn start(&self, ctx: &SubmitContext<'_>, ring: &mut CommandBuffer) -> N2dResult<()>;

    /// Stops the FE and waits for it to go idle (On -> Suspend).
    fn stop(&self, ctx: &SubmitContext<'_>, ring: &mut CommandBuffer) -> N2dResult<()>;

    /// Stitches `span` (if any) into the execution stream, preceded by a TLB
    /// flush when `flush` is set and followed by `event` when given.
    fn commit(
        &self,
        ctx: &SubmitContext<'_>,
        ring: &mut CommandBuffer,
        flush: bool,
        span: Option<&UserSpan>,
        event: Option<u32>,
    ) -> N2dResult<()>;
}

#[must_use]
pub fn submitter(mode: FeMode) -> Box<dyn CommandSubmitter> {
    match mode {
        FeMode::WaitLink => Box::new(WaitLinkSubmitter),
        FeMode::End => Box::new(EndSubmitter),
    }
}

// ===============================================================================================
// WAIT-LINK
// ===============================================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct WaitLinkSubmitter;

impl WaitLinkSubmitter {
    /// Turns the spinning WAIT at `wait` into a LINK. The address word goes
    /// first so the FE never sees a LINK with a stale target.
    fn redirect(ring: &CommandBuffer, wait: usize, address: u32, prefetch: u32) -> N2dResult<()> {
        ring.node.write_words(wait + 4, &[address])?;
        ring.node.write_words(wait, &[regs::link(prefetch)])
    }
}

impl CommandSubmitter for WaitLinkSubmitter {
    fn mode(&self) -> FeMode {
        FeMode::WaitLink
    }

    fn start(&self, ctx: &SubmitContext<'_>, ring: &mut CommandBuffer) -> N2dResult<()> {
        let at = ring.reserve(regs::WAIT_LINK_SIZE)?;
        let mut w = CommandWriter::new();
        w.wait_link(ring.gpu_at(at));
        ring.write(at, &w)?;
        ctx.start_fe(ring.gpu_at(at), regs::prefetch_of(regs::WAIT_LINK_SIZE));
        ring.wait_link = Some(at);
        log::debug!("fe{}: spinning at 0x{:08x}", ctx.core, ring.gpu_at(at));
        Ok(())
    }

    fn stop(&self, ctx: &SubmitContext<'_>, ring: &mut CommandBuffer) -> N2dResult<()> {
        if let Some(wait) = ring.wait_link.take() {
            ring.node.write_words(wait, &[regs::OPCODE_END])?;
        }
        ctx.wait_fe_idle()
    }

    fn commit(
        &self,
        ctx: &SubmitContext<'_>,
        ring: &mut CommandBuffer,
        flush: bool,
        span: Option<&UserSpan>,
        event: Option<u32>,
    ) -> N2dResult<()> {
        let wait = ring.wait_link.ok_or(N2dError::InvalidArgument)?;
        let span_address = span.map(UserSpan::gpu_address).transpose()?;

        let prologue_at = if flush {
            Some(ring.reserve(regs::MMU_FLUSH_SIZE + regs::LINK_SIZE)?)
        } else {
            None
        };

        // Epilogue: [EVENT][WAIT][LINK -> WAIT].
        let event_bytes = if event.is_some() { regs::EVENT_SIZE } else { 0 };
        let epilogue_bytes = event_bytes + regs::WAIT_LINK_SIZE;
        let epilogue_at = ring.reserve(epilogue_bytes)?;
        let next_wait = epilogue_at + event_bytes;

        let mut epilogue = CommandWriter::new();
        if let Some(id) = event {
            epilogue.event(id);
        }
        epilogue.wait_link(ring.gpu_at(next_wait));
        ring.write(epilogue_at, &epilogue)?;

        let epilogue_gpu = ring.gpu_at(epilogue_at);
        let mut target = (epilogue_gpu, regs::prefetch_of(epilogue_bytes));

        if let (Some(span), Some(address)) = (span, span_address) {
            let mut tail = CommandWriter::new();
            tail.link(epilogue_gpu, regs::prefetch_of(epilogue_bytes));
            span.write_tail(tail.words())?;
            target = (address, regs::prefetch_of(span.size + regs::LINK_SIZE));
        }

        if let Some(at) = prologue_at {
            let mut prologue = CommandWriter::new();
            prologue.mmu_flush().link(target.0, target.1);
            ring.write(at, &prologue)?;
            target = (ring.gpu_at(at), regs::prefetch_of(prologue.len_bytes()));
        }

        Self::redirect(ring, wait, target.0, target.1)?;
        ring.wait_link = Some(next_wait);

        log::trace!(
            "fe{}: WAIT 0x{:08x} -> 0x{:08x}, next WAIT 0x{:08x}",
            ctx.core,
            ring.gpu_at(wait),
            target.0,
            ring.gpu_at(next_wait)
        );
        Ok(())
    }
}

// ===============================================================================================
// END
// ===============================================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct EndSubmitter;

impl CommandSubmitter for EndSubmitter {
    fn mode(&self) -> FeMode {
        FeMode::End
    }

    fn start(&self, _ctx: &SubmitContext<'_>, _ring: &mut CommandBuffer) -> N2dResult<()> {
        Ok(())
    }

    fn stop(&self, ctx: &SubmitContext<'_>, _ring: &mut CommandBuffer) -> N2dResult<()> {
        ctx.wait_fe_idle()
    }

    fn commit(
        &self,
        ctx: &SubmitContext<'_>,
        ring: &mut CommandBuffer,
        flush: bool,
        span: Option<&UserSpan>,
        event: Option<u32>,
    ) -> N2dResult<()> {
        let mut finish = CommandWriter::new();
        if let Some(id) = event {
            finish.event(id);
        }
        finish.end();

        let mut target = match span {
            Some(span) => {
                let address = span.gpu_address()?;
                span.write_tail(finish.words())?;
                Some((address, regs::prefetch_of(span.size + finish.len_bytes())))
            }
            None => None,
        };

        let mut head = CommandWriter::new();
        if flush {
            head.mmu_flush();
        }
        match target {
            Some((address, prefetch)) if flush => {
                head.link(address, prefetch);
            }
            Some(_) => {}
            None => {
                head.append(&finish);
            }
        }
        if !head.words().is_empty() {
            let at = ring.reserve(head.len_bytes())?;
            ring.write(at, &head)?;
            target = Some((ring.gpu_at(at), regs::prefetch_of(head.len_bytes())));
        }

        let Some((address, prefetch)) = target else {
            return Ok(());
        };
        ctx.start_fe(address, prefetch);
        ctx.wait_fe_idle()
    }
}
