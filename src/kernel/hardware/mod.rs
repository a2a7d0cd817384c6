//! One GPU core: register access, kernel ring, event center, power state
//! machine, interrupt handling and the hang watchdog.

pub mod cmdbuf;
pub mod dump;

use crate::error::{N2dError, N2dResult};
use crate::kernel::config::KernelConfig;
use crate::kernel::event::EventCenter;
use crate::kernel::memory::VidmemAllocator;
use crate::kernel::mmu::Mmu;
use crate::kernel::os::{self, Signal};
use crate::kernel::platform::{Platform, RegisterIo};
use crate::kernel::regs;
use cmdbuf::{CommandBuffer, CommandSubmitter, FifoEntry, SubmitContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use cmdbuf::{COMMAND_RESERVED_TAIL, FeMode, UserSpan};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Power states, ordered by wakefulness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerState {
    Off,
    Idle,
    Suspend,
    On,
}

impl PowerState {
    const fn up(self) -> Self {
        match self {
            Self::Off => Self::Idle,
            Self::Idle => Self::Suspend,
            Self::Suspend | Self::On => Self::On,
        }
    }

    const fn down(self) -> Self {
        match self {
            Self::On => Self::Suspend,
            Self::Suspend => Self::Idle,
            Self::Idle | Self::Off => Self::Off,
        }
    }
}

/// Identification reported by GET_HW_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub core: usize,
    pub chip_id: u32,
    pub chip_rev: u32,
    pub chip_date: u32,
    pub features: u32,
    pub minor_features0: u32,
    pub fe_mode: FeMode,
    pub mmu: bool,
}

#[derive(Debug, Default)]
pub struct HardwareStats {
    pub commits: AtomicU64,
    pub events: AtomicU64,
    pub interrupts: AtomicU64,
    pub dumps: AtomicU64,
    pub recoveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareStatsSnapshot {
    pub commits: u64,
    pub events: u64,
    pub interrupts: u64,
    pub dumps: u64,
    pub recoveries: u64,
}

struct Inner {
    ring: CommandBuffer,
    power: PowerState,
    /// Reset, interrupt enable and MMU enable have run since the last
    /// power cycle.
    initialized: bool,
}

pub struct Hardware {
    core: usize,
    regs: Arc<dyn RegisterIo>,
    platform: Arc<dyn Platform>,
    allocator: Arc<VidmemAllocator>,
    mmu: Arc<Mmu>,
    events: EventCenter,
    submitter: Box<dyn CommandSubmitter>,
    /// The commit mutex; also serialises power transitions.
    inner: Mutex<Inner>,
    info: HardwareInfo,
    timeout: Duration,
    recovery: bool,
    event_wait: u32,

    error_bits: AtomicU32,
    /// Posted by the ISR, consumed by the completion thread.
    semaphore: Signal,
    stopping: AtomicBool,
    stop: Signal,
    last_writes: Mutex<Option<u32>>,
    stats: HardwareStats,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("info", &self.info)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Hardware {
    /// Creates core `core` and powers it on.
    ///
    /// # Errors
    /// Ring allocation failures and power-up errors.
    pub fn new(
        core: usize,
        io: Arc<dyn RegisterIo>,
        allocator: Arc<VidmemAllocator>,
        config: &KernelConfig,
    ) -> N2dResult<Self> {
        let minor_features0 = io.peek(core, regs::CHIP_MINOR_FEATURES0);
        let fe_mode = config.fe_mode.unwrap_or(if minor_features0 & regs::MINOR0_WAIT_LINK != 0 {
            FeMode::WaitLink
        } else {
            FeMode::End
        });

        let info = HardwareInfo {
            core,
            chip_id: io.peek(core, regs::CHIP_ID),
            chip_rev: io.peek(core, regs::CHIP_REV),
            chip_date: io.peek(core, regs::CHIP_DATE),
            features: io.peek(core, regs::CHIP_FEATURES),
            minor_features0,
            fe_mode,
            mmu: !allocator.is_flat(),
        };
        log::info!(
            "gpu{core}: chip 0x{:x} rev 0x{:x}, {:?} front end, MMU {}",
            info.chip_id,
            info.chip_rev,
            fe_mode,
            if info.mmu { "on" } else { "off" }
        );

        let ring = CommandBuffer::new(&allocator, config.command_buffer_size)?;

        let hardware = Self {
            core,
            regs: io,
            platform: allocator.platform().clone(),
            mmu: allocator.mmu().clone(),
            allocator,
            events: EventCenter::new(),
            submitter: cmdbuf::submitter(fe_mode),
            inner: Mutex::new(Inner {
                ring,
                power: PowerState::Off,
                initialized: false,
            }),
            info,
            timeout: config.gpu_timeout,
            recovery: config.recovery,
            event_wait: config.event_wait,
            error_bits: AtomicU32::new(0),
            semaphore: Signal::new(false),
            stopping: AtomicBool::new(false),
            stop: Signal::new(true),
            last_writes: Mutex::new(None),
            stats: HardwareStats::default(),
        };

        hardware.set_power(PowerState::On)?;
        Ok(hardware)
    }

    #[must_use]
    pub const fn core(&self) -> usize {
        self.core
    }

    #[must_use]
    pub const fn info(&self) -> &HardwareInfo {
        &self.info
    }

    #[must_use]
    pub const fn events(&self) -> &EventCenter {
        &self.events
    }

    #[must_use]
    pub fn power_state(&self) -> PowerState {
        self.inner.lock().power
    }

    #[must_use]
    pub fn stats(&self) -> HardwareStatsSnapshot {
        HardwareStatsSnapshot {
            commits: self.stats.commits.load(Ordering::Relaxed),
            events: self.stats.events.load(Ordering::Relaxed),
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
            dumps: self.stats.dumps.load(Ordering::Relaxed),
            recoveries: self.stats.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Recently executed user spans, oldest first.
    #[must_use]
    pub fn recent_spans(&self) -> Vec<FifoEntry> {
        self.inner.lock().ring.fifo().copied().collect()
    }

    fn context(&self) -> SubmitContext<'_> {
        SubmitContext {
            core: self.core,
            regs: &*self.regs,
            timeout: self.timeout,
        }
    }

    // ===========================================================================================
    // Power management
    // ===========================================================================================

    /// Moves to `target`, passing through every intermediate state.
    ///
    /// # Errors
    /// Platform failures and FE timeouts while starting or stopping.
    pub fn set_power(&self, target: PowerState) -> N2dResult<()> {
        let mut inner = self.inner.lock();
        self.set_power_locked(&mut inner, target, false)
    }

    /// With `force`, the FE is not asked to stop; used when it is hung.
    fn set_power_locked(&self, inner: &mut Inner, target: PowerState, force: bool) -> N2dResult<()> {
        while inner.power != target {
            let next = if inner.power < target {
                inner.power.up()
            } else {
                inner.power.down()
            };
            self.transition(inner, next, force)?;
            log::info!("gpu{}: power {:?} -> {:?}", self.core, inner.power, next);
            inner.power = next;
        }
        Ok(())
    }

    fn transition(&self, inner: &mut Inner, next: PowerState, force: bool) -> N2dResult<()> {
        let core = self.core;
        match (inner.power, next) {
            (PowerState::Off, PowerState::Idle) => self.platform.set_power(core, true),
            (PowerState::Idle, PowerState::Suspend) => {
                self.platform.set_clock(core, true)?;
                if !inner.initialized {
                    self.initialize(inner)?;
                }
                Ok(())
            }
            (PowerState::Suspend, PowerState::On) => {
                self.submitter.start(&self.context(), &mut inner.ring)
            }
            (PowerState::On, PowerState::Suspend) if force => Ok(()),
            (PowerState::On, PowerState::Suspend) => {
                self.submitter.stop(&self.context(), &mut inner.ring)
            }
            (PowerState::Suspend, PowerState::Idle) => self.platform.set_clock(core, false),
            (PowerState::Idle, PowerState::Off) => self.platform.set_power(core, false),
            _ => Err(N2dError::InvalidArgument),
        }
    }

    fn initialize(&self, inner: &mut Inner) -> N2dResult<()> {
        self.platform.reset(self.core)?;
        self.regs
            .poke(self.core, regs::AQ_HI_CLOCK_CONTROL, regs::CLOCK_DEFAULT);
        self.regs.poke(self.core, regs::AQ_INTR_ENABLE, !0);

        if self.info.mmu {
            let enable = self.mmu.enable_commands()?;
            self.context().execute_physical(&mut inner.ring, &enable)?;
            self.regs
                .poke(self.core, regs::MMU_CONTROL, regs::MMU_CONTROL_ENABLE);
        }

        inner.initialized = true;
        log::debug!("gpu{}: initialized", self.core);
        Ok(())
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Executes a user span; with `flush_events` the pending event actions are
    /// attached to an event raised after it.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad span, `OutOfResources` when no event ID is
    /// free, `Timeout` when an END-mode FE does not go idle.
    pub fn commit(&self, span: &UserSpan, flush_events: bool) -> N2dResult<()> {
        self.submit(Some(span), flush_events)
    }

    /// Emits only the event marker for the pending actions.
    ///
    /// # Errors
    /// Same as [`Hardware::commit`].
    pub fn event_commit(&self) -> N2dResult<()> {
        if !self.events.has_pending() {
            return Ok(());
        }
        self.submit(None, true)
    }

    fn submit(&self, span: Option<&UserSpan>, flush_events: bool) -> N2dResult<()> {
        let address = span.map(UserSpan::gpu_address).transpose()?;
        let mut inner = self.inner.lock();
        if inner.power != PowerState::On {
            self.set_power_locked(&mut inner, PowerState::On, false)?;
        }

        let event = if flush_events {
            self.events.submit(self.event_wait)?
        } else {
            None
        };
        let flush = self.info.mmu && self.mmu.take_page_dirty();

        let result = self
            .submitter
            .commit(&self.context(), &mut inner.ring, flush, span, event);

        if let Err(e) = result {
            if flush {
                self.mmu.mark_dirty();
            }
            if matches!(e, N2dError::Timeout) {
                log::error!("gpu{}: commit timed out after {:?}", self.core, self.timeout);
                self.dump_locked(&inner);
            }
            drop(inner);
            if let Some(id) = event {
                self.events.cancel(id);
            }
            return Err(e);
        }

        if let (Some(span), Some(address)) = (span, address) {
            inner.ring.record(FifoEntry {
                address,
                size: span.size as u32,
            });
        }
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        if event.is_some() {
            self.stats.events.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ===========================================================================================
    // Interrupts
    // ===========================================================================================

    /// Top half: acknowledge, latch and wake the completion thread. Returns
    /// whether the core had anything pending.
    pub fn interrupt(&self) -> bool {
        let bits = self.regs.peek(self.core, regs::AQ_INTR_ACKNOWLEDGE);
        if bits == 0 {
            return false;
        }
        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);

        let errors = bits & (regs::INTR_MMU_EXCEPTION | regs::INTR_AXI_BUS_ERROR);
        if errors != 0 {
            self.error_bits.fetch_or(errors, Ordering::AcqRel);
        }
        self.events.raise(bits);
        self.semaphore.signal(true);
        true
    }

    /// Bottom half: reports error interrupts and completes raised events.
    /// Returns the number of events completed.
    pub fn process_interrupts(&self) -> usize {
        let errors = self.error_bits.swap(0, Ordering::AcqRel);
        if errors & regs::INTR_MMU_EXCEPTION != 0 {
            log::error!("gpu{}: MMU exception", self.core);
        }
        if errors & regs::INTR_AXI_BUS_ERROR != 0 {
            log::error!("gpu{}: AXI bus error", self.core);
        }
        if errors != 0 {
            self.dump();
        }
        self.events.notify(0)
    }

    // ===========================================================================================
    // Diagnostics and recovery
    // ===========================================================================================

    pub fn dump(&self) {
        let inner = self.inner.lock();
        self.dump_locked(&inner);
    }

    fn dump_locked(&self, inner: &Inner) {
        dump::dump_gpu_state(&*self.regs, self.core, &inner.ring);
        self.stats.dumps.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples the memory-write counter. A core with events in flight whose
    /// counter did not move since the last sample is stalled. Returns whether
    /// it was.
    ///
    /// # Errors
    /// Recovery failures.
    pub fn check_progress(&self) -> N2dResult<bool> {
        let writes = self.regs.peek(self.core, regs::HI_TOTAL_WRITES);
        let busy = self.events.in_flight() > 0;

        let stalled = {
            let mut last = self.last_writes.lock();
            let stalled = busy && *last == Some(writes);
            *last = Some(writes);
            stalled
        };

        if stalled {
            log::error!("gpu{}: no progress in {:?}", self.core, self.timeout);
            if self.recovery {
                self.recover()?;
            }
        }
        Ok(stalled)
    }

    /// Power-cycles the core, rebuilds the ring and MMU state and releases
    /// every waiter.
    ///
    /// The commit mutex is held throughout, so no submission can arm an
    /// event between the reset and the drain.
    ///
    /// # Errors
    /// `Timeout` when a commit holds the core for longer than the GPU
    /// timeout, and power-up failures.
    pub fn recover(&self) -> N2dResult<()> {
        log::warn!("gpu{}: recovering", self.core);
        let mut inner = os::acquire(&self.inner, Some(self.timeout))?;
        self.dump_locked(&inner);

        let resume = inner.power;
        self.set_power_locked(&mut inner, PowerState::Off, true)?;
        inner.initialized = false;
        inner.ring.reset();
        self.mmu.mark_dirty();

        *self.last_writes.lock() = None;
        self.error_bits.store(0, Ordering::Release);
        self.events.drain();

        self.set_power_locked(&mut inner, resume, false)?;
        drop(inner);

        self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
        log::info!("gpu{}: recovered", self.core);
        Ok(())
    }

    // ===========================================================================================
    // Worker threads
    // ===========================================================================================

    /// Starts the completion thread, plus the polling thread and the
    /// watchdog when configured.
    ///
    /// # Errors
    /// `Io` when a thread cannot be spawned.
    pub fn spawn_workers(self: &Arc<Self>, polling: bool) -> N2dResult<Vec<JoinHandle<()>>> {
        let mut workers = Vec::new();

        let hw = self.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("n2d-irq{}", self.core))
                .spawn(move || {
                    loop {
                        let _ = hw.semaphore.wait(None);
                        if hw.stopping.load(Ordering::Acquire) {
                            break;
                        }
                        hw.process_interrupts();
                    }
                })?,
        );

        if polling {
            let hw = self.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("n2d-poll{}", self.core))
                    .spawn(move || {
                        while hw.stop.wait(Some(POLL_INTERVAL)).is_err() {
                            hw.interrupt();
                        }
                    })?,
            );
        }

        if self.recovery {
            let hw = self.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("n2d-mon{}", self.core))
                    .spawn(move || {
                        while hw.stop.wait(Some(hw.timeout)).is_err() {
                            if let Err(e) = hw.check_progress() {
                                log::error!("gpu{}: recovery failed: {e}", hw.core);
                            }
                        }
                    })?,
            );
        }

        Ok(workers)
    }

    /// Asks the worker threads to exit.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.signal(true);
        self.semaphore.signal(true);
    }
}

impl Drop for Hardware {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Err(e) = self.set_power_locked(&mut inner, PowerState::Off, false) {
            log::warn!("gpu{}: power down failed: {e}", self.core);
            let _ = self.set_power_locked(&mut inner, PowerState::Off, true);
        }
        if let Err(e) = inner.ring.destroy(&self.allocator) {
            log::warn!("gpu{}: ring release failed: {e}", self.core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::event::EventAction;
    use crate::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemType};
    use crate::kernel::sim::{SimulatedGpu, SimulatedPlatform};
    use crate::utils::PAGE_SIZE;

    struct Fixture {
        gpu: Arc<SimulatedGpu>,
        platform: Arc<SimulatedPlatform>,
        allocator: Arc<VidmemAllocator>,
        hw: Arc<Hardware>,
    }

    fn fixture(config: KernelConfig) -> Fixture {
        let platform = Arc::new(SimulatedPlatform::new());
        let gpu = Arc::new(SimulatedGpu::new(1));
        let mmu = Arc::new(Mmu::new(platform.clone(), 4).unwrap());
        let allocator = Arc::new(VidmemAllocator::new(platform.clone(), mmu, None));
        let hw = Arc::new(Hardware::new(0, gpu.clone(), allocator.clone(), &config).unwrap());
        Fixture {
            gpu,
            platform,
            allocator,
            hw,
        }
    }

    fn quick() -> KernelConfig {
        KernelConfig::new().with_gpu_timeout(Duration::from_millis(20))
    }

    fn span(f: &Fixture) -> UserSpan {
        let node = f
            .allocator
            .allocate(PAGE_SIZE, 0, AllocFlags::empty(), VidmemType::Command, Pool::Default)
            .unwrap();
        f.allocator.map(1, MapFlags::GPU, &node).unwrap();
        UserSpan {
            node,
            offset: 0,
            size: 64,
        }
    }

    fn pending_signal(hw: &Hardware) -> Arc<Signal> {
        let signal = Arc::new(Signal::new(true));
        hw.events().add(EventAction::Signal(signal.clone()));
        signal
    }

    #[test]
    fn bring_up_runs_the_full_power_sequence() {
        let f = fixture(quick());
        assert_eq!(f.hw.power_state(), PowerState::On);
        assert!(f.platform.is_powered(0));
        assert!(f.platform.is_clocked(0));
        assert_eq!(f.platform.resets.load(Ordering::Relaxed), 1);
        assert_eq!(f.gpu.pokes_to(regs::MMU_CONTROL), vec![regs::MMU_CONTROL_ENABLE]);
        assert_eq!(f.hw.info().fe_mode, FeMode::WaitLink);
        assert_eq!(f.hw.info().chip_id, SimulatedGpu::CHIP_ID);

        f.hw.set_power(PowerState::Off).unwrap();
        assert!(!f.platform.is_powered(0));
        assert!(!f.platform.is_clocked(0));

        // Initialisation is not repeated by a plain power cycle.
        f.hw.set_power(PowerState::On).unwrap();
        assert_eq!(f.platform.resets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn commit_powers_up_and_records_the_span() {
        let f = fixture(quick());
        f.hw.set_power(PowerState::Idle).unwrap();
        let s = span(&f);

        f.hw.commit(&s, false).unwrap();
        assert_eq!(f.hw.power_state(), PowerState::On);
        assert_eq!(f.hw.recent_spans()[0].address, s.gpu_address().unwrap());
        assert_eq!(f.hw.stats().commits, 1);
    }

    #[test]
    fn end_mode_timeout_dumps_once() {
        let f = fixture(quick().with_fe_mode(FeMode::End));
        f.gpu.set_fe_hang(true);
        let signal = pending_signal(&f.hw);

        assert!(matches!(f.hw.commit(&span(&f), true), Err(N2dError::Timeout)));
        assert_eq!(f.hw.stats().dumps, 1);
        // The cancelled event still releases its waiter.
        assert!(signal.is_signaled());
        assert_eq!(f.hw.events().in_flight(), 0);
        f.gpu.set_fe_hang(false);
    }

    #[test]
    fn end_only_chips_select_end_mode() {
        let platform = Arc::new(SimulatedPlatform::new());
        let gpu = Arc::new(SimulatedGpu::new(1).with_minor_features(regs::MINOR0_MMU));
        let mmu = Arc::new(Mmu::new(platform.clone(), 1).unwrap());
        let allocator = Arc::new(VidmemAllocator::new(platform, mmu, None));
        let hw = Hardware::new(0, gpu, allocator, &quick()).unwrap();
        assert_eq!(hw.info().fe_mode, FeMode::End);
    }

    #[test]
    fn interrupts_complete_events() {
        let f = fixture(quick());
        let signal = pending_signal(&f.hw);
        f.hw.event_commit().unwrap();
        assert_eq!(f.hw.events().in_flight(), 1);
        assert!(!signal.is_signaled());

        f.gpu.raise_interrupt(0, regs::EVENT_MASK);
        assert!(f.hw.interrupt());
        assert_eq!(f.hw.process_interrupts(), 1);
        assert!(signal.is_signaled());
        assert!(!f.hw.interrupt());
    }

    #[test]
    fn error_interrupts_trigger_a_dump() {
        let f = fixture(quick());
        f.gpu.raise_interrupt(0, regs::INTR_AXI_BUS_ERROR);
        assert!(f.hw.interrupt());
        f.hw.process_interrupts();
        assert_eq!(f.hw.stats().dumps, 1);
    }

    #[test]
    fn stalled_core_is_recovered() {
        let f = fixture(quick());
        let signal = pending_signal(&f.hw);
        f.hw.event_commit().unwrap();

        assert!(!f.hw.check_progress().unwrap());
        f.gpu.advance_writes(0, 3);
        assert!(!f.hw.check_progress().unwrap());
        assert!(f.hw.check_progress().unwrap());

        assert!(signal.is_signaled());
        assert_eq!(f.hw.events().in_flight(), 0);
        assert_eq!(f.hw.stats().recoveries, 1);
        assert_eq!(f.platform.resets.load(Ordering::Relaxed), 2);
        assert_eq!(f.hw.power_state(), PowerState::On);

        // The ring keeps working after the power cycle.
        f.hw.commit(&span(&f), false).unwrap();
    }

    #[test]
    fn recovery_drains_events_under_the_commit_lock() {
        let f = fixture(quick().with_recovery(false));
        let weak = Arc::downgrade(&f.hw);
        let locked = Arc::new(AtomicBool::new(false));
        let seen = locked.clone();
        f.hw.events().add(EventAction::Callback(Box::new(move || {
            if let Some(hw) = weak.upgrade() {
                seen.store(hw.inner.try_lock().is_none(), Ordering::SeqCst);
            }
        })));
        f.hw.event_commit().unwrap();
        assert_eq!(f.hw.events().in_flight(), 1);

        f.hw.recover().unwrap();
        assert!(locked.load(Ordering::SeqCst));
        assert_eq!(f.hw.events().in_flight(), 0);
    }

    #[test]
    fn recovery_gives_up_on_a_held_commit_lock() {
        let f = fixture(quick().with_recovery(false));
        let guard = f.hw.inner.lock();
        assert!(matches!(f.hw.recover(), Err(N2dError::Timeout)));
        drop(guard);
        assert_eq!(f.hw.stats().recoveries, 0);
        f.hw.recover().unwrap();
    }

    #[test]
    fn idle_core_is_not_a_stall() {
        let f = fixture(quick());
        assert!(!f.hw.check_progress().unwrap());
        assert!(!f.hw.check_progress().unwrap());
    }

    #[test]
    fn polling_thread_delivers_completions() {
        let f = fixture(quick().with_recovery(false));
        let workers = f.hw.spawn_workers(true).unwrap();

        let signal = pending_signal(&f.hw);
        f.hw.event_commit().unwrap();
        f.gpu.raise_interrupt(0, regs::EVENT_MASK);
        signal.wait(Some(Duration::from_secs(2))).unwrap();

        f.hw.shutdown();
        for w in workers {
            w.join().unwrap();
        }
    }
}
