use nano2d::abi::device::{Client, InProcess, Transport};
use nano2d::abi::ioctl::{Command, IoctlInterface, USER_SIGNAL_WAIT, UserSignalArgs};
use nano2d::kernel::config::KernelConfig;
use nano2d::kernel::context::Kernel;
use nano2d::kernel::hardware::cmdbuf::FeMode;
use nano2d::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemType};
use nano2d::kernel::platform::CacheOp;
use nano2d::kernel::sim::{SimulatedGpu, SimulatedPlatform};
use nano2d::utils::PAGE_SIZE;
use nano2d::{N2dError, N2dResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const PAGE: u64 = PAGE_SIZE as u64;

struct Setup {
    gpu: Arc<SimulatedGpu>,
    platform: Arc<SimulatedPlatform>,
    kernel: Arc<Kernel>,
}

impl Setup {
    fn new(config: KernelConfig) -> Self {
        let gpu = Arc::new(SimulatedGpu::new(config.cores));
        let platform = Arc::new(SimulatedPlatform::new());
        let kernel = Arc::new(Kernel::new(config, gpu.clone(), platform.clone()).unwrap());
        Self {
            gpu,
            platform,
            kernel,
        }
    }

    fn client(&self, process: u32) -> Client<InProcess> {
        let client = Client::new(InProcess::new(self.kernel.clone(), process));
        client.open().unwrap();
        client
    }
}

fn command_buffer(client: &Client<InProcess>) -> (u32, u32) {
    let handle = client
        .allocate(PAGE, 0, AllocFlags::empty(), VidmemType::Command, Pool::Default)
        .unwrap();
    let (logical, gpu) = client.map(handle, MapFlags::USER | MapFlags::GPU).unwrap();
    assert_ne!(logical, 0);
    assert_ne!(gpu, 0);
    (handle, gpu)
}

#[test]
fn commit_then_interrupt_wakes_the_user_signal() {
    let s = Setup::new(KernelConfig::new());
    let client = s.client(1);
    let (buffer, _) = command_buffer(&client);

    let signal = client.signal_create(false).unwrap();
    client.queue_signal(signal).unwrap();
    client.commit(buffer, 0, 64, true).unwrap();

    assert!(matches!(
        client.signal_wait(signal, Some(Duration::from_millis(10))),
        Err(N2dError::Timeout)
    ));

    s.gpu.raise_interrupt(0, 1);
    assert!(s.kernel.interrupt(0));
    client
        .signal_wait(signal, Some(Duration::from_secs(2)))
        .unwrap();

    let stats = s.kernel.cores()[0].stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.events, 1);
    assert_eq!(s.kernel.cores()[0].recent_spans().len(), 1);

    client.signal_destroy(signal).unwrap();
    client.free(buffer).unwrap();
    client.close().unwrap();
}

#[test]
fn end_mode_timeout_surfaces_as_invalid_argument() {
    let s = Setup::new(
        KernelConfig::new()
            .with_fe_mode(FeMode::End)
            .with_recovery(false)
            .with_gpu_timeout(Duration::from_millis(20)),
    );
    let client = s.client(1);
    assert!(client.hw_info().unwrap().end_front_end);
    let (buffer, _) = command_buffer(&client);

    s.gpu.set_fe_hang(true);
    assert!(matches!(
        client.commit(buffer, 0, 64, false),
        Err(N2dError::InvalidArgument)
    ));
    assert_eq!(s.kernel.cores()[0].stats().dumps, 1);

    s.gpu.set_fe_hang(false);
    client.commit(buffer, 0, 64, false).unwrap();
    assert_eq!(s.kernel.cores()[0].stats().dumps, 1);
}

#[test]
fn handles_are_scoped_to_their_process() {
    let s = Setup::new(KernelConfig::new());
    let first = s.client(1);
    let second = s.client(2);

    let handle = first
        .allocate(PAGE, 0, AllocFlags::CONTIGUOUS, VidmemType::Surface, Pool::Default)
        .unwrap();
    assert!(matches!(second.free(handle), Err(N2dError::NotFound)));
    assert!(matches!(
        second.map(handle, MapFlags::GPU),
        Err(N2dError::NotFound)
    ));

    let other = second
        .allocate(PAGE, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default)
        .unwrap();
    assert_ne!(other, handle);
    first.free(handle).unwrap();
    second.free(other).unwrap();
}

#[test]
fn commands_before_open_report_no_context() {
    let s = Setup::new(KernelConfig::new());
    let client = Client::new(InProcess::new(s.kernel.clone(), 9));
    assert!(matches!(
        client.allocate(PAGE, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default),
        Err(N2dError::NoContext)
    ));
    assert!(matches!(client.close(), Err(N2dError::NoContext)));
}

#[test]
fn wrapped_user_memory_can_be_exported_and_flushed() {
    let s = Setup::new(KernelConfig::new());
    let client = s.client(4);

    let handle = client.wrap_user_memory(0x1000_0800, 2 * PAGE).unwrap();
    let (_, gpu) = client.map(handle, MapFlags::GPU).unwrap();
    assert_ne!(gpu, 0);
    // The reply addresses the wrapped byte, the node its first page.
    assert_eq!(gpu % PAGE as u32, 0x800);
    let node = s.kernel.db().get_vidmem(4, handle).unwrap();
    assert_eq!(node.offset(), 0x800);
    assert_eq!(node.page_count(), 3);
    assert_eq!(node.gpu_address(), Some(gpu - 0x800));

    let fd = client.export(handle).unwrap();
    assert!(fd >= 0);

    client.cache(handle, CacheOp::Flush).unwrap();
    assert_eq!(s.platform.cache_ops.load(Ordering::Relaxed), 1);

    client.unmap(handle, MapFlags::GPU, false).unwrap();
    assert!(matches!(
        client.unmap(handle, MapFlags::GPU, false),
        Err(N2dError::InvalidArgument)
    ));
    client.free(handle).unwrap();
}

#[test]
fn without_the_mmu_only_contiguous_memory_reaches_the_gpu() {
    let s = Setup::new(KernelConfig::new().with_mmu(false));
    let client = s.client(1);
    assert!(!client.hw_info().unwrap().mmu);

    let scattered = client
        .allocate(2 * PAGE, 0, AllocFlags::NON_CONTIGUOUS, VidmemType::Generic, Pool::Default)
        .unwrap();
    assert!(matches!(
        client.map(scattered, MapFlags::GPU),
        Err(N2dError::NotSupported)
    ));

    let contiguous = client
        .allocate(2 * PAGE, 0, AllocFlags::CONTIGUOUS, VidmemType::Generic, Pool::Default)
        .unwrap();
    let (_, gpu) = client.map(contiguous, MapFlags::GPU).unwrap();
    let node = s.kernel.db().get_vidmem(1, contiguous).unwrap();
    assert_eq!(Some(u64::from(gpu)), node.contiguous_base());
}

#[test]
fn close_releases_what_the_process_leaked() {
    let s = Setup::new(KernelConfig::new());
    let client = s.client(5);
    let (buffer, _) = command_buffer(&client);
    let node = s.kernel.db().get_vidmem(5, buffer).unwrap();
    client.signal_create(true).unwrap();

    client.close().unwrap();
    assert_eq!(node.ref_count(), 0);
    assert_eq!(s.kernel.db().object_count(5), 0);
}

#[test]
fn destroy_releases_every_waiter() {
    let s = Setup::new(KernelConfig::new());
    let client = Arc::new(s.client(1));
    let handle = client.signal_create(true).unwrap();
    let signal = s.kernel.db().get_signal(1, handle).unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            std::thread::spawn(move || client.signal_wait(handle, None))
        })
        .collect();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while signal.waiter_count() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    client.signal_destroy(handle).unwrap();
    for w in waiters {
        assert!(matches!(w.join().unwrap(), Err(N2dError::Interrupted)));
    }
    assert!(matches!(
        client.signal_wait(handle, Some(Duration::ZERO)),
        Err(N2dError::NotFound)
    ));
}

#[test]
fn oversized_requests_are_rejected() {
    let s = Setup::new(KernelConfig::new());
    let client = s.client(1);
    for size in [u64::MAX, u64::MAX - PAGE, (1 << 32) + 1] {
        assert!(matches!(
            client.allocate(size, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default),
            Err(N2dError::InvalidArgument)
        ));
    }
    assert!(matches!(
        client.wrap_user_memory(u64::MAX - PAGE, 2 * PAGE),
        Err(N2dError::InvalidArgument)
    ));
    assert!(matches!(
        client.wrap_user_memory(0x1000, u64::MAX),
        Err(N2dError::InvalidArgument)
    ));
    assert_eq!(s.kernel.db().object_count(1), 0);
}

/// Replies to every command with a fixed error code.
struct Canned(i32);

impl Transport for Canned {
    fn call(&self, iface: &mut IoctlInterface) -> N2dResult<()> {
        iface.error = self.0;
        Ok(())
    }
}

#[test]
fn timeout_is_only_legitimate_for_signal_waits() {
    let client = Client::new(Canned(N2dError::Timeout.code()));
    assert!(matches!(client.free(1), Err(N2dError::InvalidArgument)));
    assert!(matches!(client.event_commit(), Err(N2dError::InvalidArgument)));
    assert!(matches!(
        client.signal_wait(1, Some(Duration::from_millis(5))),
        Err(N2dError::Timeout)
    ));

    let client = Client::new(Canned(N2dError::OutOfMemory.code()));
    assert!(matches!(
        client.allocate(PAGE, 0, AllocFlags::empty(), VidmemType::Generic, Pool::Default),
        Err(N2dError::OutOfMemory)
    ));

    let mut raw = IoctlInterface::new(Command::UserSignal);
    raw.set_user_signal(UserSignalArgs {
        op: USER_SIGNAL_WAIT,
        ..UserSignalArgs::default()
    });
    Canned(0).call(&mut raw).unwrap();
    assert_eq!(raw.error, 0);
}
