use nano2d::abi::device::{Client, InProcess};
use nano2d::kernel::config::KernelConfig;
use nano2d::kernel::context::Kernel;
use nano2d::kernel::memory::{AllocFlags, MapFlags, Pool, VidmemType};
use nano2d::kernel::sim::{SimulatedGpu, SimulatedPlatform};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Nano2D submission on the simulator ===");

    let params = std::env::args().nth(1).unwrap_or_default();
    let config = KernelConfig::from_params(&params)?;
    let gpu = Arc::new(SimulatedGpu::new(config.cores));
    let kernel = Arc::new(Kernel::new(config, gpu.clone(), Arc::new(SimulatedPlatform::new()))?);
    println!("[+] Kernel up: {} core(s)", kernel.cores().len());

    let client = Client::new(InProcess::new(kernel.clone(), 1));
    client.open()?;
    let info = client.hw_info()?;
    println!(
        "    chip 0x{:x} rev 0x{:x}, {} front end, MMU {}",
        info.chip_id,
        info.chip_rev,
        if info.end_front_end { "END" } else { "WAIT-LINK" },
        if info.mmu { "on" } else { "off" }
    );

    let buffer = client.allocate(4096, 0, AllocFlags::empty(), VidmemType::Command, Pool::Default)?;
    let (logical, gpu_address) = client.map(buffer, MapFlags::USER | MapFlags::GPU)?;
    println!("[+] Command buffer {buffer}: user 0x{logical:x}, GPU 0x{gpu_address:08x}");

    let signal = client.signal_create(false)?;
    client.queue_signal(signal)?;
    client.commit(buffer, 0, 64, true)?;
    println!("[+] Committed 64 bytes with an event");

    // Play the part of the hardware: raise the first event.
    gpu.raise_interrupt(0, 1);
    kernel.interrupt(0);
    client.signal_wait(signal, Some(Duration::from_secs(1)))?;
    println!("[+] Signal {signal} completed");

    for span in kernel.cores()[0].recent_spans() {
        println!("    executed 0x{:08x} (+{} bytes)", span.address, span.size);
    }
    println!("    stats: {:?}", kernel.cores()[0].stats());

    client.signal_destroy(signal)?;
    client.free(buffer)?;
    client.close()?;
    println!("=== Done ===");
    Ok(())
}
