//! The kernel-side core of the driver.

pub mod config;
pub mod context;
pub mod db;
pub mod event;
pub mod hardware;
pub mod memory;
pub mod mmu;
pub mod os;
pub mod platform;
pub mod regs;
pub mod sim;
