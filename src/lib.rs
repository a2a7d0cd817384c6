//! Kernel core of the Nano2D (GC820) 2D accelerator driver: MMU-backed video
//! memory, command-buffer submission and the ioctl interface in front of them.

pub mod abi;
pub mod error;
pub mod kernel;
pub mod utils;

pub use error::{N2dError, N2dResult};
