//! User/kernel boundary: the ioctl wire format and the user-mode client.

pub mod device;
pub mod ioctl;
