#![allow(clippy::cast_possible_truncation)]

/// Size of a CPU/GPU page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

// Linux `_IOC` request layout: nr(8) | type(8) | size(14) | dir(2).
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

#[must_use]
pub const fn ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (type_ << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

/// Read/write request number for a payload of type `T`.
#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// `align_up` that reports overflow instead of wrapping.
#[must_use]
pub const fn checked_align_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Number of 4K pages covering `size` bytes.
#[must_use]
pub const fn page_count(size: u64) -> usize {
    (align_up(size, PAGE_SIZE as u64) >> PAGE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_number_encodes_size_and_direction() {
        let nr = iowr::<[u8; 64]>(u32::from(b'N'), 0);
        assert_eq!(nr >> IOC_DIRSHIFT, IOC_READ | IOC_WRITE);
        assert_eq!((nr >> IOC_SIZESHIFT) & 0x3FFF, 64);
        assert_eq!((nr >> IOC_TYPESHIFT) & 0xFF, u32::from(b'N'));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert!(is_aligned(0x40, 64));
        assert!(!is_aligned(0x41, 64));
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(8192), 2);
        assert_eq!(page_count(0), 0);
    }
}
