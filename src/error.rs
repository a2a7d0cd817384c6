use thiserror::Error;

#[derive(Error, Debug)]
pub enum N2dError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("No context")]
    NoContext,

    #[error("Operation timed out")]
    Timeout,

    #[error("Out of resources")]
    OutOfResources,

    #[error("Generic I/O failure")]
    GenericIo,

    #[error("Not supported")]
    NotSupported,

    #[error("Address or size not aligned")]
    NotAligned,

    #[error("Object not found")]
    NotFound,

    #[error("Wait interrupted by a signal")]
    Interrupted,

    #[error("Heap corrupted")]
    HeapCorrupted,
}

impl N2dError {
    /// Numeric code carried in the `error` field of the ioctl interface.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument => 1,
            Self::OutOfMemory => 2,
            Self::NoContext => 3,
            Self::Timeout => 4,
            Self::OutOfResources => 5,
            Self::GenericIo | Self::Io(_) => 6,
            Self::NotSupported => 7,
            Self::NotAligned => 8,
            Self::NotFound => 9,
            Self::Interrupted => 10,
            Self::HeapCorrupted => 11,
        }
    }

    /// Decodes a wire error code. `0` is success and yields `None`.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            1 => Self::InvalidArgument,
            2 => Self::OutOfMemory,
            3 => Self::NoContext,
            4 => Self::Timeout,
            5 => Self::OutOfResources,
            7 => Self::NotSupported,
            8 => Self::NotAligned,
            9 => Self::NotFound,
            10 => Self::Interrupted,
            11 => Self::HeapCorrupted,
            _ => Self::GenericIo,
        })
    }
}

// A convenient alias
pub type N2dResult<T> = Result<T, N2dError>;

/// Wire representation of a result.
#[must_use]
pub fn result_code<T>(result: &N2dResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_the_wire() {
        let all = [
            N2dError::InvalidArgument,
            N2dError::OutOfMemory,
            N2dError::NoContext,
            N2dError::Timeout,
            N2dError::OutOfResources,
            N2dError::GenericIo,
            N2dError::NotSupported,
            N2dError::NotAligned,
            N2dError::NotFound,
            N2dError::Interrupted,
            N2dError::HeapCorrupted,
        ];
        for e in all {
            let back = N2dError::from_code(e.code()).unwrap();
            assert_eq!(back.code(), e.code());
        }
        assert!(N2dError::from_code(0).is_none());
    }

    #[test]
    fn io_errors_report_generic_io() {
        let e = N2dError::from(std::io::Error::other("boom"));
        assert_eq!(e.code(), 6);
        assert_eq!(result_code::<()>(&Err(e)), 6);
        assert_eq!(result_code(&Ok(())), 0);
    }
}
