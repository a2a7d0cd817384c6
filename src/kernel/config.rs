//! Driver parameters.

use crate::error::{N2dError, N2dResult};
use crate::kernel::hardware::cmdbuf::FeMode;
use crate::utils::PAGE_SIZE;
use std::time::Duration;

pub const DEFAULT_GPU_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = 32 * 1024;
/// MTLB entries of GPU VA (4 MiB each).
pub const DEFAULT_MMU_AREA: usize = 256;
/// Event-ID retries (1 ms apart) before a commit gives up.
pub const DEFAULT_EVENT_WAIT: u32 = 1000;

/// Module parameters of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Reserved contiguous region; size 0 disables the reserved pool.
    pub contiguous_base: u64,
    pub contiguous_size: u64,
    pub cores: usize,
    /// Poll the interrupt register instead of relying on the IRQ line.
    pub polling: bool,
    /// Run the hang watchdog and recover stalled cores.
    pub recovery: bool,
    pub gpu_timeout: Duration,
    pub command_buffer_size: usize,
    /// Translate GPU addresses through the MMU. Without it only contiguous
    /// memory can be mapped, at its physical address.
    pub mmu: bool,
    pub mmu_area: usize,
    /// Forces a front-end model; `None` follows the feature registers.
    pub fe_mode: Option<FeMode>,
    pub event_wait: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            contiguous_base: 0,
            contiguous_size: 0,
            cores: 1,
            polling: false,
            recovery: true,
            gpu_timeout: DEFAULT_GPU_TIMEOUT,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
            mmu: true,
            mmu_area: DEFAULT_MMU_AREA,
            fe_mode: None,
            event_wait: DEFAULT_EVENT_WAIT,
        }
    }

    #[must_use]
    pub const fn with_contiguous(mut self, base: u64, size: u64) -> Self {
        self.contiguous_base = base;
        self.contiguous_size = size;
        self
    }

    #[must_use]
    pub const fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    #[must_use]
    pub const fn with_polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }

    #[must_use]
    pub const fn with_recovery(mut self, recovery: bool) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub const fn with_gpu_timeout(mut self, timeout: Duration) -> Self {
        self.gpu_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_command_buffer_size(mut self, size: usize) -> Self {
        self.command_buffer_size = size;
        self
    }

    #[must_use]
    pub const fn with_mmu(mut self, enabled: bool) -> Self {
        self.mmu = enabled;
        self
    }

    #[must_use]
    pub const fn with_mmu_area(mut self, mtlb_entries: usize) -> Self {
        self.mmu_area = mtlb_entries;
        self
    }

    #[must_use]
    pub const fn with_fe_mode(mut self, mode: FeMode) -> Self {
        self.fe_mode = Some(mode);
        self
    }

    #[must_use]
    pub const fn with_event_wait(mut self, retries: u32) -> Self {
        self.event_wait = retries;
        self
    }

    /// Parses a whitespace separated `key=value` list on top of the defaults.
    ///
    /// Numbers are decimal or `0x` hex; booleans are `0`/`1`/`true`/`false`;
    /// `gpuTimeout` is in milliseconds; `feMode` is `auto`, `waitlink` or `end`.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown keys, malformed values or a config that
    /// fails [`KernelConfig::validate`].
    pub fn from_params(params: &str) -> N2dResult<Self> {
        let mut config = Self::new();

        for item in params.split_whitespace() {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                log::warn!("config: malformed parameter '{item}'");
                N2dError::InvalidArgument
            })?;

            match key {
                "contiguousBase" => config.contiguous_base = parse_number(value)?,
                "contiguousSize" => config.contiguous_size = parse_number(value)?,
                "cores" => config.cores = parse_usize(value)?,
                "polling" => config.polling = parse_bool(value)?,
                "recovery" => config.recovery = parse_bool(value)?,
                "gpuTimeout" => config.gpu_timeout = Duration::from_millis(parse_number(value)?),
                "commandBufferSize" => config.command_buffer_size = parse_usize(value)?,
                "mmu" => config.mmu = parse_bool(value)?,
                "mmuArea" => config.mmu_area = parse_usize(value)?,
                "feMode" => {
                    config.fe_mode = match value {
                        "auto" => None,
                        "waitlink" => Some(FeMode::WaitLink),
                        "end" => Some(FeMode::End),
                        _ => return Err(N2dError::InvalidArgument),
                    }
                }
                _ => {
                    log::warn!("config: unknown parameter '{key}'");
                    return Err(N2dError::InvalidArgument);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `InvalidArgument` for zero cores, a ring smaller than a page, a zero
    /// timeout or an empty MMU area.
    pub fn validate(&self) -> N2dResult<()> {
        if self.cores == 0
            || self.command_buffer_size < PAGE_SIZE
            || self.gpu_timeout.is_zero()
            || self.mmu_area == 0
        {
            return Err(N2dError::InvalidArgument);
        }
        Ok(())
    }
}

fn parse_number(value: &str) -> N2dResult<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| {
        log::warn!("config: bad number '{value}'");
        N2dError::InvalidArgument
    })
}

fn parse_usize(value: &str) -> N2dResult<usize> {
    usize::try_from(parse_number(value)?).map_err(|_| N2dError::InvalidArgument)
}

fn parse_bool(value: &str) -> N2dResult<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(N2dError::InvalidArgument),
    }
}
