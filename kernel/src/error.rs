//! Kernel error types.
//!
//! Recoverable failures (out-of-memory above all) are reported through
//! [`KernelError`] and propagate with `?`; invariant violations panic.

use core::fmt;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = core::result::Result<T, KernelError>;

/// Which memory pool an allocation was directed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Kernel physical pool / kernel virtual range.
    Kernel,
    /// User physical pool / per-task user virtual range.
    User,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Kernel => f.write_str("kernel"),
            PoolKind::User => f.write_str("user"),
        }
    }
}

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A physical or virtual pool could not satisfy an allocation.
    OutOfMemory {
        pool: PoolKind,
        requested_pages: usize,
    },
    /// The heap could not satisfy a byte-sized allocation.
    HeapExhausted { requested: usize },
    /// An interrupt vector outside the table was used.
    InvalidVector { vector: u8 },
    /// A handler is already registered for the vector.
    HandlerInstalled { vector: u8 },
    /// A device did not become ready within its time budget.
    DeviceTimeout { device: &'static str, lba: u32 },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory {
                pool,
                requested_pages,
            } => write!(f, "{pool} pool out of memory ({requested_pages} pages)"),
            KernelError::HeapExhausted { requested } => {
                write!(f, "heap exhausted ({requested} bytes)")
            }
            KernelError::InvalidVector { vector } => write!(f, "invalid vector {vector:#04x}"),
            KernelError::HandlerInstalled { vector } => {
                write!(f, "handler already installed for vector {vector:#04x}")
            }
            KernelError::DeviceTimeout { device, lba } => {
                write!(f, "{device}: timeout at lba {lba}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::*;
    use crate::drivers::console::FixedWriter;

    #[test]
    fn display_carries_context() {
        let mut buf = [0u8; 64];
        let mut w = FixedWriter::new(&mut buf);
        write!(
            w,
            "{}",
            KernelError::OutOfMemory {
                pool: PoolKind::User,
                requested_pages: 4,
            }
        )
        .unwrap();
        assert_eq!(w.as_str(), "user pool out of memory (4 pages)");
    }

    #[test]
    fn device_timeout_names_sector() {
        let mut buf = [0u8; 64];
        let mut w = FixedWriter::new(&mut buf);
        write!(
            w,
            "{}",
            KernelError::DeviceTimeout {
                device: "hd0",
                lba: 1000,
            }
        )
        .unwrap();
        assert_eq!(w.as_str(), "hd0: timeout at lba 1000");
    }
}
