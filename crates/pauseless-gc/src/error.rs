//! Error types.
//!
//! The collector has no recoverable runtime errors: page exhaustion while
//! allocating or relocating is fatal, and protocol violations are debug
//! assertions. [`HeapError`] covers construction and the `try_*` entry
//! points that let a caller observe exhaustion before it becomes fatal.

use std::fmt;
use std::io;

/// Errors reported by heap construction and fallible allocation.
#[derive(Debug)]
pub enum HeapError {
    /// The configuration is inconsistent.
    InvalidConfig(String),
    /// The OS refused the address-space reservation.
    Reservation(io::Error),
    /// A collector thread could not be started.
    ThreadSpawn(io::Error),
    /// Every page is in use and the page ceiling has been reached.
    OutOfPages {
        /// The configured page ceiling.
        max_pages: usize,
    },
    /// An object does not fit in a single page.
    ObjectTooLarge {
        /// Requested size in bytes.
        size: usize,
        /// Largest allocatable size in bytes.
        max: usize,
    },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid heap configuration: {reason}"),
            Self::Reservation(err) => write!(f, "failed to reserve heap memory: {err}"),
            Self::ThreadSpawn(err) => write!(f, "failed to start a collector thread: {err}"),
            Self::OutOfPages { max_pages } => {
                write!(f, "heap exhausted: all {max_pages} pages are in use")
            }
            Self::ObjectTooLarge { size, max } => {
                write!(f, "object of {size} bytes exceeds the {max} byte page")
            }
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reservation(err) | Self::ThreadSpawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for HeapError {
    fn from(err: io::Error) -> Self {
        Self::Reservation(err)
    }
}

/// Terminates the process after a resource-exhaustion failure.
///
/// Once a live object has nowhere to go the heap cannot be brought back to a
/// consistent state, so there is nothing to unwind to.
#[cold]
pub(crate) fn fatal(err: &HeapError) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(error = %err, "fatal heap error");
    eprintln!("[GC] fatal: {err}");
    std::process::abort()
}
