//! # CM HAL Error Handling
//!
//! Error types shared by every layer of the task-execution engine.
//!
//! Error handling follows these principles:
//! - Every fallible step returns a [`Result`] checked immediately by its caller
//! - No panics in production code paths
//! - Errors are `Copy` and `no_std` compatible
//! - Command-buffer overflow carries its size so callers can report it

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CM HAL Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CM HAL unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// No free task slot, binding-table index, table entry or heap space
    ResourceExhausted,
    /// Composed command sequence exceeded the acquired buffer capacity
    BufferOverflow {
        /// Bytes the failing command needed
        needed: u32,
        /// Bytes that were still available
        available: i32,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Handle does not name a live table entry
    InvalidHandle,
    /// Bad caller input or a request the generation cannot honour
    InvalidParameter,
    /// A required input was missing
    NullPointer,

    // =========================================================================
    // Platform Errors
    // =========================================================================
    /// Capability not provided by this hardware generation
    Unimplemented,
    /// The OS/driver collaborator reported a failure
    OsFailure,
}

impl Error {
    /// Whether the device remains usable after this error
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::OsFailure)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::BufferOverflow { needed, available } => write!(
                f,
                "command buffer overflow: needed {} bytes, {} available",
                needed, available
            ),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NullPointer => write!(f, "required parameter missing"),
            Self::Unimplemented => write!(f, "not implemented for this platform"),
            Self::OsFailure => write!(f, "OS interface failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_overflow() {
        let e = Error::BufferOverflow { needed: 24, available: 8 };
        assert_eq!(
            format!("{}", e),
            "command buffer overflow: needed 24 bytes, 8 available"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::BufferOverflow { needed: 4, available: 0 }.is_recoverable());
        assert!(Error::ResourceExhausted.is_recoverable());
        assert!(!Error::OsFailure.is_recoverable());
    }
}
