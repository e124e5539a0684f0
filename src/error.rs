//! # Structural Errors
//!
//! All fallible operations in this crate return `eyre::Result`. Failures that
//! mean the on-disk structure itself is unusable are raised as a
//! [`StructuralError`] wrapped in the report, so callers can tell them apart
//! from I/O and deserialization failures:
//!
//! ```ignore
//! match table.put(&key, v) {
//!     Err(report) if report.downcast_ref::<StructuralError>().is_some() => {
//!         // the instance is unusable, rebuild or discard it
//!     }
//!     other => other?,
//! };
//! ```
//!
//! I/O errors from the block store and codec errors are propagated as-is.

use std::fmt;

/// A violated structural invariant. Fatal for the table instance that
/// reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// The table was closed and no longer owns a block store.
    NoBlockStore,
    /// The header at `location` does not carry the table magic.
    BadMagic { location: u64, found: u32 },
    /// A chain pointer that must be set was zero.
    NullPointer { context: &'static str },
    /// Instance id 0 never refers to an allocated table.
    ZeroInstance,
    /// A record carries an unknown tag or version.
    CorruptRecord { location: u64, tag: u64 },
    /// A block store operation referenced something that is not a live block.
    InvalidBlock { offset: u64, reason: &'static str },
    /// The header describes a state recovery cannot repair.
    Unrecoverable { reason: String },
    /// A mutation was attempted on a read-only store.
    ReadOnly,
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralError::NoBlockStore => write!(f, "hashtable has no block store (closed)"),
            StructuralError::BadMagic { location, found } => write!(
                f,
                "invalid table magic {:#010x} at offset {}",
                found, location
            ),
            StructuralError::NullPointer { context } => {
                write!(f, "unexpected null chain pointer: {}", context)
            }
            StructuralError::ZeroInstance => write!(f, "instance id 0 does not name a table"),
            StructuralError::CorruptRecord { location, tag } => write!(
                f,
                "corrupt record at offset {}: packed word {:#018x}",
                location, tag
            ),
            StructuralError::InvalidBlock { offset, reason } => {
                write!(f, "invalid block at offset {}: {}", offset, reason)
            }
            StructuralError::Unrecoverable { reason } => {
                write!(f, "unrecoverable table state: {}", reason)
            }
            StructuralError::ReadOnly => write!(f, "block store is read-only"),
        }
    }
}

impl std::error::Error for StructuralError {}

impl StructuralError {
    /// Returns true if `report` carries a `StructuralError`.
    pub fn is_structural(report: &eyre::Report) -> bool {
        report.downcast_ref::<StructuralError>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_error_survives_eyre_wrapping() {
        let report = eyre::Report::new(StructuralError::ZeroInstance);
        let report = report.wrap_err("destroy failed");

        assert!(StructuralError::is_structural(&report));
        assert_eq!(
            report.downcast_ref::<StructuralError>(),
            Some(&StructuralError::ZeroInstance)
        );
    }

    #[test]
    fn display_includes_location() {
        let err = StructuralError::BadMagic {
            location: 256,
            found: 7,
        };

        let text = err.to_string();
        assert!(text.contains("256"));
        assert!(text.contains("0x00000007"));
    }

    #[test]
    fn io_error_is_not_structural() {
        let report = eyre::Report::new(std::io::Error::other("disk gone"));
        assert!(!StructuralError::is_structural(&report));
    }
}
