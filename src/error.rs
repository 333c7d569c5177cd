//! Error types for the `chain-hash` crate

/// Recoverable failures of table operations.
///
/// Both variants mean the table could not obtain the memory an operation
/// needed. The table is left exactly as it was before the failing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The allocator refused a request.
    #[error("allocator failed to provide {size} bytes")]
    OutOfMemory {
        /// Size in bytes of the refused request.
        size: usize,
    },

    /// A bucket array or entry record would exceed the largest representable
    /// allocation.
    #[error("requested table memory exceeds isize::MAX bytes")]
    CapacityOverflow,
}
