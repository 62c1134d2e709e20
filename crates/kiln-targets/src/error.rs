//! Error types for target platform operations.

/// Errors that can occur while describing a target platform.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The platform string could not be split into an OS and an architecture.
    #[error("unrecognized platform '{input}': expected <os>-<arch> or a target triple")]
    UnrecognizedPlatform {
        /// The string that was rejected.
        input: String,
    },

    /// A capability flag name that kiln does not know.
    #[error("unknown capability flag '{name}' (expected one of: avx, avx2, fma, f16c)")]
    UnknownFlag {
        /// The name that was rejected.
        name: String,
    },
}

/// Result type for target operations.
pub type Result<T> = std::result::Result<T, TargetError>;
