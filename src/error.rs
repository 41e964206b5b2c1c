/*!
Error taxonomy shared by every layer family in the crate.

All checks run synchronously at the violated precondition; a failed call
returns before touching any state the caller can observe.
*/

use thiserror::Error;

/// Errors reported by layer construction and forward passes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    /// A conditional cell was invoked without its context tensor.
    #[error("context must be provided")]
    MissingContext,

    /// One-step mode was invoked without the previous memory.
    #[error("previous memory must be provided")]
    MissingMemory,

    /// A tensor argument disagrees with the configured sizes.
    #[error("{what}: expected {expected}, got {got}")]
    InvalidShape {
        /// Which argument was malformed.
        what: &'static str,
        /// The shape the layer was built for.
        expected: String,
        /// The shape that arrived.
        got: String,
    },

    /// The requested capability does not match how the layer was built.
    #[error("configuration error: {what}")]
    Configuration {
        /// What was inconsistent.
        what: String,
    },
}
