//! Transport error definitions

pub use branta_core::OutOfMemoryError;

/// Errors that can occur when queueing a transfer for transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransmitError {
    /// An anonymous transfer would require more than one frame
    ///
    /// Anonymous transfers must fit into a single frame.
    AnonymousMultiFrame,
    /// Memory allocation failed
    ///
    /// The frame queue is left exactly as it was before the push.
    Memory(OutOfMemoryError),
}

impl From<OutOfMemoryError> for TransmitError {
    fn from(inner: OutOfMemoryError) -> Self {
        TransmitError::Memory(inner)
    }
}
