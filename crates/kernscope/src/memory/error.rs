//! Error types for layer and translation operations.

use thiserror::Error;

/// Errors raised by layers, translators and the layer registry.
#[derive(Error, Debug)]
pub enum LayerError {
    /// An address lies outside a layer's backing store.
    #[error("Invalid address {invalid_address:#x} in layer '{layer_name}': {message}")]
    InvalidAddress {
        layer_name: String,
        invalid_address: u64,
        message: String,
    },

    /// A virtual address has no present translation.
    ///
    /// `invalid_bits` is the number of low address bits covered by the
    /// missing entry, so callers can skip the whole unmapped run at once.
    #[error("Unmapped address {invalid_address:#x} in layer '{layer_name}' (entry={entry:#x}, invalid_bits={invalid_bits}): {message}")]
    UnmappedMemory {
        layer_name: String,
        invalid_address: u64,
        invalid_bits: u32,
        entry: u64,
        message: String,
    },

    /// A translation root (page-table base) failed validation.
    #[error("Invalid address space '{layer_name}' (root={root:#x}): {message}")]
    InvalidAddressSpace {
        layer_name: String,
        root: u64,
        message: String,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The layer has been destroyed and cannot be used.
    #[error("Layer '{0}' has been destroyed")]
    LayerDestroyed(String),

    #[error("Layer '{0}' is not registered")]
    UnknownLayer(String),

    #[error("Layer '{0}' is already registered")]
    DuplicateLayer(String),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl LayerError {
    pub fn invalid_address(layer_name: impl Into<String>, addr: u64, msg: impl Into<String>) -> Self {
        LayerError::InvalidAddress {
            layer_name: layer_name.into(),
            invalid_address: addr,
            message: msg.into(),
        }
    }

    pub fn unmapped(
        layer_name: impl Into<String>,
        addr: u64,
        invalid_bits: u32,
        entry: u64,
        msg: impl Into<String>,
    ) -> Self {
        LayerError::UnmappedMemory {
            layer_name: layer_name.into(),
            invalid_address: addr,
            invalid_bits,
            entry,
            message: msg.into(),
        }
    }

    pub fn invalid_address_space(
        layer_name: impl Into<String>,
        root: u64,
        msg: impl Into<String>,
    ) -> Self {
        LayerError::InvalidAddressSpace {
            layer_name: layer_name.into(),
            root,
            message: msg.into(),
        }
    }

    pub fn layer_destroyed(name: impl Into<String>) -> Self {
        LayerError::LayerDestroyed(name.into())
    }

    /// True when the bytes simply are not there: a page fault or a read past
    /// the end of the backing store. Retrying with padding succeeds for these.
    pub fn is_unmapped(&self) -> bool {
        matches!(
            self,
            LayerError::UnmappedMemory { .. } | LayerError::InvalidAddress { .. }
        )
    }
}

/// Result type for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address_error() {
        let err = LayerError::invalid_address("physical", 0x1000, "past end of capture");
        assert!(err.to_string().contains("physical"));
        assert!(err.to_string().contains("0x1000"));
        assert!(err.is_unmapped());
    }

    #[test]
    fn test_unmapped_error() {
        let err = LayerError::unmapped("kernel", 0x2000, 12, 0xDEAD, "page fault");
        assert!(err.to_string().contains("kernel"));
        assert!(err.to_string().contains("invalid_bits=12"));
        assert!(err.is_unmapped());
    }

    #[test]
    fn test_invalid_address_space_is_not_unmapped() {
        let err = LayerError::invalid_address_space("kernel_Process4", 0x1234, "misaligned");
        assert!(err.to_string().contains("root=0x1234"));
        assert!(!err.is_unmapped());
    }
}
