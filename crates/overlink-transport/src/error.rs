//! Transport layer error types
//!
//! Channel-level failures use [`overlink_core::TransportError`]; framing
//! problems are reported as protocol violations.

pub use overlink_core::{TransportError, TransportResult};

pub use crate::protocol::FramingError;

impl From<FramingError> for TransportError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(e) => TransportError::ChannelClosed(format!("I/O error: {e}")),
            FramingError::EndOfStream => TransportError::ChannelClosed("end of stream".into()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_conversion() {
        let err: TransportError = FramingError::MessageTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, TransportError::Protocol(_)));

        let err: TransportError = FramingError::EndOfStream.into();
        assert!(matches!(err, TransportError::ChannelClosed(_)));
    }
}
