use std::fmt;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt, Codec};
use crate::frame::FrameType;

/// Transport-level errors occur when a peer violates the protocol
/// specification
///
/// Raised by the codec on malformed wire input; routing converts these into
/// connection closes, never into worker failures.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: TransportErrorCode,
    /// Frame type that triggered the error, for diagnostics
    pub frame: Option<FrameType>,
    /// Human-readable explanation of the reason
    pub reason: &'static str,
}

impl TransportError {
    /// Attach the triggering frame type.
    pub fn with_frame(mut self, frame: FrameType) -> Self {
        self.frame = Some(frame);
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(frame) = self.frame {
            write!(f, " in {frame}")?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

/// Transport-level error code as carried by CONNECTION_CLOSE frames
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportErrorCode(u64);

impl TransportErrorCode {
    /// Raw wire value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl Codec for TransportErrorCode {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

impl From<u64> for TransportErrorCode {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub fn $name(reason: &'static str) -> Self {
                    Self {
                        code: TransportErrorCode::$name,
                        frame: None,
                        reason,
                    }
                }
            )*
        }

        impl TransportErrorCode {
            $(#[doc = $desc] pub const $name: Self = Self($val);)*
        }

        impl fmt::Debug for TransportErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "TransportErrorCode({x:04x})"),
                }
            }
        }

        impl fmt::Display for TransportErrorCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str($desc),)*
                    _ => write!(f, "unknown error {:04x}", self.0),
                }
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    CONNECTION_REFUSED(0x2) "the server refused to accept a new connection";
    FLOW_CONTROL_ERROR(0x3) "received more data than permitted in advertised data limits";
    STREAM_LIMIT_ERROR(0x4) "received a frame for a stream identifier that exceeded advertised the stream limit for the corresponding stream type";
    STREAM_STATE_ERROR(0x5) "received a frame for a stream that was not in a state that permitted that frame";
    FINAL_SIZE_ERROR(0x6) "received a STREAM frame or a RESET_STREAM frame containing a different final size to the one already established";
    FRAME_ENCODING_ERROR(0x7) "received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "received transport parameters that were badly formatted, included an invalid value, or omitted a mandatory parameter";
    CONNECTION_ID_LIMIT_ERROR(0x9) "the number of connection IDs provided by the peer exceeds the advertised limit";
    PROTOCOL_VIOLATION(0xA) "detected an error with protocol compliance that was not covered by more specific error codes";
    INVALID_TOKEN(0xB) "received an invalid Retry Token in a client Initial";
    APPLICATION_ERROR(0xC) "the application or application protocol caused the connection to be closed during the handshake";
    CRYPTO_BUFFER_EXCEEDED(0xD) "received more data in CRYPTO frames than can be buffered";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        let mut buf = Vec::new();
        TransportErrorCode::FRAME_ENCODING_ERROR.encode(&mut buf);
        let mut r = std::io::Cursor::new(buf);
        assert_eq!(
            TransportErrorCode::decode(&mut r),
            Ok(TransportErrorCode::FRAME_ENCODING_ERROR)
        );
    }

    #[test]
    fn display_carries_frame() {
        let err = TransportError::FRAME_ENCODING_ERROR("bad gap").with_frame(FrameType::ACK);
        let rendered = err.to_string();
        assert!(rendered.contains("bad gap"));
        assert!(rendered.contains("ACK"));
    }
}
