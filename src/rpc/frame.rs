//! Wire format: length-prefixed JSON frames.
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | body: `len` bytes of JSON |
//! +----------------+---------------------------+
//! ```
//!
//! One call is exactly one request frame followed by one response frame on
//! a fresh connection.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The announced or encoded body exceeds the limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Body length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
    /// Transport fault while reading or writing.
    #[error("frame i/o: {0}")]
    Io(#[from] io::Error),
    /// The body is not the expected JSON.
    #[error("frame body: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// Splits off the underlying I/O error so callers can classify it.
    pub fn into_io(self) -> Result<io::Error, Self> {
        match self {
            Self::Io(err) => Ok(err),
            other => Err(other),
        }
    }
}

/// A call request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name, e.g. `lock.acquire`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Creates a request.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// The call succeeded.
    Ok(Value),
    /// The service reported a fault.
    Err(RemoteFault),
}

/// Fault codes a service can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// No such method.
    UnknownMethod,
    /// Parameters did not decode.
    BadRequest,
    /// The handler gave up because its connection died.
    Abandoned,
    /// The service is shutting down.
    ShuttingDown,
    /// The service refused the request.
    Denied,
    /// The service failed internally.
    Internal,
}

impl FaultCode {
    /// The local error kind this fault surfaces as.
    #[must_use]
    pub const fn error_kind(self) -> ErrorKind {
        match self {
            Self::Abandoned => ErrorKind::Abandoned,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::UnknownMethod | Self::BadRequest | Self::Denied | Self::Internal => {
                ErrorKind::Remote
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownMethod => "unknown method",
            Self::BadRequest => "bad request",
            Self::Abandoned => "abandoned",
            Self::ShuttingDown => "shutting down",
            Self::Denied => "denied",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteFault {
    /// Fault code.
    pub code: FaultCode,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteFault {
    /// Creates a fault.
    #[must_use]
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Unknown-method fault.
    #[must_use]
    pub fn unknown_method(method: &str) -> Self {
        Self::new(
            FaultCode::UnknownMethod,
            format!("no method named {method:?}"),
        )
    }

    /// Bad-request fault.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(FaultCode::BadRequest, message)
    }
}

/// Serializes `value` and writes it as one frame.
pub fn write_frame<W, T>(writer: &mut W, value: &T, max_len: usize) -> Result<(), FrameError>
where
    W: Write + ?Sized,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|_| body.len() <= max_len)
        .ok_or(FrameError::TooLarge {
            len: body.len(),
            max: max_len,
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame and deserializes its body.
///
/// An announced length over `max_len` is rejected before any body byte is
/// read.
pub fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<T, FrameError>
where
    R: Read + ?Sized,
    T: for<'de> Deserialize<'de>,
{
    let mut prefix = [0_u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use serde_json::json;
    use std::io::Cursor;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn request_frame_layout() {
        init_test("request_frame_layout");
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::new("lock.acquire", Value::Null), 1024).expect("write");
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - 4);
        let body: Value = serde_json::from_slice(&buf[4..]).expect("json");
        assert_eq!(body, json!({"method": "lock.acquire", "params": null}));

        let back: Request = read_frame(&mut Cursor::new(buf), 1024).expect("read");
        assert_eq!(back.method, "lock.acquire");
        crate::test_complete!("request_frame_layout");
    }

    #[test]
    fn response_variants_on_the_wire() {
        init_test("response_variants_on_the_wire");
        let ok = serde_json::to_value(Response::Ok(json!(42))).expect("ok");
        assert_eq!(ok, json!({"ok": 42}));
        let err = serde_json::to_value(Response::Err(RemoteFault::new(
            FaultCode::Denied,
            "ticket mismatch",
        )))
        .expect("err");
        assert_eq!(
            err,
            json!({"err": {"code": "denied", "message": "ticket mismatch"}})
        );
        crate::test_complete!("response_variants_on_the_wire");
    }

    #[test]
    fn oversized_announcement_rejected_before_body() {
        init_test("oversized_announcement_rejected_before_body");
        let mut bytes = 2048_u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let err = read_frame::<_, Value>(&mut Cursor::new(bytes), 1024).expect_err("too large");
        assert!(matches!(
            err,
            FrameError::TooLarge {
                len: 2048,
                max: 1024
            }
        ));
        crate::test_complete!("oversized_announcement_rejected_before_body");
    }

    #[test]
    fn oversized_body_not_written() {
        init_test("oversized_body_not_written");
        let mut buf = Vec::new();
        let big = "x".repeat(200);
        let err = write_frame(&mut buf, &big, 64).expect_err("too large");
        assert!(matches!(err, FrameError::TooLarge { max: 64, .. }));
        assert!(buf.is_empty());
        crate::test_complete!("oversized_body_not_written");
    }

    #[test]
    fn truncated_frame_is_io_error() {
        init_test("truncated_frame_is_io_error");
        let mut bytes = 10_u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{\"a\"");
        let err = read_frame::<_, Value>(&mut Cursor::new(bytes), 1024).expect_err("eof");
        let io = err.into_io().expect("io error");
        assert_eq!(io.kind(), io::ErrorKind::UnexpectedEof);
        crate::test_complete!("truncated_frame_is_io_error");
    }

    #[test]
    fn garbage_body_is_json_error() {
        init_test("garbage_body_is_json_error");
        let mut bytes = 3_u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{{{");
        let err = read_frame::<_, Request>(&mut Cursor::new(bytes), 1024).expect_err("json");
        assert!(matches!(err, FrameError::Json(_)));
        crate::test_complete!("garbage_body_is_json_error");
    }

    #[test]
    fn fault_codes_map_to_error_kinds() {
        init_test("fault_codes_map_to_error_kinds");
        assert_eq!(FaultCode::Abandoned.error_kind(), ErrorKind::Abandoned);
        assert_eq!(
            FaultCode::ShuttingDown.error_kind(),
            ErrorKind::ShuttingDown
        );
        assert_eq!(FaultCode::Denied.error_kind(), ErrorKind::Remote);
        assert_eq!(
            RemoteFault::unknown_method("nope").to_string(),
            "unknown method: no method named \"nope\""
        );
        crate::test_complete!("fault_codes_map_to_error_kinds");
    }
}
