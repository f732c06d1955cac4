//! Client side of a call.

use super::frame::{DEFAULT_MAX_FRAME_LEN, FrameError, Request, Response, read_frame, write_frame};
use crate::config::RpcConfig;
use crate::cx::Cx;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, info_span};
use crate::transport::{CallStream, TransportFactory};
use serde_json::Value;
use std::net::SocketAddr;

/// Issues calls to one endpoint, one fresh connection per call.
#[derive(Debug, Clone)]
pub struct RpcClient {
    transport: TransportFactory,
    endpoint: SocketAddr,
    max_frame_len: usize,
}

impl RpcClient {
    /// Creates a client for `endpoint`.
    #[must_use]
    pub fn new(transport: TransportFactory, endpoint: SocketAddr) -> Self {
        Self {
            transport,
            endpoint,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Creates a client using the frame limit from `config`.
    #[must_use]
    pub fn with_config(
        transport: TransportFactory,
        endpoint: SocketAddr,
        config: &RpcConfig,
    ) -> Self {
        Self {
            transport,
            endpoint,
            max_frame_len: config.max_frame_len,
        }
    }

    /// The endpoint calls go to.
    #[must_use]
    pub const fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Performs one call on behalf of the unit behind `cx`.
    ///
    /// Blocks until the response arrives, the connection fails, or the unit
    /// is cancelled. The call is complete once the whole response frame has
    /// been read; a cancel after that point does not discard the result.
    pub fn call(&self, cx: &Cx, method: &str, params: Value) -> Result<Value> {
        let _span = info_span!("rpc_call", unit = %cx.unit_id(), method = %method).entered();
        let mut stream = self
            .transport
            .connect(cx, self.endpoint)
            .map_err(|err| cx.classify_io(err))?;

        let request = Request::new(method, params);
        write_frame(&mut stream, &request, self.max_frame_len)
            .map_err(|err| classify_frame(cx, &stream, err))?;
        debug!(method = %method, "request sent; awaiting response");

        let response: Response = read_frame(&mut stream, self.max_frame_len)
            .map_err(|err| classify_frame(cx, &stream, err))?;
        stream.finish();

        match response {
            Response::Ok(value) => Ok(value),
            Response::Err(fault) => Err(Error::remote(fault)),
        }
    }
}

fn classify_frame(cx: &Cx, stream: &CallStream, err: FrameError) -> Error {
    match err.into_io() {
        Ok(io) => stream.classify(cx, io),
        Err(other) => Error::from(other),
    }
}
