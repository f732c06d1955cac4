//! Typed client for the lock service.

use super::service::{LockStatus, ReleaseParams};
use super::{METHOD_ACQUIRE, METHOD_RELEASE, METHOD_STATUS, Ticket};
use crate::cx::Cx;
use crate::error::{Error, ErrorKind, Result};
use crate::rpc::RpcClient;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Calls the lock service through an [`RpcClient`].
///
/// Every method blocks the calling unit; cancel the unit to abandon a
/// pending [`acquire`](Self::acquire).
#[derive(Debug, Clone)]
pub struct LockClient {
    rpc: RpcClient,
}

impl LockClient {
    /// Wraps an RPC client pointed at a lock service.
    #[must_use]
    pub const fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// The underlying RPC client.
    #[must_use]
    pub const fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Waits for the lock.
    ///
    /// Fails with [`ErrorKind::Cancelled`] if the unit was cancelled while
    /// waiting, [`ErrorKind::ShuttingDown`] if the service is going away.
    pub fn acquire(&self, cx: &Cx) -> Result<Ticket> {
        let ticket: Ticket = decode(self.rpc.call(cx, METHOD_ACQUIRE, Value::Null)?)?;
        if ticket.is_none() {
            return Err(Error::new(ErrorKind::Protocol).with_message("empty ticket granted"));
        }
        Ok(ticket)
    }

    /// Releases the lock held by `ticket`.
    pub fn release(&self, cx: &Cx, ticket: Ticket) -> Result<()> {
        let params = serde_json::to_value(ReleaseParams { ticket })
            .map_err(|err| Error::new(ErrorKind::Internal).with_source(err))?;
        self.rpc.call(cx, METHOD_RELEASE, params)?;
        Ok(())
    }

    /// Asks the service for its current status.
    pub fn status(&self, cx: &Cx) -> Result<LockStatus> {
        decode(self.rpc.call(cx, METHOD_STATUS, Value::Null)?)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message(err.to_string())
            .with_source(err)
    })
}
