//! Transport factory: the only way connections enter a call.
//!
//! Every outbound connect and inbound accept goes through
//! [`TransportFactory`], which wraps the socket and binds it to the unit
//! named by the caller's [`Cx`]. From then until the call ends the
//! connection is reachable through the registry, so a canceller can close
//! it out from under a blocked read.
//!
//! ```text
//! connect()/accept() ──► bind(unit, conn, role) ──► CallStream
//!                                                    │
//!                          drop / finish ◄───────────┤ (normal completion)
//!                          close_and_unbind ◄────────┘ (cancel)
//! ```

mod stream;

pub use stream::CallStream;

use crate::config::RpcConfig;
use crate::cx::{CallRegistry, Connection, Cx, Role};
use crate::tracing_compat::{debug, trace};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use stream::TcpConnection;

/// Opens and accepts connections on behalf of units.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    registry: Arc<CallRegistry>,
    nodelay: bool,
}

impl TransportFactory {
    /// Creates a factory binding into `registry`.
    #[must_use]
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self::with_config(registry, &RpcConfig::default())
    }

    /// Creates a factory using the socket settings from `config`.
    #[must_use]
    pub fn with_config(registry: Arc<CallRegistry>, config: &RpcConfig) -> Self {
        Self {
            registry,
            nodelay: config.tcp_nodelay,
        }
    }

    /// The registry this factory binds into.
    #[must_use]
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Opens a client connection and binds it to the calling unit.
    ///
    /// A failed connect leaves nothing bound. A unit that already has a
    /// call in flight gets an error wrapping
    /// [`RegistryError::AlreadyBound`](crate::cx::RegistryError) and the
    /// new socket is closed.
    pub fn connect<A>(&self, cx: &Cx, endpoint: A) -> io::Result<CallStream>
    where
        A: ToSocketAddrs + fmt::Debug,
    {
        self.check_cx(cx)?;
        check_not_cancelled(cx)?;
        trace!(unit = %cx.unit_id(), endpoint = ?endpoint, "connecting");
        let stream = TcpStream::connect(endpoint)?;
        stream.set_nodelay(self.nodelay)?;
        self.bind_stream(cx, stream, Role::Client)
    }

    /// Accepts one connection and binds it to the handling unit.
    pub fn accept(&self, cx: &Cx, listener: &TcpListener) -> io::Result<(CallStream, SocketAddr)> {
        self.check_cx(cx)?;
        check_not_cancelled(cx)?;
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(self.nodelay)?;
        let call = self.bind_stream(cx, stream, Role::Server)?;
        Ok((call, peer))
    }

    fn check_cx(&self, cx: &Cx) -> io::Result<()> {
        if Arc::ptr_eq(cx.registry(), &self.registry) {
            Ok(())
        } else {
            Err(io::Error::other("unit context belongs to a different call registry"))
        }
    }

    fn bind_stream(&self, cx: &Cx, stream: TcpStream, role: Role) -> io::Result<CallStream> {
        let connection = Arc::new(TcpConnection::new(&stream)?);
        let binding = match self.registry.bind(cx.unit_id(), connection.clone(), role) {
            Ok(binding) => binding,
            Err(err) => {
                connection.close();
                return Err(io::Error::other(err));
            }
        };
        let call = CallStream::new(stream, connection, binding, Arc::clone(&self.registry));

        // Cancelled after the canceller's sweep: nobody else will close this.
        if cx.is_cancel_requested() {
            drop(call);
            return Err(cancelled_io());
        }
        debug!(unit = %cx.unit_id(), role = %role, "call stream ready");
        Ok(call)
    }
}

fn check_not_cancelled(cx: &Cx) -> io::Result<()> {
    if cx.is_cancel_requested() {
        Err(cancelled_io())
    } else {
        Ok(())
    }
}

fn cancelled_io() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "unit cancelled")
}
