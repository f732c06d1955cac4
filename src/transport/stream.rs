//! Registry-bound TCP streams.

use crate::cx::{CallBinding, CallRegistry, Connection, Cx, Role};
use crate::error::Error;
use crate::types::UnitId;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The registry's view of a TCP socket.
///
/// Holds its own handle to the socket so a canceller on another thread
/// can shut it down while the owning unit is parked in `read`.
pub(crate) struct TcpConnection {
    socket: TcpStream,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
}

impl TcpConnection {
    pub(crate) fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            socket: stream.try_clone()?,
            peer: stream.peer_addr().ok(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Connection for TcpConnection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // NotConnected just means the peer beat us to it.
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn describe(&self) -> String {
        self.peer
            .map_or_else(|| "tcp".to_string(), |peer| format!("tcp:{peer}"))
    }
}

/// A TCP stream bound to the unit driving the call.
///
/// Dropping the stream (or calling [`finish`](Self::finish)) releases its
/// own registry entry and closes the socket. It never touches a newer
/// binding of the same unit.
pub struct CallStream {
    stream: TcpStream,
    connection: Arc<TcpConnection>,
    binding: Option<CallBinding>,
    registry: Arc<CallRegistry>,
}

impl CallStream {
    pub(crate) fn new(
        stream: TcpStream,
        connection: Arc<TcpConnection>,
        binding: CallBinding,
        registry: Arc<CallRegistry>,
    ) -> Self {
        Self {
            stream,
            connection,
            binding: Some(binding),
            registry,
        }
    }

    /// The unit this stream is bound to.
    #[must_use]
    pub fn unit_id(&self) -> Option<UnitId> {
        self.binding.as_ref().map(CallBinding::unit)
    }

    /// Which side of the call this stream is.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.binding.as_ref().map(CallBinding::role)
    }

    /// True if a canceller tore this stream's entry down.
    #[must_use]
    pub fn was_force_closed(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.state().is_forced())
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Reclassifies an I/O fault seen on this stream.
    ///
    /// A fault on a force-closed stream is a cancellation even if the
    /// canceller has not raised the flag yet.
    #[must_use]
    pub fn classify(&self, cx: &Cx, err: io::Error) -> Error {
        if self.was_force_closed() {
            let reason = cx.cancel_reason().unwrap_or_default();
            return Error::cancelled(&reason).with_source(err);
        }
        cx.classify_io(err)
    }

    /// Ends the call normally.
    ///
    /// Returns false if a forced close got there first.
    pub fn finish(mut self) -> bool {
        self.release()
    }

    /// A second handle used to notice the peer hanging up.
    pub(crate) fn watch_handle(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    fn release(&mut self) -> bool {
        let Some(binding) = self.binding.take() else {
            return false;
        };
        let won = self.registry.unbind_binding(&binding);
        self.connection.close();
        won
    }
}

impl Read for CallStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for CallStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CallStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStream")
            .field("unit", &self.unit_id())
            .field("role", &self.role())
            .field("conn", &self.connection.describe())
            .field("force_closed", &self.was_force_closed())
            .finish()
    }
}
