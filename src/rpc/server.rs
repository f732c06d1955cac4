//! Server side: accept loop, per-call handler units and peer watching.
//!
//! There is no dedicated accept thread. Each handler unit accepts exactly
//! one connection through the transport factory (so the connection is
//! bound to the unit that will serve it), immediately starts the next
//! acceptor unit, then serves its single call.
//!
//! While the service runs, a watcher thread reads the other half of the
//! socket. The client sends nothing after its request, so the watcher only
//! returns when the client hangs up or the connection is closed. If that
//! happens before the handler is done, the handler unit is cancelled with
//! [`CancelKind::PeerGone`](crate::CancelKind::PeerGone): its entry is
//! force-closed and its cancel hooks run, which is how a handler blocked on
//! a condition variable learns that nobody is waiting for the answer.

use super::frame::{FrameError, RemoteFault, Request, Response, read_frame, write_frame};
use crate::config::RpcConfig;
use crate::cx::{CallRegistry, Cx};
use crate::tracing_compat::{debug, error, info, info_span, warn};
use crate::transport::{CallStream, TransportFactory};
use crate::types::{CancelReason, UnitId};
use crate::unit::{Canceller, UnitFactory};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Server-side call logic.
pub trait Service: Send + Sync + 'static {
    /// Handles one call.
    ///
    /// Long-running handlers should poll [`Cx::is_connection_alive`] or
    /// register a [`Cx::on_cancel`] hook so they can abandon work nobody
    /// is waiting for.
    fn call(&self, cx: &Cx, method: &str, params: Value) -> Result<Value, RemoteFault>;

    /// Called with a successful result that could not be written back
    /// because the connection was gone. Services that hand out resources
    /// reclaim them here.
    fn undelivered(&self, method: &str, result: Value) {
        let _ = (method, result);
    }
}

struct ServerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    transport: TransportFactory,
    units: UnitFactory,
    service: Arc<dyn Service>,
    max_frame_len: usize,
    shutting_down: AtomicBool,
    handlers: Mutex<HashMap<UnitId, Canceller>>,
}

/// A running RPC server.
///
/// Cloning yields another handle to the same server. The server keeps
/// accepting until [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Binds a listener on `addr` without accepting yet.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<CallRegistry>,
        service: Arc<dyn Service>,
        config: &RpcConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                local_addr,
                transport: TransportFactory::with_config(Arc::clone(&registry), config),
                units: UnitFactory::from_config(registry, config),
                service,
                max_frame_len: config.max_frame_len,
                shutting_down: AtomicBool::new(false),
                handlers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Binds with default settings and starts accepting.
    pub fn serve<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<CallRegistry>,
        service: Arc<dyn Service>,
    ) -> io::Result<Self> {
        let server = Self::bind(addr, registry, service, &RpcConfig::default())?;
        server.start()?;
        Ok(server)
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Starts the first acceptor unit.
    pub fn start(&self) -> io::Result<()> {
        info!(addr = %self.inner.local_addr, "rpc server accepting");
        spawn_acceptor(&self.inner)
    }

    /// Number of units currently accepting or serving a call.
    #[must_use]
    pub fn live_handlers(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stops accepting and cancels every live handler.
    ///
    /// Idempotent. Returns without waiting for handlers to exit.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers: Vec<Canceller> = {
            let mut table = self.inner.handlers.lock();
            table.drain().map(|(_, c)| c).collect()
        };
        info!(handlers = handlers.len(), "rpc server shutting down");
        for canceller in &handlers {
            canceller.cancel_with(CancelReason::shutdown());
        }
        // The acceptor is parked in accept(), which no close can reach.
        if let Err(err) = TcpStream::connect(wake_addr(self.inner.local_addr)) {
            debug!(error = %err, "wake connect failed; acceptor may already be gone");
        }
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("addr", &self.inner.local_addr)
            .field("live_handlers", &self.live_handlers())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

fn spawn_acceptor(inner: &Arc<ServerInner>) -> io::Result<()> {
    let server = Arc::clone(inner);
    let unit = inner.units.new_unit(move |cx| serve_one(&server, cx));
    let id = unit.id();
    {
        let mut handlers = inner.handlers.lock();
        if inner.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        handlers.insert(id, unit.canceller());
    }
    if let Err(err) = unit.start() {
        inner.handlers.lock().remove(&id);
        return Err(err);
    }
    Ok(())
}

fn serve_one(inner: &Arc<ServerInner>, cx: &Cx) {
    let accepted = inner.transport.accept(cx, &inner.listener);

    if !inner.shutting_down.load(Ordering::Acquire) {
        if let Err(err) = spawn_acceptor(inner) {
            error!(error = %err, "failed to start next acceptor; server stops accepting");
        }
    }

    match accepted {
        Ok((stream, peer)) => {
            if inner.shutting_down.load(Ordering::Acquire) {
                debug!(peer = %peer, "connection accepted during shutdown; dropping");
            } else {
                handle_call(inner, cx, stream, peer);
            }
        }
        Err(err) if cx.is_cancel_requested() => {
            debug!(unit = %cx.unit_id(), error = %err, "acceptor cancelled");
        }
        Err(err) => {
            warn!(unit = %cx.unit_id(), error = %err, "accept failed");
        }
    }

    inner.handlers.lock().remove(&cx.unit_id());
}

fn handle_call(inner: &ServerInner, cx: &Cx, mut stream: CallStream, peer: SocketAddr) {
    let _span = info_span!("rpc_handler", unit = %cx.unit_id(), peer = %peer).entered();

    let request: Request = match read_frame(&mut stream, inner.max_frame_len) {
        Ok(request) => request,
        Err(FrameError::Io(err)) => {
            debug!(error = %stream.classify(cx, err), "request never arrived");
            return;
        }
        Err(err) => {
            warn!(error = %err, "malformed request");
            let fault = RemoteFault::bad_request(err.to_string());
            if let Err(err) = write_frame(&mut stream, &Response::Err(fault), inner.max_frame_len) {
                debug!(error = %err, "bad-request reply not delivered");
            }
            return;
        }
    };
    let method = request.method;
    debug!(method = %method, "serving call");

    let watch = match PeerWatch::start(&stream, cx.canceller()) {
        Ok(watch) => Some(watch),
        Err(err) => {
            warn!(error = %err, "peer watch unavailable; hangups go unnoticed");
            None
        }
    };

    let outcome = inner.service.call(cx, &method, request.params);

    if let Some(watch) = &watch {
        watch.disarm();
    }

    match outcome {
        Ok(value) if reply_lost(cx, watch.as_ref()) => {
            warn!(method = %method, "connection gone before reply; compensating");
            inner.service.undelivered(&method, value);
        }
        Ok(value) => {
            let response = Response::Ok(value);
            if let Err(err) = write_frame(&mut stream, &response, inner.max_frame_len) {
                warn!(method = %method, error = %err, "reply not delivered; compensating");
                if let Response::Ok(value) = response {
                    inner.service.undelivered(&method, value);
                }
            }
        }
        Err(fault) => {
            debug!(method = %method, fault = %fault, "replying with fault");
            if let Err(err) = write_frame(&mut stream, &Response::Err(fault), inner.max_frame_len) {
                debug!(method = %method, error = %err, "fault reply not delivered");
            }
        }
    }

    stream.finish();
    if let Some(watch) = watch {
        watch.join();
    }
}

/// A successful result has nowhere to go: the connection was torn down, or
/// the peer hung up after the watcher was disarmed.
fn reply_lost(cx: &Cx, watch: Option<&PeerWatch>) -> bool {
    !cx.is_connection_alive() || watch.is_some_and(PeerWatch::peer_hung_up)
}

/// Watches the read half of a served connection for a hangup.
struct PeerWatch {
    armed: Arc<AtomicBool>,
    hung_up: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl PeerWatch {
    fn start(stream: &CallStream, canceller: Canceller) -> io::Result<Self> {
        let mut socket = stream.watch_handle()?;
        let armed = Arc::new(AtomicBool::new(true));
        let hung_up = Arc::new(AtomicBool::new(false));
        let watch_armed = Arc::clone(&armed);
        let watch_hung_up = Arc::clone(&hung_up);
        let name = format!("peer-watch-{}", canceller.unit_id().as_u64());
        let watcher = move || {
            let mut sink = [0_u8; 64];
            loop {
                match socket.read(&mut sink) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            watch_hung_up.store(true, Ordering::Release);
            if watch_armed.load(Ordering::Acquire) {
                info!(unit = %canceller.unit_id(), "peer hung up mid-call");
                canceller.cancel_with(CancelReason::peer_gone());
            }
        };
        let thread = thread::Builder::new().name(name).spawn(watcher)?;
        Ok(Self {
            armed,
            hung_up,
            thread,
        })
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// True once the read half saw EOF or an error, armed or not.
    fn peer_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::Acquire)
    }

    fn join(self) {
        let _ = self.thread.join();
    }
}
