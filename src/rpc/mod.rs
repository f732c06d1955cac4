//! Framed request/response calls over the cancellable transport.
//!
//! - [`frame`]: length-prefixed JSON wire format
//! - [`RpcClient`]: one connection per call, driven by the calling unit
//! - [`RpcServer`]: acceptor-becomes-handler units serving a [`Service`]

pub mod client;
pub mod frame;
pub mod server;

pub use client::RpcClient;
pub use frame::{
    DEFAULT_MAX_FRAME_LEN, FaultCode, FrameError, RemoteFault, Request, Response, read_frame,
    write_frame,
};
pub use server::{RpcServer, Service};
