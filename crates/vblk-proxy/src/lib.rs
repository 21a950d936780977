#![warn(missing_docs)]

//! vblk proxy subsystem: wire protocol, framed transports, protocol client
//!
//! This crate implements the message-level protocol spoken between a virtual
//! disk engine and a remote storage provider ("proxy"). It provides the frame
//! codec, a transport abstraction over byte streams, the client that performs
//! capability negotiation and per-operation round-trips, and the cooperative
//! cancellation primitive used to abort blocking round-trips during teardown.

pub mod cancel;
pub mod client;
pub mod error;
pub mod loopback;
pub mod transport;
pub mod wire;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use client::{ProxyCapabilities, ProxyClient};
pub use error::{ProxyError, Result};
pub use loopback::{LoopbackProxy, LoopbackProxyConfig};
pub use transport::{ProxyTransport, StreamTransport, TcpTransport, TcpTransportConfig};
pub use wire::{ByteRange, Frame, FrameHeader, Opcode};
