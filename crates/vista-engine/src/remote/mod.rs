//! Remote proxies over the engine's capability traits
//!
//! Every local capability ([`crate::ViewClient`], [`crate::ViewCycleAccess`],
//! `GraphExplorer`, the cycle lease) has a proxy here that speaks CBOR-framed
//! requests over an [`EngineTransport`]. Proxies never retry: a transport
//! failure is fatal to the session, and the push pump synthesizes a final
//! `client_shutdown` so listeners always observe an ending.

mod client;
mod cycle;
mod memory;
mod messages;
mod processor;
mod server;
mod transport;

pub use client::RemoteViewClient;
pub use cycle::{RemoteCycleReference, RemoteGraphExplorer, RemoteViewCycle};
pub use memory::MemoryTransport;
pub use messages::{
    decode, encode, ClientOp, CycleDescription, CycleOp, EngineNotification, EngineRequest,
    EngineResponse, ProcessInfo,
};
pub use processor::RemoteViewProcessor;
pub use server::EngineServer;
pub use transport::EngineTransport;
