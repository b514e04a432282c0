//! Framelink - Framed Message Protocol Engine
//!
//! One shared asynchronous, framed, cancellable message protocol for a
//! family of cooperating developer-tooling processes (language servers,
//! debug adapters, auxiliary automation servers) over stdio or TCP:
//! Content-Length framing, request/response correlation, cooperative
//! cancellation, method dispatch with deferred execution, and a supervisor
//! that spawns, health-checks, and lazily restarts child processes
//! speaking the same protocol.

pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod matcher;
pub mod process;
pub mod protocol;
pub mod server;

pub use cancel::CancelToken;
pub use client::{ServerInfo, ServiceClient};
pub use connection::{Connection, ConnectionConfig};
pub use dispatch::{DispatchTable, Dispatcher, Module, Outcome, RequestContext};
pub use endpoint::Endpoint;
pub use error::{EndpointError, LinkError, LinkResult, SpawnError};
pub use manager::{ManagerConfig, ManagerState, ServerManager};
pub use matcher::{MatcherRegistry, MessagePattern};
pub use protocol::{Message, Notification, Request, RequestId, Response, RpcError};
pub use server::{Server, ServerConfig};
