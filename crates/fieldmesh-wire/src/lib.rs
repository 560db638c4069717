//! Fieldmesh wire layer: addressed messaging between nodes and routers.
//!
//! Endpoints exchange [`fieldmesh_types::Message`]s over TCP using a
//! length-prefixed multipart frame format. Repeatable messages sit in an
//! outbox until the receiver confirms them or their TTL runs out.
//!
//! ## Architecture
//!
//! - **Node**: embeddable endpoint with an upstream channel, an optional
//!   inbound listener, a dispatch table and a streaming producer helper
//! - **Router**: standalone switch forwarding frames across a tree of
//!   routers, dispatching what is addressed to itself
//! - **Coordinator / Agent**: router profiles for the tree root and for
//!   remote agents
//! - **PeerRegistry**: connected peers, first-contact book and route cache

pub mod agent;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod frame;
pub mod node;
pub mod outbox;
pub mod registry;
pub mod relay;
pub mod router;
pub mod stream;
pub mod transport;

pub use agent::Agent;
pub use coordinator::Coordinator;
pub use dispatch::{Handler, Listens};
pub use error::{WireError, WireResult};
pub use frame::Frame;
pub use node::{Node, SendOptions};
pub use registry::PeerRegistry;
pub use router::{RouteHandler, RouteTable, Router};
pub use stream::StreamHandle;
