//! Cluster transport and replication for the chainsync transaction chain.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │            Content layer (external)              │
//! ├─────────────────────────────────────────────────┤
//! │  Replicator                                      │
//! │   ├─ NodeDirectory / IpSet (identity)           │
//! │   ├─ Client per connection                       │
//! │   │    ├─ RecvStack (frame state machine)       │
//! │   │    └─ SendQueue (FIFO, single-flight)       │
//! │   └─ StripeAllocator / SchemaStore (shared)     │
//! ├─────────────────────────────────────────────────┤
//! │  chainsync-core (codec, chain, schema, stripes)  │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod identity;
pub mod replicator;
pub mod transport;

pub use crate::error::{NetError, Result};
pub use crate::identity::{discover_ips, Capabilities, IpSet, NetworkNode, NodeDirectory};
pub use crate::replicator::{ReplicationEvent, Replicator};
pub use crate::transport::{Client, Hello, Message, MessagePool, OpCode, RecvStack, SendQueue};
