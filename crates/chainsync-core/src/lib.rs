pub mod chain;
pub mod codec;
pub mod config;
pub mod error;
pub mod schema;
pub mod stripe;

pub use crate::chain::{ChainLog, ChainRecord, ChainScanner, FieldType, FieldWrite};
pub use crate::config::{ClusterConfig, Environment, PeerConfig};
pub use crate::error::{ChainError, Result};
pub use crate::schema::{Definition, FieldDefinition, SchemaStore};
pub use crate::stripe::{StripeAllocator, StripeRange};
