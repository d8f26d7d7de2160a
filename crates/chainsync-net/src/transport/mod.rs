pub mod client;
pub mod message;
pub mod pool;
pub mod recv;
pub mod send;

pub use client::Client;
pub use message::{encode_frame, Hello, Message, OpCode};
pub use pool::{MessageHandle, MessagePool};
pub use recv::RecvStack;
pub use send::SendQueue;
