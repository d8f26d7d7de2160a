//! One connected peer or client.

use chainsync_core::Environment;

use crate::error::Result;
use crate::identity::Capabilities;
use crate::transport::message::{encode_frame, Hello, OpCode};
use crate::transport::pool::{MessageHandle, MessagePool};
use crate::transport::recv::RecvStack;
use crate::transport::send::SendQueue;

#[derive(Debug)]
pub struct Client {
    pub id: u64,
    pub peer_addr: String,
    /// Set once the handshake completes.
    pub server_id: Option<String>,
    pub capabilities: Capabilities,
    pub environment: Option<Environment>,
    /// Originating user context for request/response traffic.
    pub user_id: Option<u64>,
    pub recv: RecvStack,
    pub send: SendQueue,
    pool: MessagePool,
    next_request_id: u64,
}

impl Client {
    pub fn new(id: u64, peer_addr: String, max_send_queue_bytes: usize) -> Self {
        Self {
            id,
            peer_addr,
            server_id: None,
            capabilities: Capabilities::default(),
            environment: None,
            user_id: None,
            recv: RecvStack::new(),
            send: SendQueue::new(max_send_queue_bytes),
            pool: MessagePool::with_capacity(4),
            next_request_id: 1,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.server_id.is_some()
    }

    /// Record the peer's handshake.
    pub fn complete_handshake(&mut self, hello: &Hello) {
        self.server_id = Some(hello.server_id.clone());
        self.capabilities = hello.capabilities;
        self.environment = Some(hello.environment);
    }

    /// Feed socket bytes; returns handles for every completed message.
    /// Handles must be released via [`Client::release`] after dispatch.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<MessageHandle>> {
        self.recv.feed(bytes, &mut self.pool)
    }

    pub fn message(&self, handle: MessageHandle) -> Result<&crate::transport::message::Message> {
        self.pool.get(handle)
    }

    pub fn release(&mut self, handle: MessageHandle) -> Result<()> {
        self.pool.release(handle)
    }

    /// Frame and queue an outbound message; returns the buffer to write
    /// when the queue was idle.
    pub fn enqueue(&mut self, op: OpCode, body: &[u8]) -> Result<Option<Vec<u8>>> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send.enqueue(encode_frame(op, request_id, body))
    }

    /// Tear down parse and send state after a socket error or disconnect.
    pub fn abort(&mut self) {
        self.recv.abort();
        self.send.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::Environment;

    #[test]
    fn handshake_fills_identity() {
        let mut client = Client::new(1, "127.0.0.1:9".to_string(), 1024);
        assert!(!client.is_authenticated());
        client.complete_handshake(&Hello {
            server_id: "node-b".to_string(),
            capabilities: Capabilities::SUBMIT,
            environment: Environment::Stage,
            version: "0.3.0".to_string(),
        });
        assert!(client.is_authenticated());
        assert_eq!(client.server_id.as_deref(), Some("node-b"));
        assert!(client.capabilities.can_submit());
        assert_eq!(client.environment, Some(Environment::Stage));
    }

    #[test]
    fn feed_dispatch_release_cycle() {
        let mut client = Client::new(1, "t".to_string(), 1024);
        let frame = encode_frame(OpCode::Heartbeat, 9, b"");
        let handles = client.feed(&frame).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(
            client.message(handles[0]).unwrap().op,
            Some(OpCode::Heartbeat)
        );
        client.release(handles[0]).unwrap();
    }

    #[test]
    fn enqueue_assigns_increasing_request_ids() {
        let mut client = Client::new(1, "t".to_string(), 1 << 20);
        let a = client.enqueue(OpCode::Chain, b"x").unwrap().unwrap();
        client.send.on_completed();
        let b = client.enqueue(OpCode::Chain, b"x").unwrap().unwrap();
        assert_ne!(a, b, "request ids must differ");
    }
}
