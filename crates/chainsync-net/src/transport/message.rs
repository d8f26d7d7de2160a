//! Wire messages.
//!
//! Every message travels as an opcode byte, an invertible request id, an
//! invertible body length, then the body. Chain bodies carry record bytes
//! exactly as the log file stores them.

use chainsync_core::codec::{read_inv_str, read_inv_u64, write_inv_str, write_inv_u64};
use chainsync_core::{ChainError, Environment};

use crate::error::{NetError, Result};
use crate::identity::Capabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// First message on every connection: who the peer is.
    Handshake = 1,
    /// A run of chain record bytes.
    Chain = 2,
    /// Keepalive; a peer silent past the timeout is dropped.
    Heartbeat = 3,
    /// Orderly goodbye.
    Bye = 4,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => OpCode::Handshake,
            2 => OpCode::Chain,
            3 => OpCode::Heartbeat,
            4 => OpCode::Bye,
            other => return Err(NetError::Transport(format!("unknown opcode {other}"))),
        })
    }
}

/// A decoded inbound message. Instances live in the connection's message
/// pool and must be released back to it after dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub op: Option<OpCode>,
    pub request_id: u64,
    pub body: Vec<u8>,
    /// Originating user context, when the opcode handler established one.
    pub user_id: Option<u64>,
}

impl Message {
    pub fn reset(&mut self) {
        self.op = None;
        self.request_id = 0;
        self.body.clear();
        self.user_id = None;
    }
}

/// Encode a complete outbound frame.
pub fn encode_frame(op: OpCode, request_id: u64, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(op as u8);
    write_inv_u64(request_id, &mut out);
    write_inv_u64(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}

/// Handshake body: identity and intent, exchanged before any chain bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub server_id: String,
    pub capabilities: Capabilities,
    pub environment: Environment,
    pub version: String,
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        write_inv_str(&self.server_id, &mut out);
        write_inv_u64(self.capabilities.0 as u64, &mut out);
        write_inv_u64(env_tag(self.environment), &mut out);
        write_inv_str(&self.version, &mut out);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut idx = 0usize;
        let server_id = read_inv_str(body, &mut idx).map_err(bad_hello)?;
        let caps = read_inv_u64(body, &mut idx).map_err(bad_hello)?;
        if caps > u8::MAX as u64 {
            return Err(NetError::Handshake(format!("capability bits {caps:#x}")));
        }
        let environment = env_from_tag(read_inv_u64(body, &mut idx).map_err(bad_hello)?)?;
        let version = read_inv_str(body, &mut idx).map_err(bad_hello)?;
        Ok(Self {
            server_id,
            capabilities: Capabilities(caps as u8),
            environment,
            version,
        })
    }
}

fn bad_hello(e: ChainError) -> NetError {
    NetError::Handshake(format!("malformed hello: {e}"))
}

fn env_tag(env: Environment) -> u64 {
    match env {
        Environment::Dev => 1,
        Environment::Stage => 2,
        Environment::Prod => 3,
    }
}

fn env_from_tag(tag: u64) -> Result<Environment> {
    Ok(match tag {
        1 => Environment::Dev,
        2 => Environment::Stage,
        3 => Environment::Prod,
        other => return Err(NetError::Handshake(format!("unknown environment {other}"))),
    })
}
