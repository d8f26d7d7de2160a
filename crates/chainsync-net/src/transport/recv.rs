//! Per-connection receive state machine.
//!
//! Incoming bytes land in a buffer; a stack of frames tracks how far the
//! current message has parsed and how many more bytes the top frame needs
//! before it can progress. A message spanning many socket reads is parsed
//! exactly once: completed prefixes are consumed from the buffer, and a
//! frame that stalls simply waits for its byte count.

use bytes::{Buf, BytesMut};

use chainsync_core::codec::read_inv_u64;
use chainsync_core::ChainError;

use crate::error::{NetError, Result};
use crate::transport::message::OpCode;
use crate::transport::pool::{MessageHandle, MessagePool};

/// Progress marker for the frame on top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the opcode byte.
    Op,
    /// Waiting for request id + body length varints.
    Meta { op: OpCode },
    /// Waiting for the body.
    Body {
        op: OpCode,
        request_id: u64,
        meta_len: usize,
        body_len: usize,
    },
}

#[derive(Debug)]
struct RecvFrame {
    phase: Phase,
    /// Minimum buffered bytes before this frame can make progress.
    needed: usize,
}

/// Hard cap on one message body; anything larger is a protocol violation.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct RecvStack {
    frames: Vec<RecvFrame>,
    buf: BytesMut,
}

impl Default for RecvStack {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvStack {
    pub fn new() -> Self {
        Self {
            frames: vec![RecvFrame {
                phase: Phase::Op,
                needed: 1,
            }],
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed freshly read bytes; complete messages are written into pool
    /// slots and their handles returned in arrival order.
    pub fn feed(&mut self, bytes: &[u8], pool: &mut MessagePool) -> Result<Vec<MessageHandle>> {
        self.buf.extend_from_slice(bytes);
        let mut completed = Vec::new();
        loop {
            let (phase, needed) = {
                let top = self.frames.last().expect("frame stack never empties");
                (top.phase, top.needed)
            };
            if self.buf.len() < needed {
                break;
            }
            match phase {
                Phase::Op => {
                    let op = OpCode::from_u8(self.buf[0])?;
                    self.push(Phase::Meta { op }, 1 + 4);
                }
                Phase::Meta { op } => {
                    // Two varints follow the opcode byte; retry with one
                    // more byte each time they come up short.
                    let mut idx = 1usize;
                    let parsed = read_inv_u64(&self.buf, &mut idx)
                        .and_then(|request_id| Ok((request_id, read_inv_u64(&self.buf, &mut idx)?)));
                    match parsed {
                        Ok((request_id, body_len)) => {
                            let body_len = body_len as usize;
                            if body_len > MAX_BODY_BYTES {
                                return Err(NetError::Transport(format!(
                                    "body of {body_len} bytes exceeds limit"
                                )));
                            }
                            self.push(
                                Phase::Body {
                                    op,
                                    request_id,
                                    meta_len: idx,
                                    body_len,
                                },
                                idx + body_len,
                            );
                        }
                        Err(ChainError::Truncated) => {
                            let needed = self.buf.len() + 1;
                            self.frames.last_mut().expect("top frame").needed = needed;
                        }
                        Err(e) => {
                            return Err(NetError::Transport(format!("bad message header: {e}")))
                        }
                    }
                }
                Phase::Body {
                    op,
                    request_id,
                    meta_len,
                    body_len,
                } => {
                    self.buf.advance(meta_len);
                    let body = self.buf.split_to(body_len);
                    let handle = pool.acquire();
                    let msg = pool.get_mut(handle)?;
                    msg.op = Some(op);
                    msg.request_id = request_id;
                    msg.body.extend_from_slice(&body);
                    completed.push(handle);
                    // Message done: pop back to a fresh opcode frame.
                    self.frames.clear();
                    self.frames.push(RecvFrame {
                        phase: Phase::Op,
                        needed: 1,
                    });
                }
            }
        }
        Ok(completed)
    }

    /// Drop all parse state, e.g. when the connection dies.
    pub fn abort(&mut self) {
        self.frames.clear();
        self.frames.push(RecvFrame {
            phase: Phase::Op,
            needed: 1,
        });
        self.buf.clear();
    }

    fn push(&mut self, phase: Phase, needed: usize) {
        self.frames.push(RecvFrame { phase, needed });
    }
}
