//! Per-connection outbound queue.
//!
//! Buffers go out strictly in enqueue order, one OS send in flight at a
//! time: `enqueue` hands back a buffer to transmit only when the queue is
//! idle, and each completion hands back the next. The connection task owns
//! the socket write half and drives the queue with those two calls.

use std::collections::VecDeque;

use crate::error::{NetError, Result};

#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<Vec<u8>>,
    in_flight: bool,
    queued_bytes: usize,
    /// Backpressure cap: a peer that lets this much data pile up is too far
    /// behind to keep.
    max_queued_bytes: usize,
}

impl SendQueue {
    pub fn new(max_queued_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: false,
            queued_bytes: 0,
            max_queued_bytes,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.queue.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Queue a buffer. Returns the buffer to transmit right now when no
    /// send is outstanding, `None` when one is (the buffer waits its turn).
    pub fn enqueue(&mut self, buf: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.queued_bytes + buf.len() > self.max_queued_bytes {
            return Err(NetError::Transport(format!(
                "send queue overflow: {} bytes queued",
                self.queued_bytes
            )));
        }
        if self.in_flight {
            self.queued_bytes += buf.len();
            self.queue.push_back(buf);
            return Ok(None);
        }
        self.in_flight = true;
        Ok(Some(buf))
    }

    /// The outstanding send finished; returns the next buffer to transmit,
    /// or `None` when the queue drained.
    pub fn on_completed(&mut self) -> Option<Vec<u8>> {
        debug_assert!(self.in_flight, "completion without an outstanding send");
        match self.queue.pop_front() {
            Some(next) => {
                self.queued_bytes -= next.len();
                Some(next)
            }
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    /// Connection died: discard everything.
    pub fn abort(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_with_simulated_completions() {
        let mut q = SendQueue::new(1024);
        let first = q.enqueue(b"B1".to_vec()).unwrap();
        assert_eq!(first.as_deref(), Some(b"B1".as_slice()));
        assert_eq!(q.enqueue(b"B2".to_vec()).unwrap(), None);
        assert_eq!(q.enqueue(b"B3".to_vec()).unwrap(), None);

        // Peer-observed stream is the concatenation in enqueue order.
        let mut observed = first.unwrap();
        while let Some(next) = q.on_completed() {
            observed.extend_from_slice(&next);
        }
        assert_eq!(observed, b"B1B2B3");
        assert!(q.is_idle());
    }

    #[test]
    fn single_flight_between_completions() {
        let mut q = SendQueue::new(1024);
        assert!(q.enqueue(b"a".to_vec()).unwrap().is_some());
        // While the first send is outstanding nothing else is released.
        assert!(q.enqueue(b"b".to_vec()).unwrap().is_none());
        assert!(q.enqueue(b"c".to_vec()).unwrap().is_none());
        assert_eq!(q.on_completed().as_deref(), Some(b"b".as_slice()));
        // "c" is released only by the next completion.
        assert!(q.enqueue(b"d".to_vec()).unwrap().is_none());
        assert_eq!(q.on_completed().as_deref(), Some(b"c".as_slice()));
        assert_eq!(q.on_completed().as_deref(), Some(b"d".as_slice()));
        assert_eq!(q.on_completed(), None);
        assert!(q.is_idle());
    }

    #[test]
    fn overflow_is_an_error() {
        let mut q = SendQueue::new(4);
        q.enqueue(b"aa".to_vec()).unwrap();
        q.enqueue(b"bb".to_vec()).unwrap();
        assert!(matches!(
            q.enqueue(b"cc".to_vec()),
            Err(NetError::Transport(_))
        ));
    }

    #[test]
    fn abort_discards_queue() {
        let mut q = SendQueue::new(1024);
        q.enqueue(b"a".to_vec()).unwrap();
        q.enqueue(b"b".to_vec()).unwrap();
        q.abort();
        assert!(q.is_idle());
        assert_eq!(q.queued_bytes(), 0);
        // Usable again after abort.
        assert!(q.enqueue(b"c".to_vec()).unwrap().is_some());
    }
}
