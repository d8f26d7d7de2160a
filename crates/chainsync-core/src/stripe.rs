//! ID striping: collision-free primary keys across the cluster.
//!
//! Each node is configured with disjoint ranges of ids per scope (table).
//! As long as operators never hand two nodes overlapping ranges, ids created
//! concurrently on different nodes can never collide. The allocator does not
//! negotiate new ranges; exhaustion is an operator-facing error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};

/// Inclusive id bounds owned by one node for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeRange {
    pub start: u64,
    pub end: u64,
}

impl StripeRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug)]
struct ScopeState {
    ranges: Vec<StripeRange>,
    active: usize,
    next: u64,
}

#[derive(Debug)]
pub struct StripeAllocator {
    offset: u64,
    scopes: HashMap<String, ScopeState>,
}

impl StripeAllocator {
    pub fn new(offset: u64, stripes: HashMap<String, Vec<StripeRange>>) -> Self {
        let scopes = stripes
            .into_iter()
            .map(|(scope, ranges)| {
                let next = ranges.first().map(|r| r.start).unwrap_or(0);
                (
                    scope,
                    ScopeState {
                        ranges,
                        active: 0,
                        next,
                    },
                )
            })
            .collect();
        Self { offset, scopes }
    }

    /// Global minimum id; nothing below this is ever issued.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next unused id for `scope`. Advances through the configured ranges in
    /// order; never reuses, never wraps.
    pub fn next_id(&mut self, scope: &str) -> Result<u64> {
        let offset = self.offset;
        let state = self
            .scopes
            .get_mut(scope)
            .ok_or_else(|| ChainError::UnknownScope(scope.to_string()))?;
        loop {
            let range = match state.ranges.get(state.active) {
                Some(r) => *r,
                None => return Err(ChainError::StripeExhausted(scope.to_string())),
            };
            if range.is_empty() || range.start < offset {
                return Err(ChainError::OutOfRange {
                    scope: scope.to_string(),
                    id: range.start,
                });
            }
            if state.next < range.start {
                state.next = range.start;
            }
            if state.next > range.end {
                state.active += 1;
                continue;
            }
            let id = state.next;
            state.next += 1;
            return Ok(id);
        }
    }

    /// How many ids remain across every configured range of `scope`.
    pub fn remaining(&self, scope: &str) -> Result<u64> {
        let state = self
            .scopes
            .get(scope)
            .ok_or_else(|| ChainError::UnknownScope(scope.to_string()))?;
        let mut total = 0u64;
        for (i, range) in state.ranges.iter().enumerate().skip(state.active) {
            if i == state.active {
                let from = state.next.max(range.start);
                if from <= range.end {
                    total += range.end - from + 1;
                }
            } else {
                total += range.len();
            }
        }
        Ok(total)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }
}
