//! Allocation requests submitted by filesystem workers.

use crate::drive::Drive;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Scheduler tick; workers also re-check their request at this interval.
pub const TICK: Duration = Duration::from_millis(100);

/// Ticks an unrefreshed request survives (about six seconds).
pub const REQUEST_TIMEOUT_TICKS: u32 = 60;

/// Declaration order is service priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKind {
    ContinueRead,
    ContinueWrite,
    NewRead,
    NewWrite,
}

impl RequestKind {
    pub fn is_continuation(self) -> bool {
        matches!(self, Self::ContinueRead | Self::ContinueWrite)
    }
}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub kind: RequestKind,
    /// Target tape for reads.
    pub tape_id: Option<u32>,
    /// Assigned drive; set up front for continuations.
    pub drive: Option<Arc<Drive>>,
    pub fulfilled: bool,
    pub timeout: u32,
    pub seq: u64,
}

/// Pending requests keyed by worker identity, at most one per worker.
#[derive(Debug)]
pub struct RequestTable<K> {
    requests: HashMap<K, AllocationRequest>,
    next_seq: u64,
}

impl<K> Default for RequestTable<K> {
    fn default() -> Self {
        Self {
            requests: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Eq + Hash + Copy> RequestTable<K> {
    /// Registers a request, replacing any stale one from the same worker.
    pub fn submit(
        &mut self,
        key: K,
        kind: RequestKind,
        tape_id: Option<u32>,
        drive: Option<Arc<Drive>>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.insert(
            key,
            AllocationRequest {
                kind,
                tape_id,
                drive,
                fulfilled: false,
                timeout: REQUEST_TIMEOUT_TICKS,
                seq,
            },
        );
        seq
    }

    /// Unfulfilled requests in service order: kind priority, then arrival.
    pub fn pending(&self) -> Vec<(K, AllocationRequest)> {
        let mut pending: Vec<(K, AllocationRequest)> = self
            .requests
            .iter()
            .filter(|(_, r)| !r.fulfilled)
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        pending.sort_by_key(|(_, r)| (r.kind, r.seq));
        pending
    }

    /// Marks the request fulfilled if it is still the one that was serviced.
    ///
    /// Returns false when the worker's request vanished or was replaced.
    pub fn fulfil(&mut self, key: K, seq: u64, drive: Option<Arc<Drive>>) -> bool {
        match self.requests.get_mut(&key) {
            Some(request) if request.seq == seq && !request.fulfilled => {
                request.fulfilled = true;
                request.drive = drive;
                true
            }
            _ => false,
        }
    }

    /// Resets the worker's timeout. Returns false if its request is gone.
    pub fn refresh(&mut self, key: K) -> bool {
        match self.requests.get_mut(&key) {
            Some(request) => {
                request.timeout = REQUEST_TIMEOUT_TICKS;
                true
            }
            None => false,
        }
    }

    pub fn take_fulfilled(&mut self, key: K) -> Option<AllocationRequest> {
        if self.requests.get(&key).map(|r| r.fulfilled) == Some(true) {
            self.requests.remove(&key)
        } else {
            None
        }
    }

    pub fn remove(&mut self, key: K) -> Option<AllocationRequest> {
        self.requests.remove(&key)
    }

    /// Decrements every timeout and returns the requests that expired.
    pub fn tick(&mut self) -> Vec<AllocationRequest> {
        let mut expired = Vec::new();
        self.requests.retain(|_, request| {
            request.timeout = request.timeout.saturating_sub(1);
            if request.timeout == 0 {
                expired.push(request.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut table = RequestTable::default();
        table.submit(1u32, RequestKind::NewWrite, None, None);
        table.submit(2, RequestKind::NewRead, Some(3), None);
        table.submit(3, RequestKind::ContinueWrite, None, None);
        table.submit(4, RequestKind::ContinueRead, Some(1), None);
        table.submit(5, RequestKind::NewWrite, None, None);

        let order: Vec<u32> = table.pending().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![4, 3, 2, 1, 5]);
    }

    #[test]
    fn test_resubmit_replaces_stale_request() {
        let mut table = RequestTable::default();
        let first = table.submit(1u32, RequestKind::NewWrite, None, None);
        let second = table.submit(1, RequestKind::NewRead, Some(2), None);
        assert_eq!(table.len(), 1);
        assert!(!table.fulfil(1, first, None));
        assert!(table.fulfil(1, second, None));

        let taken = table.take_fulfilled(1).unwrap();
        assert_eq!(taken.kind, RequestKind::NewRead);
        assert!(table.is_empty());
    }

    #[test]
    fn test_fulfilled_requests_leave_pending() {
        let mut table = RequestTable::default();
        let seq = table.submit(7u32, RequestKind::NewWrite, None, None);
        assert!(table.take_fulfilled(7).is_none());
        table.fulfil(7, seq, None);
        assert!(table.pending().is_empty());
        assert!(table.take_fulfilled(7).is_some());
    }

    #[test]
    fn test_timeout_expiry() {
        let mut table = RequestTable::default();
        table.submit(1u32, RequestKind::NewWrite, None, None);
        table.submit(2u32, RequestKind::NewWrite, None, None);

        for _ in 0..REQUEST_TIMEOUT_TICKS - 1 {
            assert!(table.tick().is_empty());
            assert!(table.refresh(2));
        }
        let expired = table.tick();
        assert_eq!(expired.len(), 1);
        assert!(!table.refresh(1));
        assert!(table.refresh(2));
    }
}
