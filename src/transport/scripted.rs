//! A transport whose transfers are moved along by hand.
//!
//! Nothing is downloaded: every handle starts `Pending` and only changes when
//! the owner calls [`ScriptedTransport::set`]. Useful for hosts that fake
//! downloads and for exercising the coordinator deterministically.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{JobHandle, TransferRequest, TransferSnapshot, Transport};
use crate::error::TransportError;

#[derive(Debug)]
struct Entry {
    request: TransferRequest,
    snapshot: TransferSnapshot,
    disposed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<JobHandle, Entry>,
    dispose_calls: HashMap<JobHandle, usize>,
    begin_calls: usize,
    poll_calls: usize,
    /// When set, `begin` hands back at most this many handles.
    handle_limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    inner: Mutex<Inner>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the snapshot a live handle reports. Ignored once disposed.
    pub fn set(&self, handle: JobHandle, snapshot: TransferSnapshot) {
        if let Some(entry) = self.lock().entries.get_mut(&handle) {
            if !entry.disposed {
                entry.snapshot = snapshot;
            }
        }
    }

    /// Makes `begin` return fewer handles than requested.
    pub fn limit_handles(&self, limit: usize) {
        self.lock().handle_limit = Some(limit);
    }

    /// Every request ever started, in handle order.
    pub fn requests(&self) -> Vec<(JobHandle, TransferRequest)> {
        let inner = self.lock();
        let mut requests: Vec<_> = inner
            .entries
            .iter()
            .map(|(handle, entry)| (*handle, entry.request.clone()))
            .collect();
        requests.sort_by_key(|(handle, _)| *handle);
        requests
    }

    pub fn dispose_count(&self, handle: JobHandle) -> usize {
        self.lock().dispose_calls.get(&handle).copied().unwrap_or(0)
    }

    pub fn begin_calls(&self) -> usize {
        self.lock().begin_calls
    }

    pub fn poll_calls(&self) -> usize {
        self.lock().poll_calls
    }

    pub fn live_handles(&self) -> usize {
        self.lock().entries.values().filter(|e| !e.disposed).count()
    }
}

impl Transport for ScriptedTransport {
    fn begin(&self, requests: &[TransferRequest]) -> Result<Vec<JobHandle>, TransportError> {
        let mut inner = self.lock();
        inner.begin_calls += 1;

        for request in requests {
            if request.url.is_empty() {
                return Err(TransportError::InvalidRequest {
                    url: request.url.clone(),
                    reason: "empty url".to_string(),
                });
            }
        }

        let take = inner.handle_limit.unwrap_or(requests.len()).min(requests.len());
        let mut handles = Vec::with_capacity(take);
        for request in &requests[..take] {
            let handle = JobHandle(inner.next_id);
            inner.next_id += 1;
            inner.entries.insert(
                handle,
                Entry {
                    request: request.clone(),
                    snapshot: TransferSnapshot::pending(),
                    disposed: false,
                },
            );
            handles.push(handle);
        }
        Ok(handles)
    }

    fn poll(&self, handle: JobHandle) -> TransferSnapshot {
        let mut inner = self.lock();
        inner.poll_calls += 1;
        match inner.entries.get(&handle) {
            Some(entry) if !entry.disposed => entry.snapshot.clone(),
            _ => TransferSnapshot::unknown_handle(handle),
        }
    }

    fn dispose(&self, handle: JobHandle) {
        let mut inner = self.lock();
        *inner.dispose_calls.entry(handle).or_insert(0) += 1;
        if let Some(entry) = inner.entries.get_mut(&handle) {
            entry.disposed = true;
        }
    }
}
