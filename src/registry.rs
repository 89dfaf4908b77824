//! Stream registry: the single source of truth for stream liveness.
//!
//! Every operation takes the lock for exactly one map operation. Callers
//! get an `Arc` back and do all stream or writer work after the lock is
//! released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stream::Stream;

#[derive(Debug)]
pub struct StreamRegistry<T = Stream> {
    streams: Mutex<HashMap<u32, Arc<T>>>,
}

impl<T> Default for StreamRegistry<T> {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> StreamRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new stream. Returns false (and leaves the map untouched) if
    /// the id is already live.
    pub fn insert(&self, id: u32, stream: Arc<T>) -> bool {
        let mut streams = self.streams.lock();
        if streams.contains_key(&id) {
            return false;
        }
        streams.insert(id, stream);
        true
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        self.streams.lock().get(&id).cloned()
    }

    /// Remove a stream; a no-op if it is already gone.
    pub fn remove(&self, id: u32) -> Option<Arc<T>> {
        self.streams.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every remaining stream out of the map (connection teardown).
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.streams.lock().drain().map(|(_, s)| s).collect()
    }
}
