use std::collections::{BTreeMap, VecDeque};

/// FIFO queues per key sharing one total capacity.
///
/// Regions buffer envelopes per shard while a home is unknown, and shards
/// buffer per entity while it is starting or passivating.
#[derive(Debug)]
pub(crate) struct MessageBuffer<K, M> {
    queues: BTreeMap<K, VecDeque<M>>,
    len: usize,
    capacity: usize,
}

impl<K: Ord + Clone, M> MessageBuffer<K, M> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queues: BTreeMap::new(),
            len: 0,
            capacity,
        }
    }

    /// Append to the queue for `key`. The message is handed back when the
    /// buffer is full.
    pub(crate) fn push(&mut self, key: K, message: M) -> Result<(), M> {
        if self.len >= self.capacity {
            return Err(message);
        }
        self.queues.entry(key).or_default().push_back(message);
        self.len += 1;
        Ok(())
    }

    /// Remove and return everything queued for `key`, oldest first.
    pub(crate) fn take(&mut self, key: &K) -> VecDeque<M> {
        let queue = self.queues.remove(key).unwrap_or_default();
        self.len -= queue.len();
        queue
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.queues.contains_key(key)
    }

    pub(crate) fn queued(&self, key: &K) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.queues.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empty the buffer, yielding every queue.
    pub(crate) fn drain(&mut self) -> Vec<(K, VecDeque<M>)> {
        self.len = 0;
        std::mem::take(&mut self.queues).into_iter().collect()
    }
}
