use std::collections::HashMap;

use infer_data::FrameKey;

/// Counts arrived inference results per frame so a frame is forwarded
/// only once every submitted region has reported back.
///
/// One tracker belongs to exactly one worker; results for the same key
/// never arrive concurrently, so no synchronization is needed here.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    counts: HashMap<FrameKey, u32>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self { counts: HashMap::new() }
    }

    /// Records one arrived result for the key, starting at one.
    pub fn put(&mut self, key: FrameKey) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    /// Removes the key, reporting whether it was tracked at all.
    pub fn erase(&mut self, key: FrameKey) -> bool {
        self.counts.remove(&key).is_some()
    }

    /// True only when the tracked count equals `expected` exactly.
    pub fn is_completed(&self, key: FrameKey, expected: u32) -> bool {
        self.counts.get(&key).is_some_and(|count| *count == expected)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
