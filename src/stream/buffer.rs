use std::collections::VecDeque;

/// Fixed-capacity window over the most recent log lines. A pathological,
/// endlessly logging job evicts its earliest history instead of growing
/// memory without bound.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    appended: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        // A zero capacity would disarm the eviction check entirely.
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            appended: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
    }

    /// Running count of every line ever pushed. Monotonic across eviction
    /// and `clear`, so readers can tail by position instead of length.
    pub fn total_appended(&self) -> u64 {
        self.appended
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
