//! Bounded in-memory tail of tool output.

use std::collections::VecDeque;

/// Keeps the last `capacity` lines pushed into it.
#[derive(Debug, Clone)]
pub struct RollingTail {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl RollingTail {
    /// Creates a tail holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Appends a line, evicting the oldest one when full.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line.into());
    }

    /// The retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// How many lines were evicted.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_lines() {
        let mut tail = RollingTail::new(3);
        for i in 0..10 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.lines(), vec!["line 7", "line 8", "line 9"]);
        assert_eq!(tail.dropped(), 7);
    }

    #[test]
    fn test_zero_capacity() {
        let mut tail = RollingTail::new(0);
        tail.push("x");
        assert!(tail.lines().is_empty());
        assert_eq!(tail.dropped(), 1);
    }
}
