//! Priority lanes drained strictly by priority, FIFO within a lane.

use std::collections::VecDeque;

use super::chunk::Priority;

/// Four FIFO lanes, one per [`Priority`].
#[derive(Debug)]
pub struct PriorityLanes<T> {
    critical: VecDeque<T>,
    high: VecDeque<T>,
    normal: VecDeque<T>,
    preload: VecDeque<T>,
}

impl<T> PriorityLanes<T> {
    pub fn new() -> Self {
        Self {
            critical: VecDeque::new(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            preload: VecDeque::new(),
        }
    }

    /// Appends `item` to the lane of `priority`.
    pub fn push(&mut self, priority: Priority, item: T) {
        self.lane_mut(priority).push_back(item);
    }

    /// Removes the oldest item of the highest non-empty lane.
    pub fn pop(&mut self) -> Option<T> {
        self.critical
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.preload.pop_front())
    }

    /// The item `pop` would return next.
    pub fn peek(&self) -> Option<&T> {
        self.critical
            .front()
            .or_else(|| self.high.front())
            .or_else(|| self.normal.front())
            .or_else(|| self.preload.front())
    }

    /// Removes the first item, in drain order, matching `predicate`.
    pub fn take_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        for lane in self.lanes_mut() {
            if let Some(position) = lane.iter().position(&mut predicate) {
                return lane.remove(position);
            }
        }
        None
    }

    /// Keeps only the items matching `predicate`.
    pub fn retain(&mut self, mut predicate: impl FnMut(&T) -> bool) {
        for lane in self.lanes_mut() {
            lane.retain(&mut predicate);
        }
    }

    /// Whether any item matches `predicate`.
    pub fn any(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        [&self.critical, &self.high, &self.normal, &self.preload]
            .into_iter()
            .any(|lane| lane.iter().any(&mut predicate))
    }

    pub fn clear(&mut self) {
        for lane in self.lanes_mut() {
            lane.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.critical.is_empty()
            && self.high.is_empty()
            && self.normal.is_empty()
            && self.preload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.preload.len()
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<T> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Preload => &mut self.preload,
        }
    }

    fn lanes_mut(&mut self) -> [&mut VecDeque<T>; 4] {
        [
            &mut self.critical,
            &mut self.high,
            &mut self.normal,
            &mut self.preload,
        ]
    }
}

impl<T> Default for PriorityLanes<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drains_by_priority_then_fifo() {
        let mut lanes = PriorityLanes::new();
        lanes.push(Priority::Normal, "n1");
        lanes.push(Priority::Preload, "p1");
        lanes.push(Priority::Critical, "c1");
        lanes.push(Priority::Normal, "n2");
        lanes.push(Priority::High, "h1");

        assert_eq!(lanes.peek(), Some(&"c1"));
        let drained: Vec<_> = std::iter::from_fn(|| lanes.pop()).collect();
        assert_eq!(drained, ["c1", "h1", "n1", "n2", "p1"]);
    }

    #[test]
    fn test_retain_and_take_first() {
        let mut lanes = PriorityLanes::new();
        for i in 0..6 {
            lanes.push(Priority::Normal, i);
        }
        lanes.push(Priority::High, 10);

        lanes.retain(|i| *i != 3);
        assert_eq!(lanes.len(), 6);
        assert!(!lanes.any(|i| *i == 3));

        assert_eq!(lanes.take_first(|i| i % 2 == 0), Some(10));
        assert_eq!(lanes.take_first(|i| i % 2 == 1), Some(1));

        lanes.clear();
        assert!(lanes.is_empty());
        assert_eq!(lanes.peek(), None);
    }
}
