//! Shared playlist of CIDs with a current position.

use std::sync::Arc;

use parking_lot::Mutex;

/// Navigation direction through the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// Ordered CID list plus the index of the playing entry.
///
/// Cloning shares the same list. Entries are raw strings so malformed CIDs
/// from the source list can be removed when a load rejects them.
#[derive(Debug, Clone, Default)]
pub struct Rotation {
    inner: Arc<Mutex<RotationState>>,
}

#[derive(Debug, Default)]
struct RotationState {
    cids: Vec<String>,
    current: Option<usize>,
}

impl Rotation {
    pub fn new(cids: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RotationState {
                cids: cids.into_iter().collect(),
                current: None,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cids.is_empty()
    }

    /// Snapshot of the entries.
    pub fn cids(&self) -> Vec<String> {
        self.inner.lock().cids.clone()
    }

    /// The playing entry.
    pub fn current(&self) -> Option<String> {
        let state = self.inner.lock();
        state.current.and_then(|i| state.cids.get(i).cloned())
    }

    /// Makes `cid` the playing entry. Returns false if it is not listed.
    pub fn set_current(&self, cid: &str) -> bool {
        let mut state = self.inner.lock();
        match state.cids.iter().position(|entry| entry == cid) {
            Some(index) => {
                state.current = Some(index);
                true
            }
            None => false,
        }
    }

    /// Entry one step away in `direction`, wrapping around.
    ///
    /// Without a current entry, `Next` starts at the first and `Previous`
    /// at the last.
    pub fn peek(&self, direction: Direction) -> Option<String> {
        let state = self.inner.lock();
        let len = state.cids.len();
        if len == 0 {
            return None;
        }
        let index = match (state.current, direction) {
            (None, Direction::Next) => 0,
            (None, Direction::Previous) => len - 1,
            (Some(i), Direction::Next) => (i + 1) % len,
            (Some(i), Direction::Previous) => (i + len - 1) % len,
        };
        state.cids.get(index).cloned()
    }

    /// Up to `count` entries following the current one, excluding it.
    pub fn upcoming(&self, count: usize) -> Vec<String> {
        let state = self.inner.lock();
        let len = state.cids.len();
        let start = state.current.map_or(0, |i| i + 1);
        let available = len - usize::from(state.current.is_some());

        (0..count.min(available))
            .filter_map(|offset| state.cids.get((start + offset) % len).cloned())
            .collect()
    }

    /// Removes `cid`. Returns false if it was not listed.
    ///
    /// Removing the current entry moves the position back one step so the
    /// next `Next` lands on the entry that followed it.
    pub fn remove(&self, cid: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(index) = state.cids.iter().position(|entry| entry == cid) else {
            return false;
        };
        state.cids.remove(index);

        state.current = match state.current {
            Some(current) if index < current => Some(current - 1),
            Some(current) if index == current => current.checked_sub(1),
            other => other,
        };
        if state.cids.is_empty() {
            state.current = None;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation(n: usize) -> Rotation {
        Rotation::new((0..n).map(|i| format!("cid{i}")))
    }

    #[test]
    fn test_peek_wraps() {
        let r = rotation(3);
        assert_eq!(r.peek(Direction::Next).as_deref(), Some("cid0"));
        assert_eq!(r.peek(Direction::Previous).as_deref(), Some("cid2"));

        assert!(r.set_current("cid2"));
        assert_eq!(r.peek(Direction::Next).as_deref(), Some("cid0"));
        assert_eq!(r.peek(Direction::Previous).as_deref(), Some("cid1"));
    }

    #[test]
    fn test_upcoming_excludes_current() {
        let r = rotation(4);
        r.set_current("cid2");
        assert_eq!(r.upcoming(3), vec!["cid3", "cid0", "cid1"]);
        assert_eq!(r.upcoming(10).len(), 3);

        let fresh = rotation(2);
        assert_eq!(fresh.upcoming(5), vec!["cid0", "cid1"]);
    }

    #[test]
    fn test_remove_keeps_position() {
        let r = rotation(4);
        r.set_current("cid2");

        assert!(r.remove("cid0"));
        assert_eq!(r.current().as_deref(), Some("cid2"));

        assert!(r.remove("cid2"));
        assert_eq!(r.current().as_deref(), Some("cid1"));
        assert_eq!(r.peek(Direction::Next).as_deref(), Some("cid3"));

        assert!(!r.remove("missing"));
    }

    #[test]
    fn test_clones_share_state() {
        let r = rotation(2);
        let shared = r.clone();
        shared.remove("cid0");
        assert_eq!(r.cids(), vec!["cid1"]);
    }
}
