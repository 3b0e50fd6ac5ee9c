//! In-memory mock store, partitioned into filtered (candidates) and
//! unfiltered (consumed / fallback) sets.
//!
//! A single mutex guards both partitions. Hot-path readers take a snapshot
//! and iterate without the lock; mutation happens only through `cas` and
//! `delete`, so filtered-to-unfiltered transitions are totally ordered and a
//! lost CAS is a retry signal, never an error.

use crate::mock::Mock;
use std::sync::Mutex;

#[derive(Default)]
struct Partitions {
    filtered: Vec<Mock>,
    unfiltered: Vec<Mock>,
}

#[derive(Default)]
pub struct MockStore {
    inner: Mutex<Partitions>,
}

/// A point-in-time copy of both partitions.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub filtered: Vec<Mock>,
    pub unfiltered: Vec<Mock>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the store contents. Permitted only between replay sessions.
    pub fn load_all(&self, mocks: Vec<Mock>) {
        let mut inner = self.inner.lock().unwrap();
        inner.filtered = mocks
            .iter()
            .filter(|m| m.test_mode_info.is_filtered)
            .cloned()
            .collect();
        inner.unfiltered = mocks
            .into_iter()
            .filter(|m| !m.test_mode_info.is_filtered)
            .collect();
    }

    /// Both partitions by value; callers iterate without holding the lock.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        Snapshot {
            filtered: inner.filtered.clone(),
            unfiltered: inner.unfiltered.clone(),
        }
    }

    /// If `old` is still present in `filtered` with unchanged identity,
    /// atomically replaces it with `new` in `unfiltered`. Returns whether
    /// the replacement happened; a `false` means another task consumed the
    /// mock first.
    pub fn cas(&self, old: &Mock, new: Mock) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.filtered.iter().position(|m| m == old) {
            Some(index) => {
                inner.filtered.remove(index);
                let mut new = new;
                new.test_mode_info.is_filtered = false;
                inner.unfiltered.push(new);
                true
            }
            None => false,
        }
    }

    /// Moves a consumed mock back to `filtered`. Used when a task is
    /// force-terminated after winning a CAS but before delivering the
    /// response.
    pub fn restore(&self, mock: &Mock) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.unfiltered.iter().position(|m| {
            m.name == mock.name && m.kind == mock.kind && m.spec == mock.spec
        }) {
            Some(index) => {
                let mut restored = inner.unfiltered.remove(index);
                restored.test_mode_info.is_filtered = true;
                inner.filtered.push(restored);
                true
            }
            None => false,
        }
    }

    /// Removes from whichever partition holds the mock; idempotent.
    pub fn delete(&self, mock: &Mock) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.filtered.iter().position(|m| m == mock) {
            inner.filtered.remove(index);
            return;
        }
        if let Some(index) = inner
            .unfiltered
            .iter()
            .position(|m| m.name == mock.name && m.kind == mock.kind && m.spec == mock.spec)
        {
            inner.unfiltered.remove(index);
        }
    }

    pub fn filtered_len(&self) -> usize {
        self.inner.lock().unwrap().filtered.len()
    }

    pub fn unfiltered_len(&self) -> usize {
        self.inner.lock().unwrap().unfiltered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{GenericSpec, MockKind, MockSpec};
    use std::sync::Arc;
    use time::OffsetDateTime;

    fn mock(name: &str) -> Mock {
        Mock::new(
            MockKind::Generic,
            name,
            MockSpec::Generic(GenericSpec {
                request: name.as_bytes().to_vec(),
                response: b"resp".to_vec(),
                request_at: OffsetDateTime::UNIX_EPOCH,
                response_at: OffsetDateTime::UNIX_EPOCH,
            }),
            0,
        )
    }

    #[test]
    fn load_partitions_by_flag() {
        let store = MockStore::new();
        let mut consumed = mock("b");
        consumed.test_mode_info.is_filtered = false;
        store.load_all(vec![mock("a"), consumed]);

        assert_eq!(store.filtered_len(), 1);
        assert_eq!(store.unfiltered_len(), 1);
    }

    #[test]
    fn cas_moves_between_partitions() {
        let store = MockStore::new();
        store.load_all(vec![mock("a")]);

        let snapshot = store.snapshot();
        let old = &snapshot.filtered[0];
        assert!(store.cas(old, old.clone()));
        assert_eq!(store.filtered_len(), 0);
        assert_eq!(store.unfiltered_len(), 1);

        let snapshot = store.snapshot();
        assert!(!snapshot.unfiltered[0].test_mode_info.is_filtered);
    }

    #[test]
    fn second_cas_on_same_mock_loses() {
        let store = MockStore::new();
        store.load_all(vec![mock("a")]);

        let old = store.snapshot().filtered[0].clone();
        assert!(store.cas(&old, old.clone()));
        assert!(!store.cas(&old, old.clone()));
        assert_eq!(store.unfiltered_len(), 1);
    }

    #[test]
    fn at_most_once_under_contention() {
        let store = Arc::new(MockStore::new());
        store.load_all(vec![mock("contested")]);

        let old = store.snapshot().filtered[0].clone();
        let mut wins = 0;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let old = old.clone();
                std::thread::spawn(move || store.cas(&old, old.clone()))
            })
            .collect();
        for handle in handles {
            if handle.join().unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.unfiltered_len(), 1);
    }

    #[test]
    fn restore_reverses_consumption() {
        let store = MockStore::new();
        store.load_all(vec![mock("a")]);

        let old = store.snapshot().filtered[0].clone();
        assert!(store.cas(&old, old.clone()));
        assert!(store.restore(&old));
        assert_eq!(store.filtered_len(), 1);
        assert_eq!(store.unfiltered_len(), 0);
        assert!(store.snapshot().filtered[0].test_mode_info.is_filtered);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MockStore::new();
        store.load_all(vec![mock("a")]);

        let target = store.snapshot().filtered[0].clone();
        store.delete(&target);
        store.delete(&target);
        assert_eq!(store.filtered_len(), 0);
    }
}
