use std::{
    fs, io,
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{Context, Result};

/// Persisted monotonic counter naming feedback image/label pairs.
///
/// A single store is shared by every session: the feedback dataset is one
/// global pool, so indices must be unique process-wide and survive restarts.
/// The value on disk always equals the highest index handed out, so it is at
/// least the highest image/label pair on disk; a submission that fails midway
/// can leave unused indices below it, never a reused one.
pub(crate) struct CounterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CounterStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Atomically read, increment, and persist the counter, returning the new
    /// value. Persistence goes through a temp file and rename so a crash can
    /// never leave a torn value behind.
    pub(crate) fn next(&self) -> Result<u64> {
        let _guard = self.lock.lock().unwrap_or_else(|err| err.into_inner());

        let current = match fs::read_to_string(&self.path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .with_context(|| format!("corrupt counter file {}", self.path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read counter file {}", self.path.display())
                });
            }
        };

        let next = current + 1;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, next.to_string())
            .with_context(|| format!("failed to write counter file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace counter file {}", self.path.display()))?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counts_from_zero_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count_frames.txt");

        let store = CounterStore::new(&path);
        assert_eq!(store.next().unwrap(), 1);
        assert_eq!(store.next().unwrap(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "2");

        // A fresh store over the same file resumes where the last one left off.
        let reopened = CounterStore::new(&path);
        assert_eq!(reopened.next().unwrap(), 3);
    }

    #[test]
    fn concurrent_callers_never_share_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CounterStore::new(dir.path().join("count_frames.txt")));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                (0..25).map(|_| store.next().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn rejects_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count_frames.txt");
        fs::write(&path, "not a number").unwrap();

        let store = CounterStore::new(&path);
        assert!(store.next().is_err());
    }
}
