use std::collections::VecDeque;
use std::num::NonZero;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct LogStoreImpl {
    entries: VecDeque<String>,
    capacity: NonZero<usize>,
    partial: Vec<u8>,
}

impl LogStoreImpl {
    fn new(capacity: NonZero<usize>) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.get()),
            capacity,
            partial: Vec::with_capacity(256),
        }
    }

    fn push(&mut self, line: String) {
        if self.entries.len() == self.capacity.get() {
            self.entries.pop_front();
        }
        self.entries.push_back(line);

        debug_assert!(self.entries.len() <= self.capacity.get());
    }
}

impl std::io::Write for LogStoreImpl {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.partial.extend_from_slice(buf);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&self.partial[..pos])
                .trim()
                .to_string();
            if !line.is_empty() {
                self.push(line);
            }
            self.partial.drain(..=pos);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Bounded store of recent warning and error log lines,
/// fed by the logger and rendered on the dashboard.
#[derive(Clone, Debug)]
pub(crate) struct LogStore {
    inner: Arc<Mutex<LogStoreImpl>>,
}

impl LogStore {
    #[must_use]
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogStoreImpl::new(capacity))),
        }
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("other users should not panic");
        guard.entries.iter().cloned().collect()
    }
}

impl std::io::Write for LogStore {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().expect("other users should not panic");
        inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::LogStore;
    use crate::nonzero;

    #[test]
    fn wraps_at_capacity() {
        let mut store = LogStore::new(nonzero!(3));

        for i in 0..5 {
            writeln!(store, "line {i}").unwrap();
        }

        assert_eq!(store.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn reassembles_partial_writes() {
        let mut store = LogStore::new(nonzero!(8));

        store.write_all(b"first ha").unwrap();
        store.write_all(b"lf\nsecond\n").unwrap();

        assert_eq!(store.snapshot(), vec!["first half", "second"]);
    }

    #[test]
    fn skips_blank_lines() {
        let mut store = LogStore::new(nonzero!(8));

        store.write_all(b"\n\n  \nentry\n").unwrap();

        assert_eq!(store.snapshot(), vec!["entry"]);
    }
}
