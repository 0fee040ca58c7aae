//! Append-only output buffer of one local resource

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct OutputState {
    lines: Vec<String>,
    closed: bool,
}

/// Lines written by a resource's process, readable any number of times
///
/// Readers replay everything written so far and then follow new lines
/// until the log is closed.
#[derive(Debug)]
pub struct OutputLog {
    state: Mutex<OutputState>,
    version: watch::Sender<u64>,
}

impl OutputLog {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(OutputState::default()),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a line; ignored once the log is closed
    pub fn push(&self, line: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.lines.push(line.into());
        }
        self.version.send_modify(|version| *version += 1);
    }

    /// Mark the end of output; followers finish after draining
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.version.send_modify(|version| *version += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every line written so far
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    fn read_from(&self, index: usize) -> (Vec<String>, bool) {
        let state = self.lock();
        let batch = state.lines.get(index..).map(<[String]>::to_vec).unwrap_or_default();
        (batch, state.closed)
    }

    /// Replay the log, then follow it until closed
    pub fn follow(self: &Arc<Self>) -> impl Stream<Item = String> + Send + 'static {
        let log = Arc::clone(self);
        let mut changes = log.version.subscribe();

        async_stream::stream! {
            let mut next = 0;
            loop {
                changes.borrow_and_update();
                let (batch, closed) = log.read_from(next);
                next += batch.len();
                for line in batch {
                    yield line;
                }
                if closed || changes.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_follow_replays_then_follows() {
        let log = Arc::new(OutputLog::new());
        log.push("first");

        let follower = tokio::spawn({
            let log = Arc::clone(&log);
            async move { log.follow().collect::<Vec<_>>().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        log.push("second");
        log.close();

        let lines = timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_closed_log_drains_and_ends() {
        let log = Arc::new(OutputLog::new());
        log.push("a");
        log.push("b");
        log.close();
        log.push("ignored");

        let lines: Vec<_> = log.follow().collect().await;
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(log.len(), 2);
        assert!(log.is_closed());
    }

    #[test]
    fn test_lines_snapshot_is_independent() {
        let log = Arc::new(OutputLog::new());
        log.push("one");
        let snapshot = log.lines();
        log.push("two");
        log.close();

        assert_eq!(snapshot, vec!["one"]);
        let followed: Vec<_> = tokio_test::block_on(log.follow().collect());
        assert_eq!(followed, vec!["one", "two"]);
    }
}
