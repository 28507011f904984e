//! Per-endpoint stream reassembly.
//!
//! Bytes arrive from the transport's receive path via [`Reassembler::feed`]
//! and are consumed by exactly one in-flight reader at a time through
//! [`Reassembler::read`], [`Reassembler::read_exactly`] and
//! [`Reassembler::read_until`]. Attempting a second concurrent read is a
//! programmer error and panics.

use crate::error::KatapultError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

struct State {
    buffer: VecDeque<u8>,
    eof: bool,
}

#[derive(Clone)]
pub struct Reassembler {
    name: Arc<str>,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    busy: Arc<AtomicBool>,
}

/// RAII guard that releases the single-reader lock even if the read is
/// cancelled or times out.
struct ReadGuard(Arc<AtomicBool>);

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reassembler {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Reassembler {
            name: name.into(),
            state: Arc::new(Mutex::new(State {
                buffer: VecDeque::new(),
                eof: false,
            })),
            notify: Arc::new(Notify::new()),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append bytes received from the transport. Called from the reactor,
    /// never from a reader task.
    pub fn feed(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.buffer.extend(data.iter().copied());
        drop(state);
        self.notify.notify_waiters();
    }

    /// Signal that the transport has closed. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.eof = true;
        drop(state);
        self.notify.notify_waiters();
    }

    fn acquire(&self) -> ReadGuard {
        if self.busy.swap(true, Ordering::SeqCst) {
            panic!(
                "Reassembler({}): a second read was started while one was already pending",
                self.name
            );
        }
        ReadGuard(self.busy.clone())
    }

    /// Read up to `n` bytes, returning as soon as at least one byte is
    /// available (or immediately if the buffer is already non-empty).
    pub async fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>, KatapultError> {
        let _guard = self.acquire();
        let deadline = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let fut = async {
            loop {
                let notified = self.notify.notified();
                {
                    let mut state = self.state.lock().unwrap();
                    if !state.buffer.is_empty() {
                        let take = n.min(state.buffer.len());
                        return Ok(state.buffer.drain(..take).collect());
                    }
                    if state.eof {
                        return Err(KatapultError::Eof(self.name.to_string()));
                    }
                }
                notified.await;
            }
        };
        self.with_deadline(fut, deadline).await
    }

    /// Block until exactly `n` bytes are available or the timeout elapses.
    pub async fn read_exactly(
        &self,
        n: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, KatapultError> {
        let _guard = self.acquire();
        let deadline = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let fut = async {
            loop {
                let notified = self.notify.notified();
                {
                    let mut state = self.state.lock().unwrap();
                    if state.buffer.len() >= n {
                        return Ok(state.buffer.drain(..n).collect());
                    }
                    if state.eof {
                        return Err(KatapultError::Eof(self.name.to_string()));
                    }
                }
                notified.await;
            }
        };
        self.with_deadline(fut, deadline).await
    }

    /// Read bytes up through and including the first occurrence of `sep`.
    pub async fn read_until(
        &self,
        sep: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, KatapultError> {
        let _guard = self.acquire();
        let deadline = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let fut = async {
            loop {
                let notified = self.notify.notified();
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(pos) = find_subsequence(&state.buffer, sep) {
                        let end = pos + sep.len();
                        return Ok(state.buffer.drain(..end).collect());
                    }
                    if state.eof {
                        if state.buffer.is_empty() {
                            return Err(KatapultError::Eof(self.name.to_string()));
                        }
                        return Ok(state.buffer.drain(..).collect());
                    }
                }
                notified.await;
            }
        };
        self.with_deadline(fut, deadline).await
    }

    async fn with_deadline<F, T>(&self, fut: F, deadline: Duration) -> Result<T, KatapultError>
    where
        F: std::future::Future<Output = Result<T, KatapultError>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(KatapultError::Timeout {
                endpoint: self.name.to_string(),
                millis: deadline.as_millis() as u64,
            }),
        }
    }
}

fn find_subsequence(haystack: &VecDeque<u8>, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        (0..needle.len()).all(|j| haystack[i + j] == needle[j])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_returns_as_soon_as_any_data_arrives() {
        let r = Reassembler::new("test");
        r.feed(&[1, 2, 3]);
        let data = r.read(10, None).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_exactly_waits_for_full_count() {
        let r = Reassembler::new("test");
        let r2 = r.clone();
        let handle = tokio::spawn(async move { r2.read_exactly(5, None).await });
        tokio::task::yield_now().await;
        r.feed(&[1, 2]);
        tokio::task::yield_now().await;
        r.feed(&[3, 4, 5]);
        let data = handle.await.unwrap().unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn read_until_finds_separator() {
        let r = Reassembler::new("test");
        r.feed(&[0x01, 0x88, 0x99, 0x03, 0xFF]);
        let data = r.read_until(&[0x99, 0x03], None).await.unwrap();
        assert_eq!(data, vec![0x01, 0x88, 0x99, 0x03]);
    }

    #[tokio::test]
    async fn timeout_reports_distinguished_error() {
        let r = Reassembler::new("test");
        let err = r
            .read_exactly(1, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, KatapultError::Timeout { .. }));
    }

    #[tokio::test]
    async fn eof_drains_then_errors() {
        let r = Reassembler::new("test");
        r.feed(&[1, 2, 3]);
        r.close();
        let data = r.read(10, None).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        let err = r.read(10, None).await.unwrap_err();
        assert!(matches!(err, KatapultError::Eof(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "second read was started")]
    async fn concurrent_reads_panic() {
        let r = Reassembler::new("test");
        let r2 = r.clone();
        let _first = tokio::spawn(async move { r2.read_exactly(100, None).await });
        tokio::task::yield_now().await;
        let _ = r.read_exactly(1, Some(Duration::from_millis(10))).await;
    }
}
