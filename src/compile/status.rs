//! `CompileStatus` state machine (§3, §4.4, §8 invariants f/g).
//!
//! Transitions: `None -> Queued -> Compiling -> {Ready | Failed}`;
//! `Ready -> Queued` when the source hash diverges; `Failed -> Queued`
//! after the backoff deadline elapses. Updates are compare-and-swap on
//! the state field, per §5's "Compile-status entries live in a
//! per-procedure cell".

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompileState {
    None = 0,
    Queued = 1,
    Compiling = 2,
    Ready = 3,
    Failed = 4,
}

impl CompileState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CompileState::None,
            1 => CompileState::Queued,
            2 => CompileState::Compiling,
            3 => CompileState::Ready,
            _ => CompileState::Failed,
        }
    }
}

/// Snapshot of a procedure's compile status at a point in time.
#[derive(Debug, Clone)]
pub struct CompileStatusSnapshot {
    pub state: CompileState,
    pub hash: Option<String>,
    pub queued_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Backoff applied after a failed compile, before a re-enqueue is
/// honoured (§4.4: "a subsequent threshold-crossing re-enqueue is
/// ignored until the backoff elapses").
fn backoff_for(retry_count: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count.min(6));
    Duration::from_secs(secs.max(1))
}

/// Thread-safe compile-status cell, one per procedure.
#[derive(Debug)]
pub struct CompileCell {
    state: AtomicU8,
    retry_count: AtomicU64,
    detail: RwLock<CompileDetail>,
}

#[derive(Debug, Default)]
struct CompileDetail {
    hash: Option<String>,
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    last_error: Option<String>,
    backoff_until: Option<Instant>,
}

impl Default for CompileCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(CompileState::None as u8),
            retry_count: AtomicU64::new(0),
            detail: RwLock::new(CompileDetail::default()),
        }
    }
}

impl CompileCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CompileStatusSnapshot {
        let detail = self.detail.read().unwrap();
        CompileStatusSnapshot {
            state: CompileState::from_u8(self.state.load(Ordering::Acquire)),
            hash: detail.hash.clone(),
            queued_at: detail.queued_at,
            started_at: detail.started_at,
            completed_at: detail.completed_at,
            last_error: detail.last_error.clone(),
            retry_count: self.retry_count.load(Ordering::Acquire) as u32,
        }
    }

    pub fn state(&self) -> CompileState {
        CompileState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True when this cell is `Ready` for the given source hash — the
    /// sole condition under which the runtime dispatches through the
    /// compiled tier (§4.3 step 5).
    pub fn is_ready_for(&self, hash: &str) -> bool {
        if self.state() != CompileState::Ready {
            return false;
        }
        self.detail
            .read()
            .unwrap()
            .hash
            .as_deref()
            .map(|h| h == hash)
            .unwrap_or(false)
    }

    /// Attempt to transition into `Queued` for `hash`. Returns `true`
    /// if this call won the race and should enqueue a compile task
    /// (§4.4's "at-most-one concurrent task per (procedure, hash)").
    pub fn try_enqueue(&self, hash: &str) -> bool {
        loop {
            let current = self.state();
            let allowed = match current {
                CompileState::None => true,
                CompileState::Ready => !self.is_ready_for(hash),
                CompileState::Failed => {
                    let detail = self.detail.read().unwrap();
                    detail
                        .backoff_until
                        .map(|deadline| Instant::now() >= deadline)
                        .unwrap_or(true)
                }
                CompileState::Queued | CompileState::Compiling => false,
            };
            if !allowed {
                return false;
            }
            let prev = current as u8;
            if self
                .state
                .compare_exchange(
                    prev,
                    CompileState::Queued as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let mut detail = self.detail.write().unwrap();
                detail.hash = Some(hash.to_string());
                detail.queued_at = Some(Instant::now());
                detail.last_error = None;
                return true;
            }
            // Lost the race to a concurrent transition; re-read and retry
            // only if the state is still one that permits enqueue.
        }
    }

    pub fn mark_compiling(&self) {
        self.state
            .store(CompileState::Compiling as u8, Ordering::Release);
        self.detail.write().unwrap().started_at = Some(Instant::now());
    }

    pub fn mark_ready(&self) {
        self.state.store(CompileState::Ready as u8, Ordering::Release);
        self.detail.write().unwrap().completed_at = Some(Instant::now());
        self.retry_count.store(0, Ordering::Release);
    }

    pub fn mark_failed(&self, error: String) {
        self.state.store(CompileState::Failed as u8, Ordering::Release);
        let retries = self.retry_count.fetch_add(1, Ordering::AcqRel) as u32 + 1;
        let mut detail = self.detail.write().unwrap();
        detail.completed_at = Some(Instant::now());
        detail.last_error = Some(error);
        detail.backoff_until = Some(Instant::now() + backoff_for(retries));
    }

    /// Invalidate this cell because the procedure's source hash
    /// diverged (§4.4 Cache discipline). Leaves the cell `None` so the
    /// next threshold-crossing can re-enqueue immediately.
    pub fn invalidate(&self) {
        self.state.store(CompileState::None as u8, Ordering::Release);
        let mut detail = self.detail.write().unwrap();
        detail.hash = None;
        detail.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_none_state() {
        let cell = CompileCell::new();
        assert_eq!(cell.state(), CompileState::None);
        assert!(!cell.is_ready_for("abc"));
    }

    #[test]
    fn enqueue_then_compile_then_ready_is_visible() {
        let cell = CompileCell::new();
        assert!(cell.try_enqueue("h1"));
        assert_eq!(cell.state(), CompileState::Queued);
        cell.mark_compiling();
        assert_eq!(cell.state(), CompileState::Compiling);
        cell.mark_ready();
        assert!(cell.is_ready_for("h1"));
        assert!(!cell.is_ready_for("h2"));
    }

    #[test]
    fn at_most_one_concurrent_enqueue() {
        let cell = CompileCell::new();
        assert!(cell.try_enqueue("h1"));
        // Already queued: a second enqueue for the same hash must fail.
        assert!(!cell.try_enqueue("h1"));
    }

    #[test]
    fn ready_with_diverged_hash_permits_requeue() {
        let cell = CompileCell::new();
        cell.try_enqueue("h1");
        cell.mark_compiling();
        cell.mark_ready();
        assert!(cell.is_ready_for("h1"));
        // Source changed: h2 != h1, so enqueue for h2 must be allowed.
        assert!(cell.try_enqueue("h2"));
    }

    #[test]
    fn failed_state_blocks_immediate_requeue() {
        let cell = CompileCell::new();
        cell.try_enqueue("h1");
        cell.mark_compiling();
        cell.mark_failed("boom".to_string());
        assert_eq!(cell.state(), CompileState::Failed);
        assert!(!cell.try_enqueue("h1"));
    }

    #[test]
    fn invalidate_resets_to_none() {
        let cell = CompileCell::new();
        cell.try_enqueue("h1");
        cell.mark_compiling();
        cell.mark_ready();
        cell.invalidate();
        assert_eq!(cell.state(), CompileState::None);
        assert!(cell.try_enqueue("h2"));
    }
}
