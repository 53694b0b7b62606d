//! Progress Reporter: a single bounded, seq-ordered queue per deployment,
//! drained by a batching sender that pushes status and log events to the
//! API. Mirrors the teacher's `EventLog` (append, batch-write, never lose an
//! event) but trades its JSONL file sink for the API boundary and adds the
//! seq-ordering and back-pressure the spec requires of a live agent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use piped_retry::{RetryPolicy, calculate_delay};
use tracing::warn;

use crate::api::ApiClient;
use crate::cancel::CancellationToken;
use crate::types::{DeploymentId, DeploymentStatus, StageStatus};

#[derive(Debug, Clone)]
pub enum ProgressEventKind {
    StageStatusChanged { stage_index: usize, status: StageStatus, reason: Option<String> },
    StageLog { stage_index: usize, lines: Vec<String> },
    DeploymentStatusChanged { status: DeploymentStatus, reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub deployment_id: DeploymentId,
    pub seq: u64,
    pub kind: ProgressEventKind,
}

struct Queue {
    events: VecDeque<ProgressEvent>,
    next_seq: HashMap<DeploymentId, u64>,
}

/// Producers call [`ProgressReporter::emit`], which blocks once the queue
/// reaches `capacity` rather than dropping — the spec requires the reporter
/// never drop an event.
pub struct ProgressReporter {
    capacity: usize,
    state: Mutex<Queue>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl ProgressReporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(Queue { events: VecDeque::new(), next_seq: HashMap::new() }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue `kind` for `deployment_id`, assigning the next monotone `seq`
    /// for that deployment. Blocks the caller if the queue is at capacity.
    pub fn emit(&self, deployment_id: DeploymentId, kind: ProgressEventKind) {
        let mut state = self.state.lock().expect("progress queue poisoned");
        while state.events.len() >= self.capacity {
            state = self.not_full.wait(state).expect("progress queue poisoned");
        }
        let seq = {
            let entry = state.next_seq.entry(deployment_id.clone()).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };
        state.events.push_back(ProgressEvent { deployment_id, seq, kind });
        self.not_empty.notify_one();
    }

    fn drain_batch(&self, max: usize, wait: Duration) -> Vec<ProgressEvent> {
        let mut state = self.state.lock().expect("progress queue poisoned");
        if state.events.is_empty() {
            let (guard, _timeout) = self
                .not_empty
                .wait_timeout(state, wait)
                .expect("progress queue poisoned");
            state = guard;
        }
        let mut batch = Vec::new();
        while batch.len() < max {
            match state.events.pop_front() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        if !batch.is_empty() {
            self.not_full.notify_all();
        }
        batch
    }

    /// Drain every currently queued event without waiting. Used for a final
    /// flush on shutdown, after the draining [`run`] loop has been stopped.
    pub fn drain_all(&self) -> Vec<ProgressEvent> {
        let mut state = self.state.lock().expect("progress queue poisoned");
        let events: Vec<ProgressEvent> = state.events.drain(..).collect();
        if !events.is_empty() {
            self.not_full.notify_all();
        }
        events
    }
}

/// Drain `reporter` until `cancel` fires, sending each event through `api`
/// with retry-with-backoff on transient failure. A failing send blocks the
/// whole queue rather than skipping ahead, preserving per-deployment order.
pub fn run(
    reporter: &ProgressReporter,
    api: &dyn ApiClient,
    cancel: &CancellationToken,
    batch_size: usize,
    batch_interval: Duration,
) {
    let retry_config = RetryPolicy::Aggressive.to_config();

    while !cancel.is_cancelled() {
        let batch = reporter.drain_batch(batch_size, batch_interval);
        for event in batch {
            send_with_retry(api, &event, &retry_config, cancel);
            if cancel.is_cancelled() {
                return;
            }
        }
    }
}

fn send_with_retry(
    api: &dyn ApiClient,
    event: &ProgressEvent,
    retry_config: &piped_retry::RetryStrategyConfig,
    cancel: &CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = send_once(api, event);
        if result.is_ok() {
            return;
        }
        if cancel.is_cancelled() {
            return;
        }
        warn!(deployment_id = %event.deployment_id.0, seq = event.seq, attempt, "progress send failed; retrying");
        let delay = calculate_delay(retry_config, attempt);
        if cancel.wait_for(delay) {
            return;
        }
    }
}

pub(crate) fn send_once(api: &dyn ApiClient, event: &ProgressEvent) -> anyhow::Result<()> {
    match &event.kind {
        ProgressEventKind::StageStatusChanged { stage_index, status, reason } => api
            .report_stage_status_changed(&event.deployment_id, *stage_index, *status, reason.as_deref())
            .map_err(Into::into),
        ProgressEventKind::StageLog { stage_index, lines } => api
            .report_stage_logs(&event.deployment_id, *stage_index, lines)
            .map_err(Into::into),
        ProgressEventKind::DeploymentStatusChanged { status, reason } => api
            .report_deployment_status_changed(&event.deployment_id, *status, reason.as_deref())
            .map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockApiClient;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn emit_assigns_monotone_seq_per_deployment() {
        let reporter = ProgressReporter::new(16);
        let dep = DeploymentId("d1".to_string());
        reporter.emit(dep.clone(), ProgressEventKind::DeploymentStatusChanged { status: DeploymentStatus::Running, reason: None });
        reporter.emit(dep.clone(), ProgressEventKind::DeploymentStatusChanged { status: DeploymentStatus::Success, reason: None });

        let batch = reporter.drain_batch(16, Duration::from_millis(10));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].seq, 0);
        assert_eq!(batch[1].seq, 1);
    }

    #[test]
    fn drain_batch_respects_max_size() {
        let reporter = ProgressReporter::new(16);
        let dep = DeploymentId("d1".to_string());
        for _ in 0..5 {
            reporter.emit(dep.clone(), ProgressEventKind::StageLog { stage_index: 0, lines: vec!["x".to_string()] });
        }
        let batch = reporter.drain_batch(3, Duration::from_millis(10));
        assert_eq!(batch.len(), 3);
        let rest = reporter.drain_batch(10, Duration::from_millis(10));
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn drain_batch_times_out_when_empty() {
        let reporter = ProgressReporter::new(16);
        let batch = reporter.drain_batch(10, Duration::from_millis(10));
        assert!(batch.is_empty());
    }

    #[test]
    fn emit_blocks_when_queue_full_until_drained() {
        let reporter = Arc::new(ProgressReporter::new(1));
        let dep = DeploymentId("d1".to_string());
        reporter.emit(dep.clone(), ProgressEventKind::StageLog { stage_index: 0, lines: vec!["first".to_string()] });

        let producer_reporter = reporter.clone();
        let producer_dep = dep.clone();
        let handle = thread::spawn(move || {
            producer_reporter.emit(producer_dep, ProgressEventKind::StageLog { stage_index: 0, lines: vec!["second".to_string()] });
        });

        thread::sleep(Duration::from_millis(20));
        let batch = reporter.drain_batch(1, Duration::from_millis(10));
        assert_eq!(batch.len(), 1);
        handle.join().expect("producer joins once space frees up");
    }

    #[test]
    fn run_drains_queue_to_api_then_stops() {
        let reporter = ProgressReporter::new(16);
        let dep = DeploymentId("d1".to_string());
        reporter.emit(
            dep.clone(),
            ProgressEventKind::StageStatusChanged { stage_index: 0, status: StageStatus::Success, reason: None },
        );
        let api = MockApiClient::new();
        let cancel = CancellationToken::new();

        let signaller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signaller.cancel();
        });
        run(&reporter, &api, &cancel, 8, Duration::from_millis(5));
        handle.join().expect("join");

        assert_eq!(api.reported_stage_statuses(), vec![(DeploymentId("d1".to_string()), 0, StageStatus::Success)]);
    }
}
