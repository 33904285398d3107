//! Executes [`transition`] effects: one timer, one status request at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::client::StatusClient;
use super::machine::{transition, Effect, PollEvent, PollPeriods, PollState};
use super::view::PollerView;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerCommand {
    Trigger,
    DismissError,
}

/// Holds the poller's only timer. Arming drops whatever was armed before.
#[derive(Default)]
struct TimerSlot {
    interval: Option<Interval>,
}

impl TimerSlot {
    fn arm(&mut self, period: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    fn clear(&mut self) {
        self.interval = None;
    }

    /// Resolves on the next tick; never resolves while unarmed.
    async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

pub struct Poller {
    client: Arc<dyn StatusClient>,
    periods: PollPeriods,
    state: PollState,
    timer: TimerSlot,
    /// Log checkpoint for the execution currently in view.
    since: Option<DateTime<Utc>>,
    check_requested: bool,
    view: PollerView,
    updates: watch::Sender<PollerView>,
    cancel: CancellationToken,
}

/// Control side of a spawned [`Poller`].
pub struct PollerHandle {
    commands: mpsc::Sender<PollerCommand>,
    view: watch::Receiver<PollerView>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn send(&self, command: PollerCommand) -> Result<(), AppError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::Internal("Poller has stopped".into()))
    }

    pub fn view(&self) -> watch::Receiver<PollerView> {
        self.view.clone()
    }

    /// Stop polling and wait for the loop to exit. Responses still in
    /// flight are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl Poller {
    pub fn new(client: Arc<dyn StatusClient>, periods: PollPeriods) -> Self {
        let view = PollerView::default();
        let (updates, _) = watch::channel(view.clone());
        Self {
            client,
            periods,
            state: PollState::Checking,
            timer: TimerSlot::default(),
            since: None,
            check_requested: false,
            view,
            updates,
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn(self) -> PollerHandle {
        let (tx, rx) = mpsc::channel(16);
        let view = self.updates.subscribe();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(rx));
        PollerHandle { commands: tx, view, cancel, task }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<PollerCommand>) {
        tracing::debug!("Poller started");
        self.check().await;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(PollerCommand::Trigger) => self.trigger().await,
                    Some(PollerCommand::DismissError) => self.dispatch(PollEvent::DismissError),
                    None => break,
                },
                _ = self.timer.tick() => self.check().await,
            }

            while std::mem::take(&mut self.check_requested) && !self.cancel.is_cancelled() {
                self.check().await;
            }
        }

        self.timer.clear();
        tracing::debug!("Poller stopped");
    }

    async fn check(&mut self) {
        let client = self.client.clone();
        let since = self.since;
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = client.job_status(since) => r,
        };
        if self.cancel.is_cancelled() {
            return;
        }

        match result {
            Ok(status) => {
                let switched = status.is_active
                    && self.view.execution_id.is_some()
                    && self.view.execution_id != status.execution_id;
                if switched && self.since.is_some() {
                    // The checkpoint belongs to the previous execution.
                    tracing::info!(execution_id = ?status.execution_id, "New execution, reloading logs");
                    self.since = None;
                    self.check_requested = true;
                } else {
                    self.since = if status.is_active { status.latest_log_timestamp } else { None };
                }
                self.view.apply_status(&status);
                self.dispatch(PollEvent::StatusReported { is_active: status.is_active });
            }
            Err(e) => {
                tracing::warn!("Status check failed: {}", e);
                self.dispatch(PollEvent::StatusFailed(e.to_string()));
            }
        }
    }

    async fn trigger(&mut self) {
        let client = self.client.clone();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = client.trigger() => r,
        };

        let event = match result {
            Ok(outcome) => {
                tracing::info!(operation = %outcome.operation, "Job triggered");
                PollEvent::TriggerAccepted
            }
            Err(AppError::Conflict { execution_id, .. }) => {
                tracing::info!(execution_id = %execution_id, "Job already running");
                PollEvent::TriggerConflict
            }
            Err(e) => {
                tracing::error!("Trigger failed: {}", e);
                PollEvent::TriggerFailed(e.to_string())
            }
        };
        self.dispatch(event);
    }

    fn dispatch(&mut self, event: PollEvent) {
        let (next, effects) = transition(self.state, event, &self.periods);
        if next != self.state {
            tracing::debug!(from = self.state.label(), to = next.label(), "Poller state change");
        }
        self.state = next;
        self.view.state = next;

        for effect in effects {
            match effect {
                Effect::ClearTimer => self.timer.clear(),
                Effect::ArmTimer(period) => self.timer.arm(period),
                Effect::CheckNow => self.check_requested = true,
                Effect::ShowError(message) => self.view.error = Some(message),
                Effect::ClearError => self.view.error = None,
            }
        }
        self.updates.send_replace(self.view.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{JobStatus, LogEntry, StageId, TriggerOutcome};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type TriggerFn = fn() -> Result<TriggerOutcome, AppError>;

    struct FakeClient {
        statuses: Mutex<VecDeque<Result<JobStatus, String>>>,
        on_trigger: TriggerFn,
        delay: Duration,
        started: Instant,
        calls: Mutex<Vec<(u64, Option<DateTime<Utc>>)>>,
    }

    impl FakeClient {
        fn new(statuses: Vec<Result<JobStatus, String>>, on_trigger: TriggerFn) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                on_trigger,
                delay: Duration::ZERO,
                started: Instant::now(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<u64> {
            self.calls.lock().unwrap().iter().map(|c| c.0).collect()
        }
    }

    #[async_trait]
    impl StatusClient for FakeClient {
        async fn job_status(&self, since: Option<DateTime<Utc>>) -> Result<JobStatus, AppError> {
            self.calls
                .lock()
                .unwrap()
                .push((self.started.elapsed().as_secs(), since));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut queue = self.statuses.lock().unwrap();
            let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            next.unwrap_or_else(|| Err("no status scripted".into()))
                .map_err(AppError::Backend)
        }

        async fn trigger(&self) -> Result<TriggerOutcome, AppError> {
            (self.on_trigger)()
        }
    }

    fn accepted() -> Result<TriggerOutcome, AppError> {
        Ok(TriggerOutcome { operation: "op-1".into(), job: "j".into() })
    }

    fn conflict() -> Result<TriggerOutcome, AppError> {
        Err(AppError::Conflict { execution_id: "exec-9".into(), start_time: None })
    }

    fn idle() -> Result<JobStatus, String> {
        Ok(JobStatus::idle(Utc::now()))
    }

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 10, min, 0).unwrap()
    }

    fn running(id: &str, log_min: Option<u32>) -> Result<JobStatus, String> {
        let logs = log_min
            .map(|m| {
                vec![LogEntry {
                    time: String::new(),
                    timestamp: at(m),
                    level: "INFO".into(),
                    message: format!("line {m}"),
                }]
            })
            .unwrap_or_default();
        Ok(JobStatus::active(id.into(), at(0), StageId(1), logs, None, Utc::now()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_follows_state() {
        let client = FakeClient::new(
            vec![idle(), running("e1", Some(1)), running("e1", Some(2)), idle()],
            accepted,
        );
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();

        tokio::time::sleep(Duration::from_secs(71)).await;
        assert_eq!(client.call_times(), vec![0, 30, 35, 40, 70]);
        assert_eq!(handle.view().borrow().state, PollState::Idle);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_checkpoint_tracks_latest_log() {
        let client = FakeClient::new(
            vec![running("e1", Some(3)), running("e1", Some(4)), idle()],
            accepted,
        );
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[1].1, Some(at(3)));
        assert_eq!(calls[2].1, Some(at(4)));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_settles_idle_with_error() {
        let client = FakeClient::new(vec![Err("unreachable".into())], accepted);
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();
        settle().await;

        let view = handle.view().borrow().clone();
        assert_eq!(view.state, PollState::Idle);
        assert_eq!(view.error.as_deref(), Some("Backend error: unreachable"));

        handle.send(PollerCommand::DismissError).await.unwrap();
        settle().await;
        assert!(handle.view().borrow().error.is_none());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_moves_to_active_without_waiting() {
        let client = FakeClient::new(vec![idle(), running("exec-9", None)], conflict);
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();
        settle().await;
        assert_eq!(handle.view().borrow().state, PollState::Idle);

        handle.send(PollerCommand::Trigger).await.unwrap();
        settle().await;
        assert_eq!(handle.view().borrow().state, PollState::Active);
        assert_eq!(client.call_times(), vec![0]);

        // Active cadence from here on.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(client.call_times().len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_trigger_checks_immediately() {
        let client = FakeClient::new(vec![idle(), running("e1", None)], accepted);
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();
        settle().await;

        handle.send(PollerCommand::Trigger).await.unwrap();
        settle().await;
        assert_eq!(client.call_times(), vec![0, 0]);
        assert_eq!(handle.view().borrow().state, PollState::Active);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_in_flight_response() {
        let client = Arc::new(FakeClient {
            statuses: Mutex::new(vec![running("e1", Some(1))].into()),
            on_trigger: accepted,
            delay: Duration::from_secs(10),
            started: Instant::now(),
            calls: Mutex::new(Vec::new()),
        });
        let handle = Poller::new(client.clone(), PollPeriods::default()).spawn();
        settle().await;

        let view = handle.view();
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(view.borrow().state, PollState::Checking);
        assert_eq!(client.call_times(), vec![0]);
    }
}
