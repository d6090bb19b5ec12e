//! The continuous update loop.
//!
//! Each iteration fetches and applies the next batch of changes, indexes the
//! result when anything changed, logs a progress report and then either stops
//! (single run), goes straight into the next iteration, or sleeps for the
//! recheck interval when the replication service had nothing new.
//!
//! The loop is driven as an explicit state machine. [`UpdateLoop::step`]
//! performs exactly one transition, so callers (and tests) can observe every
//! intermediate state; [`UpdateLoop::run`] drives it to completion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::clock::{Clock, SystemClock};
use super::report::Timings;
use super::validate::validate;
use crate::domain::{LoopOptions, LoopParameters, StatusEvent, UpdateOutcome};
use crate::error::Result;
use crate::indexer::{IndexEngine, MAX_RANK};
use crate::replication::ReplicationClient;
use crate::store::{Connector, StatusStore};

/// Result of the fetch step, carried through indexing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    pub outcome: UpdateOutcome,
    pub timings: Timings,
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Apply the next batch
    Fetching,
    /// Index what the last apply changed
    Indexing(Iteration),
    /// Log the progress report
    Reporting(Iteration),
    /// Pick the next state
    Deciding(UpdateOutcome),
    /// Wait before checking the replication service again
    Sleeping(UpdateOutcome, Duration),
    /// Terminal state
    Finished(UpdateOutcome),
}

impl LoopState {
    pub fn is_finished(&self) -> bool {
        matches!(self, LoopState::Finished(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Fetching => "fetching",
            LoopState::Indexing(_) => "indexing",
            LoopState::Reporting(_) => "reporting",
            LoopState::Deciding(_) => "deciding",
            LoopState::Sleeping(..) => "sleeping",
            LoopState::Finished(_) => "finished",
        }
    }
}

/// What follows a completed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Finish,
    Sleep(Duration),
    Continue,
}

/// Pick what follows an iteration that ended with `outcome`.
pub fn decide(outcome: UpdateOutcome, options: &LoopOptions) -> Decision {
    if options.once {
        Decision::Finish
    } else if outcome == UpdateOutcome::NoChanges {
        Decision::Sleep(options.recheck_interval)
    } else {
        Decision::Continue
    }
}

/// Resolves once shutdown was requested. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drives replication updates until told to stop.
pub struct UpdateLoop<C, R, I, K = SystemClock> {
    connector: C,
    client: R,
    indexer: I,
    clock: K,
    params: LoopParameters,
    options: LoopOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<C, R, I> UpdateLoop<C, R, I, SystemClock>
where
    C: Connector,
    R: ReplicationClient,
    I: IndexEngine,
{
    pub fn new(connector: C, client: R, indexer: I, params: LoopParameters, options: LoopOptions) -> Self {
        Self {
            connector,
            client,
            indexer,
            clock: SystemClock,
            params,
            options,
            shutdown: None,
        }
    }
}

impl<C, R, I, K> UpdateLoop<C, R, I, K>
where
    C: Connector,
    R: ReplicationClient,
    I: IndexEngine,
    K: Clock,
{
    /// Replace the time source.
    pub fn with_clock<K2: Clock>(self, clock: K2) -> UpdateLoop<C, R, I, K2> {
        UpdateLoop {
            connector: self.connector,
            client: self.client,
            indexer: self.indexer,
            clock,
            params: self.params,
            options: self.options,
            shutdown: self.shutdown,
        }
    }

    /// Stop at the next iteration boundary once `true` is sent on the channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_pending(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Validate the configuration, then run until the loop finishes.
    ///
    /// Returns the outcome of the last iteration. Any collaborator error
    /// terminates the loop.
    pub async fn run(&mut self) -> Result<UpdateOutcome> {
        validate(&self.params, &self.options)?;

        let mut state = LoopState::Fetching;
        loop {
            state = self.step(state).await?;
            if let LoopState::Finished(outcome) = state {
                log::debug!("Update loop finished with {}", outcome);
                return Ok(outcome);
            }
        }
    }

    /// Perform one state transition.
    pub async fn step(&mut self, state: LoopState) -> Result<LoopState> {
        log::debug!("Update loop state: {}", state.as_str());

        match state {
            LoopState::Fetching => {
                let iteration = self.fetch().await?;
                if iteration.outcome.is_changed() && self.options.do_index {
                    Ok(LoopState::Indexing(iteration))
                } else {
                    Ok(LoopState::Reporting(iteration))
                }
            }

            LoopState::Indexing(mut iteration) => {
                let index_start = self.clock.now();
                iteration.timings.index_start = Some(index_start);
                self.index(index_start).await?;
                Ok(LoopState::Reporting(iteration))
            }

            LoopState::Reporting(iteration) => {
                if log::log_enabled!(log::Level::Info) {
                    log::info!("{}", iteration.timings.report(self.clock.now()));
                }
                Ok(LoopState::Deciding(iteration.outcome))
            }

            LoopState::Deciding(outcome) => match decide(outcome, &self.options) {
                Decision::Finish => Ok(LoopState::Finished(outcome)),
                _ if self.shutdown_pending() => {
                    log::info!("Shutdown requested, stopping updates.");
                    Ok(LoopState::Finished(outcome))
                }
                Decision::Sleep(duration) => {
                    log::info!("No new changes. Sleeping for {} sec.", duration.as_secs());
                    Ok(LoopState::Sleeping(outcome, duration))
                }
                Decision::Continue => Ok(LoopState::Fetching),
            },

            LoopState::Sleeping(outcome, duration) => {
                let interrupted = match self.shutdown.as_mut() {
                    Some(rx) => {
                        tokio::select! {
                            _ = self.clock.sleep(duration) => false,
                            _ = shutdown_requested(rx) => true,
                        }
                    }
                    None => {
                        self.clock.sleep(duration).await;
                        false
                    }
                };

                if interrupted {
                    log::info!("Shutdown requested while sleeping, stopping updates.");
                    Ok(LoopState::Finished(outcome))
                } else {
                    Ok(LoopState::Fetching)
                }
            }

            LoopState::Finished(outcome) => Ok(LoopState::Finished(outcome)),
        }
    }

    /// Apply the next batch over a fresh connection and read back the
    /// resulting batch date. The connection is dropped before returning.
    async fn fetch(&self) -> Result<Iteration> {
        let store = self.connector.connect()?;
        let loop_start = self.clock.now();

        let outcome = self.client.apply(&store, &self.params).await?;
        if outcome.is_changed() {
            store.log_status(loop_start, StatusEvent::Import)?;
        }
        let batch_date = store.get_status()?.batch_date;

        Ok(Iteration {
            outcome,
            timings: Timings {
                loop_start,
                index_start: None,
                batch_date,
            },
        })
    }

    /// Run both indexing phases, then mark the store as indexed.
    async fn index(&self, index_start: DateTime<Utc>) -> Result<()> {
        self.indexer.index_boundaries(0, MAX_RANK).await?;
        self.indexer.index_by_rank(0, MAX_RANK).await?;

        let store = self.connector.connect()?;
        store.set_indexed(true)?;
        store.log_status(index_start, StatusEvent::Index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StatusRecord;
    use crate::domain::params::test_params;
    use crate::error::Error;
    use crate::store::MemoryConnector;
    use crate::update::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn initial_status() -> StatusRecord {
        StatusRecord {
            batch_date: Some(t0() - TimeDelta::hours(1)),
            sequence_id: Some(100),
            indexed: true,
        }
    }

    /// Plays back a list of outcomes. Once the list is exhausted it requests
    /// shutdown and keeps answering NoChanges.
    struct ScriptedClient {
        script: Mutex<VecDeque<UpdateOutcome>>,
        clock: ManualClock,
        apply_duration: Duration,
        batch_date: Option<DateTime<Utc>>,
        shutdown: Option<watch::Sender<bool>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: &[UpdateOutcome], clock: &ManualClock) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                clock: clock.clone(),
                apply_duration: Duration::ZERO,
                batch_date: Some(t0()),
                shutdown: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReplicationClient for ScriptedClient {
        async fn apply<S: StatusStore>(&self, store: &S, _params: &LoopParameters) -> Result<UpdateOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            let next = self.script.lock().unwrap().pop_front();
            let outcome = match next {
                Some(outcome) => outcome,
                None => {
                    if let Some(tx) = &self.shutdown {
                        let _ = tx.send(true);
                    }
                    UpdateOutcome::NoChanges
                }
            };

            if outcome == UpdateOutcome::UpToDate {
                store.set_status(self.batch_date, Some(101 + call), false)?;
            }
            self.clock.advance(self.apply_duration);
            Ok(outcome)
        }
    }

    #[derive(Default)]
    struct RecordingIndexer {
        calls: Mutex<Vec<(&'static str, u8, u8)>>,
        clock: Option<ManualClock>,
        duration: Duration,
        fail: bool,
    }

    impl RecordingIndexer {
        fn with_clock(clock: &ManualClock, duration: Duration) -> Self {
            Self {
                clock: Some(clock.clone()),
                duration,
                ..Default::default()
            }
        }

        fn record(&self, phase: &'static str, min: u8, max: u8) -> Result<usize> {
            self.calls.lock().unwrap().push((phase, min, max));
            if self.fail {
                return Err(Error::Index("worker failed".to_string()));
            }
            if let Some(clock) = &self.clock {
                clock.advance(self.duration);
            }
            Ok(0)
        }

        fn calls(&self) -> Vec<(&'static str, u8, u8)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IndexEngine for RecordingIndexer {
        async fn index_boundaries(&self, min_rank: u8, max_rank: u8) -> Result<usize> {
            self.record("boundaries", min_rank, max_rank)
        }

        async fn index_by_rank(&self, min_rank: u8, max_rank: u8) -> Result<usize> {
            self.record("rank", min_rank, max_rank)
        }
    }

    /// Clock whose sleep never returns.
    struct StuckClock;

    #[async_trait]
    impl Clock for StuckClock {
        fn now(&self) -> DateTime<Utc> {
            t0()
        }

        async fn sleep(&self, _duration: Duration) {
            std::future::pending::<()>().await;
        }
    }

    fn continuous() -> LoopOptions {
        LoopOptions::default()
    }

    fn once(do_index: bool) -> LoopOptions {
        LoopOptions {
            once: true,
            do_index,
            ..Default::default()
        }
    }

    #[test]
    fn test_decide() {
        let recheck = continuous().recheck_interval;
        assert_eq!(decide(UpdateOutcome::NoChanges, &continuous()), Decision::Sleep(recheck));
        assert_eq!(decide(UpdateOutcome::UpToDate, &continuous()), Decision::Continue);
        assert_eq!(decide(UpdateOutcome::MorePending, &continuous()), Decision::Continue);
        assert_eq!(decide(UpdateOutcome::NoChanges, &once(true)), Decision::Finish);
        assert_eq!(decide(UpdateOutcome::UpToDate, &once(false)), Decision::Finish);
    }

    #[tokio::test]
    async fn test_no_op_iteration_sleeps_recheck_interval() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let (tx, rx) = watch::channel(false);
        let mut client = ScriptedClient::new(&[UpdateOutcome::NoChanges], &clock);
        client.shutdown = Some(tx);
        let indexer = RecordingIndexer::default();

        let mut update = UpdateLoop::new(connector.clone(), client, indexer, test_params(), continuous())
            .with_clock(clock.clone())
            .with_shutdown(rx);

        let outcome = update.run().await.unwrap();

        assert_eq!(outcome, UpdateOutcome::NoChanges);
        assert_eq!(update.client.calls(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
        assert!(update.indexer.calls().is_empty());

        let store = connector.connect().unwrap();
        assert!(store.status_log().unwrap().is_empty());
        assert_eq!(store.get_status().unwrap(), initial_status());
    }

    #[tokio::test]
    async fn test_changed_iteration_imports_then_indexes() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let (tx, rx) = watch::channel(false);
        let mut client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);
        client.shutdown = Some(tx);
        client.apply_duration = Duration::from_secs(5);
        let indexer = RecordingIndexer::with_clock(&clock, Duration::from_secs(7));

        let mut update = UpdateLoop::new(connector.clone(), client, indexer, test_params(), continuous())
            .with_clock(clock.clone())
            .with_shutdown(rx);

        update.run().await.unwrap();

        assert_eq!(
            update.indexer.calls(),
            vec![("boundaries", 0, MAX_RANK), ("rank", 0, MAX_RANK)]
        );
        assert!(clock.sleeps().is_empty());

        let store = connector.connect().unwrap();
        let status = store.get_status().unwrap();
        assert!(status.indexed);
        assert_eq!(status.sequence_id, Some(101));

        let log = store.status_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].event, "import");
        assert_eq!(log[0].start_time, t0());
        assert_eq!(log[1].event, "index");
        assert_eq!(log[1].start_time, t0() + TimeDelta::seconds(5));
    }

    #[tokio::test]
    async fn test_more_pending_counts_as_changed() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(StatusRecord {
            indexed: false,
            ..initial_status()
        });
        let client = ScriptedClient::new(&[UpdateOutcome::MorePending], &clock);

        let mut update = UpdateLoop::new(connector.clone(), client, RecordingIndexer::default(), test_params(), once(true))
            .with_clock(clock.clone());

        let outcome = update.run().await.unwrap();

        assert_eq!(outcome, UpdateOutcome::MorePending);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(update.indexer.calls().len(), 2);

        let store = connector.connect().unwrap();
        assert!(store.get_status().unwrap().indexed);
        let events: Vec<String> = store.status_log().unwrap().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["import", "index"]);
    }

    #[tokio::test]
    async fn test_single_run_terminates_with_outcome() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let client = ScriptedClient::new(&[UpdateOutcome::NoChanges, UpdateOutcome::UpToDate], &clock);

        let mut update = UpdateLoop::new(connector, client, RecordingIndexer::default(), test_params(), once(true))
            .with_clock(clock.clone());

        let outcome = update.run().await.unwrap();

        assert_eq!(outcome, UpdateOutcome::NoChanges);
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(update.client.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_single_run_without_indexing() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);

        let mut update =
            UpdateLoop::new(connector.clone(), client, RecordingIndexer::default(), test_params(), once(false))
                .with_clock(clock);

        let outcome = update.run().await.unwrap();

        assert_eq!(outcome.exit_code(), 0);
        assert!(update.indexer.calls().is_empty());
        let store = connector.connect().unwrap();
        assert!(!store.get_status().unwrap().indexed);
        assert_eq!(store.status_log().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_configuration_never_starts() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);
        let mut params = test_params();
        params.base_url = "https://download.geofabrik.de/europe/monaco-updates".to_string();
        params.update_interval = Duration::from_secs(3600);

        let mut update = UpdateLoop::new(connector.clone(), client, RecordingIndexer::default(), params, once(true))
            .with_clock(clock);

        let err = update.run().await.unwrap_err();
        assert!(err.is_usage());
        assert_eq!(update.client.calls(), 0);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_continuous_without_indexing_never_starts() {
        let clock = ManualClock::new(t0());
        let client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);
        let options = LoopOptions {
            do_index: false,
            ..Default::default()
        };

        let mut update = UpdateLoop::new(MemoryConnector::new(), client, RecordingIndexer::default(), test_params(), options)
            .with_clock(clock);

        assert!(update.run().await.unwrap_err().is_usage());
        assert_eq!(update.client.calls(), 0);
    }

    #[tokio::test]
    async fn test_index_failure_propagates_and_keeps_flag() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);
        let indexer = RecordingIndexer {
            fail: true,
            ..Default::default()
        };

        let mut update = UpdateLoop::new(connector.clone(), client, indexer, test_params(), once(true)).with_clock(clock);

        let err = update.run().await.unwrap_err();
        assert!(matches!(err, Error::Index(_)));
        assert_eq!(update.indexer.calls(), vec![("boundaries", 0, MAX_RANK)]);

        let store = connector.connect().unwrap();
        assert!(!store.get_status().unwrap().indexed);
        let events: Vec<String> = store.status_log().unwrap().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["import"]);
    }

    #[tokio::test]
    async fn test_report_timings() {
        let clock = ManualClock::new(t0());
        let connector = MemoryConnector::with_status(initial_status());
        let mut client = ScriptedClient::new(&[UpdateOutcome::UpToDate], &clock);
        client.apply_duration = Duration::from_secs(5);
        client.batch_date = Some(t0() - TimeDelta::seconds(80));
        let indexer = RecordingIndexer::with_clock(&clock, Duration::ZERO);

        let mut update = UpdateLoop::new(connector, client, indexer, test_params(), once(true)).with_clock(clock.clone());

        let state = update.step(LoopState::Fetching).await.unwrap();
        assert_eq!(state.as_str(), "indexing");
        let state = update.step(state).await.unwrap();
        let LoopState::Reporting(iteration) = state else {
            panic!("expected reporting, got {:?}", state);
        };
        clock.advance(Duration::from_secs(15));

        let report = iteration.timings.report(clock.now());
        assert_eq!(report.import, Duration::from_secs(5));
        assert_eq!(report.index, Some(Duration::from_secs(15)));
        assert_eq!(report.total, Duration::from_secs(20));
        assert_eq!(report.backlog, Some(Duration::from_secs(100)));

        let state = update.step(state).await.unwrap();
        assert_eq!(state, LoopState::Deciding(UpdateOutcome::UpToDate));
        let state = update.step(state).await.unwrap();
        assert_eq!(state, LoopState::Finished(UpdateOutcome::UpToDate));
        assert!(state.is_finished());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, rx) = watch::channel(false);
        let clock = ManualClock::new(t0());
        let client = ScriptedClient::new(&[], &clock);
        let mut update = UpdateLoop::new(MemoryConnector::new(), client, RecordingIndexer::default(), test_params(), continuous())
            .with_clock(StuckClock)
            .with_shutdown(rx);

        tx.send(true).unwrap();
        let state = update
            .step(LoopState::Sleeping(UpdateOutcome::NoChanges, Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(state, LoopState::Finished(UpdateOutcome::NoChanges));
    }

    #[tokio::test]
    async fn test_shutdown_checked_at_iteration_boundary() {
        let (tx, rx) = watch::channel(false);
        let clock = ManualClock::new(t0());
        let client = ScriptedClient::new(&[], &clock);
        let mut update = UpdateLoop::new(MemoryConnector::new(), client, RecordingIndexer::default(), test_params(), continuous())
            .with_clock(clock.clone())
            .with_shutdown(rx);

        let state = update.step(LoopState::Deciding(UpdateOutcome::UpToDate)).await.unwrap();
        assert_eq!(state, LoopState::Fetching);

        tx.send(true).unwrap();
        let state = update.step(LoopState::Deciding(UpdateOutcome::UpToDate)).await.unwrap();
        assert_eq!(state, LoopState::Finished(UpdateOutcome::UpToDate));
        assert!(clock.sleeps().is_empty());
    }
}
