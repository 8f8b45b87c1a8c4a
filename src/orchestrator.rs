//! Two-phase collection run.
//!
//! NotStarted -> StatefulPhase -> StatelessPhase -> Finalized
//!
//! - Stateful sources run strictly one after another, with a cool-down
//!   between two of them.
//! - Stateless sources then run concurrently, one task each, under a
//!   per-source timeout and a phase deadline.
//! - Successful observations are merged into history as one batch,
//!   after both phases, never per source.
//!
//! An interrupt (the `CancellationToken`) stops scheduling, ends the
//! in-flight collectors with `Cancelled` once their sessions are closed
//! and skips the history write.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::collector::runner::collect_once;
use crate::collector::session::SessionProvider;
use crate::collector::{Flavor, Source};
use crate::config::ScheduleConfig;
use crate::error::{FailureKind, HistoryError};
use crate::history::{HistoryStore, MergeSummary};
use crate::schema::RateObservation;
use crate::status::{CollectorStatus, StatusBoard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    StatefulPhase,
    StatelessPhase,
    Finalized,
    /// Stopped by an interrupt before finalization
    Interrupted,
}

/// Time budgets of one run.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub stateful_timeout: Duration,
    pub stateless_timeout: Duration,
    pub stateless_phase_timeout: Duration,
    pub cooldown: Duration,
}

impl From<&ScheduleConfig> for Schedule {
    fn from(cfg: &ScheduleConfig) -> Self {
        Self {
            stateful_timeout: cfg.stateful_timeout(),
            stateless_timeout: cfg.stateless_timeout(),
            stateless_phase_timeout: cfg.stateless_phase_timeout(),
            cooldown: cfg.cooldown(),
        }
    }
}

/// Classified result of one source in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub source: String,
    pub bank: &'static str,
    pub result: Result<Decimal, FailureKind>,
}

/// Everything collected by a run that reached finalization.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Successful observations, unordered
    pub observations: Vec<RateObservation>,
    /// One outcome per source, in board order
    pub outcomes: Vec<SourceOutcome>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finalized(Batch),
    Interrupted(Vec<SourceOutcome>),
}

#[derive(Debug)]
pub enum Persisted {
    Written(MergeSummary),
    /// Zero successful observations; history left untouched
    NoData,
    /// Interrupt before finalization; history left untouched
    Interrupted,
    /// The batch was lost
    Failed(HistoryError),
}

#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<SourceOutcome>,
    pub persisted: Persisted,
}

impl RunReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

type Slot = Option<Result<RateObservation, FailureKind>>;

pub struct Orchestrator {
    /// Board order: stateful first, then stateless
    sources: Vec<Source>,
    schedule: Schedule,
    http: reqwest::Client,
    sessions: Arc<dyn SessionProvider>,
    board: Arc<StatusBoard>,
    phase: watch::Sender<RunPhase>,
}

impl Orchestrator {
    /// Sources are reordered stateful-first; relative order inside each
    /// group is kept.
    pub fn new(
        sources: Vec<Source>,
        schedule: Schedule,
        http: reqwest::Client,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        let (mut ordered, stateless): (Vec<Source>, Vec<Source>) = sources
            .into_iter()
            .partition(|s| s.flavor() == Flavor::Stateful);
        ordered.extend(stateless);

        let board = Arc::new(StatusBoard::new(ordered.iter().map(|s| s.id.clone())));
        let (phase, _) = watch::channel(RunPhase::NotStarted);

        Self {
            sources: ordered,
            schedule,
            http,
            sessions,
            board,
            phase,
        }
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    fn enter(&self, phase: RunPhase) {
        info!("run phase: {phase:?}");
        self.phase.send_replace(phase);
    }

    /// Collects, then merges the batch into `store`.
    ///
    /// The write happens only for a finalized batch with at least one
    /// observation. A finalized batch is written even if an interrupt
    /// arrives during the write.
    pub async fn run(&self, store: &HistoryStore, cancel: &CancellationToken) -> RunReport {
        match self.collect(cancel).await {
            RunOutcome::Interrupted(outcomes) => {
                warn!("run interrupted, history not written");
                RunReport {
                    outcomes,
                    persisted: Persisted::Interrupted,
                }
            }
            RunOutcome::Finalized(batch) if batch.observations.is_empty() => {
                warn!("no data collected, history not written");
                RunReport {
                    outcomes: batch.outcomes,
                    persisted: Persisted::NoData,
                }
            }
            RunOutcome::Finalized(batch) => {
                let persisted = match store.merge(&batch.observations).await {
                    Ok(summary) => Persisted::Written(summary),
                    Err(e) => Persisted::Failed(e),
                };
                RunReport {
                    outcomes: batch.outcomes,
                    persisted,
                }
            }
        }
    }

    /// Runs both phases and assembles the batch. Does not touch history.
    pub async fn collect(&self, cancel: &CancellationToken) -> RunOutcome {
        let mut slots: Vec<Slot> = vec![None; self.sources.len()];

        let (stateful, stateless): (Vec<usize>, Vec<usize>) = (0..self.sources.len())
            .partition(|&i| self.sources[i].flavor() == Flavor::Stateful);

        self.enter(RunPhase::StatefulPhase);
        self.stateful_phase(&stateful, &mut slots, cancel).await;

        if !cancel.is_cancelled() {
            self.enter(RunPhase::StatelessPhase);
            self.stateless_phase(&stateless, &mut slots, cancel).await;
        }

        if cancel.is_cancelled() {
            self.enter(RunPhase::Interrupted);
            for (i, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(Err(FailureKind::Cancelled));
                    self.mark_failed_if_running(i);
                }
            }
            return RunOutcome::Interrupted(self.outcomes(&slots));
        }

        let outcomes = self.outcomes(&slots);
        let observations: Vec<RateObservation> = slots
            .into_iter()
            .filter_map(|s| s.and_then(Result::ok))
            .collect();

        info!(
            "run finalized: {}/{} sources produced a rate",
            observations.len(),
            self.sources.len()
        );
        self.enter(RunPhase::Finalized);

        RunOutcome::Finalized(Batch {
            observations,
            outcomes,
        })
    }

    async fn stateful_phase(
        &self,
        order: &[usize],
        slots: &mut [Slot],
        cancel: &CancellationToken,
    ) {
        for (n, &i) in order.iter().enumerate() {
            if n > 0 && !self.schedule.cooldown.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(self.schedule.cooldown) => {}
                }
            }
            if cancel.is_cancelled() {
                return;
            }

            let res = run_one(
                &self.sources[i],
                &self.http,
                self.sessions.as_ref(),
                self.schedule.stateful_timeout,
                &self.board,
                cancel,
            )
            .await;
            slots[i] = Some(res);
        }
    }

    async fn stateless_phase(
        &self,
        order: &[usize],
        slots: &mut [Slot],
        cancel: &CancellationToken,
    ) {
        if order.is_empty() {
            return;
        }

        let mut workers = JoinSet::new();
        for &i in order {
            let source = self.sources[i].clone();
            let http = self.http.clone();
            let sessions = self.sessions.clone();
            let board = self.board.clone();
            let budget = self.schedule.stateless_timeout;
            let cancel = cancel.clone();

            workers.spawn(async move {
                let sessions = sessions.as_ref();
                let res = run_one(&source, &http, sessions, budget, &board, &cancel).await;
                (i, res)
            });
        }

        let deadline = sleep(self.schedule.stateless_phase_timeout);
        tokio::pin!(deadline);

        let unreported = loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((i, res))) => slots[i] = Some(res),
                    Some(Err(e)) => warn!("stateless worker ended abnormally: {e}"),
                    None => break FailureKind::Unreported,
                },
                _ = &mut deadline => {
                    warn!(
                        "stateless phase deadline ({:?}) reached with {} workers outstanding",
                        self.schedule.stateless_phase_timeout,
                        workers.len()
                    );
                    break FailureKind::Unreported;
                }
                _ = cancel.cancelled() => break FailureKind::Cancelled,
            }
        };

        // cancelled workers end on their own with `Cancelled`
        if unreported == FailureKind::Unreported {
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            // a worker may have finished between the deadline and the abort
            if let Ok((i, res)) = joined {
                slots[i] = Some(res);
            }
        }

        for &i in order {
            if slots[i].is_none() {
                slots[i] = Some(Err(unreported));
                self.board.update(&self.sources[i].id, CollectorStatus::Failed, None);
            }
        }
    }

    fn mark_failed_if_running(&self, i: usize) {
        let id = &self.sources[i].id;
        if self.board.status(id) == Some(CollectorStatus::Running) {
            self.board.update(id, CollectorStatus::Failed, None);
        }
    }

    fn outcomes(&self, slots: &[Slot]) -> Vec<SourceOutcome> {
        self.sources
            .iter()
            .zip(slots)
            .map(|(source, slot)| SourceOutcome {
                source: source.id.clone(),
                bank: source.bank_name(),
                result: match slot {
                    Some(Ok(obs)) => Ok(obs.tt_buy_rate()),
                    Some(Err(kind)) => Err(*kind),
                    None => Err(FailureKind::Unreported),
                },
            })
            .collect()
    }
}

/// One source, with board updates around it.
async fn run_one(
    source: &Source,
    http: &reqwest::Client,
    sessions: &dyn SessionProvider,
    budget: Duration,
    board: &StatusBoard,
    cancel: &CancellationToken,
) -> Result<RateObservation, FailureKind> {
    board.update(&source.id, CollectorStatus::Running, None);

    match collect_once(source, http, sessions, budget, cancel).await {
        Ok(obs) => {
            board.update(&source.id, CollectorStatus::Complete, Some(obs.tt_buy_rate()));
            Ok(obs)
        }
        Err(e) => {
            board.update(&source.id, CollectorStatus::Failed, None);
            Err(e.kind())
        }
    }
}
