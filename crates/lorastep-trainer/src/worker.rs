//! Background training worker.
//!
//! The worker owns at most one [`TrainingSession`] and talks to its host over
//! two unbounded channels: [`HostMessage`] commands in, [`WorkerMessage`]
//! events out. Steps run on the blocking pool; commands are drained between
//! steps, so a pause or stop lands on a step boundary.

use std::path::PathBuf;
use std::sync::Arc;

use lorastep_core::{TrainingCallback, TrainingStatus};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TrainerError};
use crate::progress::should_report;
use crate::protocol::{HostMessage, StatusSnapshot, TrainingRequest, WorkerMessage};
use crate::session::{SessionResources, TrainingSession};

/// Builds the callbacks attached to each new session.
pub type CallbackFactory = Arc<dyn Fn() -> Vec<Box<dyn TrainingCallback>> + Send + Sync>;

/// Host side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    commands: UnboundedSender<HostMessage>,
    events: UnboundedReceiver<WorkerMessage>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue a command.
    pub fn send(&self, message: HostMessage) -> Result<()> {
        self.commands
            .send(message)
            .map_err(|_| TrainerError::WorkerClosed)
    }

    /// Next event; `None` once the worker has exited.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.events.try_recv().ok()
    }

    /// Close the command channel and wait for the worker to exit.
    ///
    /// An active session is stopped first.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            warn!(error = %e, "Training worker exited abnormally");
        }
    }
}

/// Worker configuration.
#[derive(Clone)]
pub struct Worker {
    resources: SessionResources,
    callbacks: Option<CallbackFactory>,
    output: Option<PathBuf>,
}

impl Worker {
    /// Worker building sessions from `resources`.
    pub fn new(resources: SessionResources) -> Self {
        Self {
            resources,
            callbacks: None,
            output: None,
        }
    }

    /// Attach callbacks from `factory` to every session.
    pub fn with_callbacks(mut self, factory: CallbackFactory) -> Self {
        self.callbacks = Some(factory);
        self
    }

    /// Write each completed adapter to `path` before reporting completion.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = WorkerState {
            worker: self,
            session: None,
            last_status: TrainingStatus::Idle,
            events: event_tx,
        };
        let task = tokio::spawn(state.run(command_rx));
        WorkerHandle {
            commands: command_tx,
            events: event_rx,
            task,
        }
    }
}

/// Spawn a worker without callbacks.
pub fn spawn_worker(resources: SessionResources) -> WorkerHandle {
    Worker::new(resources).spawn()
}

struct WorkerState {
    worker: Worker,
    session: Option<TrainingSession>,
    last_status: TrainingStatus,
    events: UnboundedSender<WorkerMessage>,
}

impl WorkerState {
    async fn run(mut self, mut commands: UnboundedReceiver<HostMessage>) {
        loop {
            if self.is_running() {
                match commands.try_recv() {
                    Ok(message) => self.handle(message).await,
                    Err(TryRecvError::Empty) => self.run_step().await,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv().await {
                    Some(message) => self.handle(message).await,
                    None => break,
                }
            }
        }

        if let Some(mut session) = self.session.take() {
            if session.status().is_active() {
                if let Err(e) = session.stop() {
                    warn!(error = %e, "Failed to stop session on worker exit");
                }
            }
        }
        debug!("Training worker exiting");
    }

    fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.status() == TrainingStatus::Running)
    }

    fn emit(&self, message: WorkerMessage) {
        if self.events.send(message).is_err() {
            debug!("Host dropped the event channel");
        }
    }

    fn emit_error(&self, error: &TrainerError) {
        self.emit(WorkerMessage::Error {
            message: error.to_string(),
            step: error.failed_step(),
        });
    }

    async fn handle(&mut self, message: HostMessage) {
        match message {
            HostMessage::InitializeAndStart(request) => self.start(request).await,
            HostMessage::PauseTraining => {
                let result = self.with_session(TrainingSession::pause);
                self.reply(result, |step| WorkerMessage::TrainingPaused { step });
            }
            HostMessage::ResumeTraining => {
                let result = self.with_session(TrainingSession::resume);
                self.reply(result, |step| WorkerMessage::TrainingResumed { step });
            }
            HostMessage::StopTraining => {
                let result = match self.session.take() {
                    Some(mut session) => {
                        let result = session.stop();
                        self.last_status = session.status();
                        if result.is_err() {
                            self.session = Some(session);
                        }
                        result
                    }
                    None => Err(TrainerError::NoSession),
                };
                self.reply(result, |step| WorkerMessage::TrainingStopped { step });
            }
            HostMessage::GetStatus => {
                let snapshot = match &self.session {
                    Some(session) => session.status_snapshot(),
                    None => StatusSnapshot::idle(self.last_status),
                };
                self.emit(WorkerMessage::StatusUpdate(snapshot));
            }
        }
    }

    fn with_session(
        &mut self,
        op: impl FnOnce(&mut TrainingSession) -> Result<usize>,
    ) -> Result<usize> {
        let session = self.session.as_mut().ok_or(TrainerError::NoSession)?;
        let result = op(session);
        self.last_status = session.status();
        result
    }

    fn reply(&self, result: Result<usize>, event: impl FnOnce(usize) -> WorkerMessage) {
        match result {
            Ok(step) => self.emit(event(step)),
            Err(e) => self.emit_error(&e),
        }
    }

    async fn start(&mut self, request: TrainingRequest) {
        if let Some(session) = &self.session {
            if session.status().is_active() {
                self.emit_error(&TrainerError::SessionActive(session.status()));
                return;
            }
        }
        self.session = None;

        let resources = self.worker.resources.clone();
        let initialized =
            tokio::task::spawn_blocking(move || TrainingSession::initialize(request, &resources))
                .await;
        let mut session = match initialized {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "Training session setup failed");
                self.last_status = TrainingStatus::Error;
                self.emit_error(&e);
                return;
            }
            Err(e) => {
                self.last_status = TrainingStatus::Error;
                self.emit_error(&TrainerError::setup(e));
                return;
            }
        };

        if let Some(factory) = &self.worker.callbacks {
            for callback in factory() {
                session.add_callback(callback);
            }
        }
        if let Err(e) = session.start() {
            self.emit_error(&e);
            return;
        }

        self.last_status = session.status();
        self.emit(WorkerMessage::TrainingStarted {
            total_steps: session.state().total_steps,
            dataset_size: session.dataset_size(),
            dataset_tokens: session.dataset_tokens(),
            config: session.config().clone(),
        });
        self.session = Some(session);
    }

    async fn run_step(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || {
            let result = session.step();
            (session, result)
        })
        .await;

        match joined {
            Ok((mut session, Ok(outcome))) => {
                let step = outcome.metrics.step;
                if let Some(change) = &outcome.rank_change {
                    self.emit(WorkerMessage::RankUpdated {
                        old_rank: change.old_rank,
                        new_rank: change.new_rank,
                        step: change.step,
                    });
                }
                if should_report(step, session.state().total_steps) {
                    self.emit(WorkerMessage::TrainingProgress(
                        session.progress_update(&outcome),
                    ));
                }
                if !outcome.finished {
                    self.session = Some(session);
                    return;
                }
                let completed = match &self.worker.output {
                    Some(path) => session.complete_and_save(path),
                    None => session.complete(),
                };
                match completed {
                    Ok(report) => {
                        info!(steps = report.total_steps, "Sending completion report");
                        self.emit(WorkerMessage::TrainingCompleted(Box::new(report)));
                    }
                    Err(e) => {
                        session.fail(&e);
                        self.emit_error(&e);
                    }
                }
                self.last_status = session.status();
            }
            Ok((mut session, Err(e))) => {
                session.fail(&e);
                self.last_status = session.status();
                self.emit_error(&e);
            }
            Err(e) => {
                self.last_status = TrainingStatus::Error;
                self.emit(WorkerMessage::Error {
                    message: format!("Training step panicked: {e}"),
                    step: None,
                });
            }
        }
    }
}
