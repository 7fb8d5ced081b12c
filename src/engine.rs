//! The experiment engine: a sequential action-list interpreter.
//!
//! An experiment is an ordered list of [`Action`]s executed front to back.
//! The engine is deliberately partial-failure tolerant: a trace that times
//! out becomes a failed record and the run moves on, because one bad trace
//! must not abort a multi-trace protocol. The only things that end a run
//! early are an `EndStep` action and the caller's stop flag.
//!
//! Cancellation is cooperative. `Wait` actions sleep in 10 ms increments and
//! poll the stop flag between sleeps; an in-progress read is bounded by its
//! own timeout instead.

use crate::data::DataSink;
use crate::link::DeviceLink;
use crate::parameter::ParameterSet;
use crate::session::TraceSession;
use crate::trace::TraceRecord;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Granularity of cancellable waits.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Upper bound on a single wait action; keeps the deadline arithmetic away
/// from timer overflow on absurd but finite durations.
const WAIT_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One step of an experiment. Immutable once constructed; insertion order is
/// execution order.
#[derive(Debug, Clone)]
pub enum Action {
    /// Make this the current parameter set and push it to the instrument.
    SetParameters(ParameterSet),
    /// Pause for the given number of seconds, interruptible by stop.
    Wait(f64),
    /// Run one trace with the current parameters.
    ExecuteTrace,
    /// Hand all accumulated records to the data sink.
    SaveData,
    /// Finish the run cleanly.
    EndStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

/// Drives a [`TraceSession`] through an action list, accumulating records.
pub struct ExperimentEngine {
    link: DeviceLink,
    session: TraceSession,
    sink: Box<dyn DataSink>,
    actions: Vec<Action>,
    records: Vec<TraceRecord>,
    current_params: ParameterSet,
    /// Set when the current parameters may not match what the instrument
    /// holds (changed since last push, or the push failed); the next trace
    /// re-pushes them.
    params_dirty: bool,
    trace_cnt: u32,
    rep: u32,
    state: EngineState,
    stop: Arc<AtomicBool>,
}

impl ExperimentEngine {
    pub fn new(link: DeviceLink, sink: Box<dyn DataSink>) -> Self {
        let session = TraceSession::new(link.clone());
        Self {
            link,
            session,
            sink,
            actions: Vec::new(),
            records: Vec::new(),
            current_params: ParameterSet::default(),
            params_dirty: true,
            trace_cnt: 0,
            rep: 0,
            state: EngineState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Completed traces not yet handed to the sink.
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn trace_count(&self) -> u32 {
        self.trace_cnt
    }

    /// Shared stop flag; set it from another task to end the run at the
    /// next yield point.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Replace the action list. With `reset` the trace counter and record
    /// list restart from zero (a new experiment); without it they carry on
    /// (resume, or appending steps to a running record set).
    pub fn load_experiment(&mut self, actions: Vec<Action>, reset: bool) {
        self.actions = actions;
        if reset {
            self.trace_cnt = 0;
            self.rep = 0;
            self.records.clear();
        }
    }

    pub fn push_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Execute the loaded action list in order.
    pub async fn run(&mut self) -> crate::error::AppResult<()> {
        if self.actions.is_empty() {
            warn!("no experiment loaded");
            return Ok(());
        }

        self.stop.store(false, Ordering::Relaxed);
        self.state = EngineState::Running;
        info!("experiment run {} started, {} actions", self.rep, self.actions.len());

        let actions = self.actions.clone();
        for (idx, action) in actions.iter().enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, ending run at action {idx}");
                break;
            }
            debug!("action {idx}: {action:?}");
            match action {
                Action::SetParameters(params) => self.set_parameters(params).await,
                Action::Wait(seconds) => self.wait(*seconds).await,
                Action::ExecuteTrace => self.execute_trace().await,
                Action::SaveData => self.save_data().await,
                Action::EndStep => {
                    info!("experiment finished");
                    break;
                }
            }
        }

        self.rep += 1;
        self.state = EngineState::Idle;
        Ok(())
    }

    async fn set_parameters(&mut self, params: &ParameterSet) {
        self.current_params = params.clone();
        match self.link.send_params(params).await {
            Ok(()) => self.params_dirty = false,
            Err(e) => {
                // The session re-pushes before the next trace.
                warn!("parameter push failed, deferring to next trace: {e}");
                self.params_dirty = true;
            }
        }
    }

    /// Lazy sequence of short sleeps rather than one blocking sleep, so a
    /// stop request takes effect within one slice. Negative or non-finite
    /// wait values are skipped.
    async fn wait(&self, seconds: f64) {
        let Ok(total) = Duration::try_from_secs_f64(seconds) else {
            warn!("skipping invalid wait of {seconds} s");
            return;
        };
        let deadline = Instant::now() + total.min(WAIT_CEILING);
        debug!("waiting {seconds} s");
        while Instant::now() < deadline {
            if self.stop.load(Ordering::Relaxed) {
                debug!("wait interrupted by stop");
                return;
            }
            let remaining = deadline - Instant::now();
            tokio::time::sleep(remaining.min(WAIT_SLICE)).await;
        }
    }

    async fn execute_trace(&mut self) {
        let run = self
            .session
            .run_trace(&self.current_params, self.params_dirty, self.trace_cnt, self.rep)
            .await;
        // Only a confirmed push clears the flag; a push the link dropped
        // leaves the instrument on stale parameters.
        self.params_dirty = !run.params_pushed;
        let record = run.record;
        info!(
            "trace {} ({}): {:?}, {} bytes",
            record.trace_num,
            record.note,
            record.status,
            record.buffer.len()
        );
        self.records.push(record);
        self.trace_cnt += 1;
    }

    async fn save_data(&mut self) {
        let n = self.records.len();
        match self.sink.persist(&mut self.records).await {
            Ok(()) => info!("persisted {n} trace records"),
            Err(e) => warn!("persist failed, {} records retained: {e}", self.records.len()),
        }
    }
}
