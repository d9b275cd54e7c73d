//! Protocol Engine.
//!
//! Executes a list of [`ProtocolStep`]s against the channel registry, the
//! run manager, the registered relay boards and a [`DataSink`].
//!
//! # Per step
//!
//! 1. stop if the abort flag is raised (remaining steps are not completed)
//! 2. resolve `$name` references against the captured variables
//! 3. parse into a typed [`Action`] and dispatch it
//! 4. on failure stop the run, keeping every result gathered so far
//! 5. on success record the result under `capture_as`, if given, and append
//!    a [`CaptureRecord`] to the audit history
//!
//! Whatever happens, every run ends with the safety cleanup: all channel
//! outputs disabled, then every relay opened.  Cleanup failures are logged
//! and never change the run's result.
//!
//! # Run manager bracketing
//!
//! `run` arms and starts the run manager itself (resetting it first when a
//! previous run left it in ERROR) and completes it at the end; a failure
//! leaves it in ERROR with the message.  A run manager that is already
//! RUNNING means another run is in progress, and `run` refuses.
//!
//! While a run is in progress `status/arm`, `status/start` and
//! `status/complete` only report the current state; `status/abort` is the
//! one status step that changes it.  A failure is recorded as ERROR even if
//! the manager is no longer RUNNING by the time the run ends.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ivcore_hal::relay::RelayBoard;
use ivcore_hal::sink::{DataSink, DataTable};
use ivcore_hal::{ChannelRegistry, SmuType};
use ivcore_kernel::{RunManager, RunState};
use ivcore_types::{IvError, Sample};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::protocol::{Action, LoopParams, ProtocolDocument, ProtocolStep, step_path, validate_steps};
use crate::template;

/// Relay board names used by `relays/pixel` and `relays/led`.
pub const PIXEL_BOARD: &str = "pixel";
pub const LED_BOARD: &str = "led";

/// Defaults applied when a step leaves a parameter out.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub default_address: String,
    pub default_smu_type: Option<SmuType>,
    pub default_mock: bool,
    pub data_dir: PathBuf,
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub path: String,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResult {
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub success: bool,
    /// Top-level steps that finished successfully.
    pub steps_completed: usize,
    pub total_steps: usize,
    pub aborted: bool,
    pub stop_reason: StopReason,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub step_results: Vec<StepResult>,
    pub captured_data: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Audit entry appended whenever a step result is captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub step: String,
    pub name: String,
    pub value: Value,
    /// Every other captured variable at the moment of capture.
    pub context: BTreeMap<String, Value>,
}

#[derive(Default)]
struct CaptureStore {
    variables: BTreeMap<String, Value>,
    history: Vec<CaptureRecord>,
}

impl CaptureStore {
    fn capture(&mut self, run_id: Uuid, step: &str, name: &str, value: Value) {
        let context = self
            .variables
            .iter()
            .filter(|(k, _)| k.as_str() != name)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.history.push(CaptureRecord {
            timestamp: Utc::now(),
            run_id,
            step: step.to_string(),
            name: name.to_string(),
            value: value.clone(),
            context,
        });
        self.variables.insert(name.to_string(), value);
    }
}

enum Flow {
    Continue,
    Stop(StopReason),
}

struct ExecContext {
    run_id: Uuid,
    step_results: Vec<StepResult>,
    failure: Option<(String, IvError)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ProtocolEngine {
    registry: Arc<ChannelRegistry>,
    run_manager: Arc<RunManager>,
    sink: Arc<dyn DataSink>,
    boards: Mutex<BTreeMap<String, Box<dyn RelayBoard>>>,
    captures: Mutex<CaptureStore>,
    options: EngineOptions,
    running: AtomicBool,
}

impl ProtocolEngine {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        run_manager: Arc<RunManager>,
        sink: Arc<dyn DataSink>,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            run_manager,
            sink,
            boards: Mutex::new(BTreeMap::new()),
            captures: Mutex::new(CaptureStore::default()),
            options,
            running: AtomicBool::new(false),
        }
    }

    /// Register (or replace) a relay board under `name`.
    pub fn register_board(&self, name: impl Into<String>, board: Box<dyn RelayBoard>) {
        let name = name.into();
        info!(board = %name, relays = board.channel_count(), "relay board registered");
        self.boards.lock().insert(name, board);
    }

    pub fn board_names(&self) -> Vec<String> {
        self.boards.lock().keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Variables captured by the current (or last) run.
    pub fn captured(&self) -> BTreeMap<String, Value> {
        self.captures.lock().variables.clone()
    }

    /// Every capture since this engine was created.
    pub fn capture_history(&self) -> Vec<CaptureRecord> {
        self.captures.lock().history.clone()
    }

    pub fn run_document(&self, document: &ProtocolDocument) -> ProtocolResult {
        let mut result = self.run(&document.steps);
        result.protocol = Some(document.name.clone());
        result
    }

    /// Execute `steps` to completion, abort or first failure.
    pub fn run(&self, steps: &[ProtocolStep]) -> ProtocolResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = steps.len();
        let _span = info_span!("protocol", %run_id, steps = total).entered();

        let mut ctx = ExecContext {
            run_id,
            step_results: Vec::new(),
            failure: None,
        };

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("protocol already running; refusing");
            ctx.failure = Some((String::new(), IvError::Busy("a protocol is already running".into())));
            return self.finish(ctx, 0, total, StopReason::Failed, started_at, clock, false);
        }

        if let Err(e) = self.begin_cycle() {
            self.running.store(false, Ordering::SeqCst);
            ctx.failure = Some((String::new(), e));
            return self.finish(ctx, 0, total, StopReason::Failed, started_at, clock, false);
        }

        self.captures.lock().variables.clear();
        self.run_manager.set_progress(0, total);
        info!(steps = total, "protocol started");

        let mut completed = 0;
        let reason = match validate_steps(steps) {
            Err(e) => {
                error!(error = %e, "protocol rejected before execution");
                let path = match &e {
                    IvError::Protocol { step, .. } => step.clone(),
                    _ => String::new(),
                };
                ctx.failure = Some((path, e));
                StopReason::Failed
            }
            Ok(()) => {
                let mut reason = StopReason::Completed;
                for (i, step) in steps.iter().enumerate() {
                    if self.run_manager.is_abort_requested() {
                        warn!(step = i + 1, "protocol aborted");
                        reason = StopReason::Aborted;
                        break;
                    }
                    match self.exec_step(step, step_path(None, i), &mut ctx) {
                        Flow::Continue => {
                            completed += 1;
                            self.run_manager.set_progress(completed, total);
                        }
                        Flow::Stop(r) => {
                            reason = r;
                            break;
                        }
                    }
                }
                if reason == StopReason::Completed && self.run_manager.is_abort_requested() {
                    reason = StopReason::Aborted;
                }
                reason
            }
        };

        self.safety_cleanup();
        self.end_cycle(reason, ctx.failure.as_ref().map(|(_, e)| e));
        self.running.store(false, Ordering::SeqCst);
        self.finish(ctx, completed, total, reason, started_at, clock, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: ExecContext,
        completed: usize,
        total: usize,
        reason: StopReason,
        started_at: DateTime<Utc>,
        clock: Instant,
        include_captures: bool,
    ) -> ProtocolResult {
        let (failed_step, error) = match ctx.failure {
            Some((path, e)) => ((!path.is_empty()).then_some(path), Some(e.to_string())),
            None => (None, None),
        };
        let captured_data = if include_captures { self.captured() } else { BTreeMap::new() };
        let result = ProtocolResult {
            run_id: ctx.run_id,
            protocol: None,
            success: reason == StopReason::Completed,
            steps_completed: completed,
            total_steps: total,
            aborted: reason == StopReason::Aborted,
            stop_reason: reason,
            error,
            failed_step,
            step_results: ctx.step_results,
            captured_data,
            started_at,
            duration_ms: clock.elapsed().as_secs_f64() * 1e3,
        };
        match reason {
            StopReason::Completed => info!(steps = completed, "protocol completed"),
            StopReason::Aborted => warn!(steps = completed, total, "protocol stopped by abort"),
            StopReason::Failed => error!(
                step = result.failed_step.as_deref().unwrap_or("-"),
                error = result.error.as_deref().unwrap_or("-"),
                "protocol failed"
            ),
        }
        result
    }

    // ────────────────────────────────────────────────────────────────────────
    // Run manager bracketing
    // ────────────────────────────────────────────────────────────────────────

    fn begin_cycle(&self) -> Result<(), IvError> {
        let rm = &self.run_manager;
        let ok = match rm.state() {
            RunState::Running => {
                return Err(IvError::Busy("run manager is already RUNNING".into()));
            }
            RunState::Armed => rm.start(),
            RunState::Idle => rm.arm() && rm.start(),
            RunState::Error | RunState::Aborted => rm.reset() && rm.arm() && rm.start(),
        };
        if ok {
            Ok(())
        } else {
            Err(IvError::Busy(format!(
                "run manager could not be started from {}",
                rm.state()
            )))
        }
    }

    fn end_cycle(&self, reason: StopReason, failure: Option<&IvError>) {
        let rm = &self.run_manager;
        match (reason, failure) {
            (StopReason::Failed, Some(e)) => {
                rm.fail(&e.to_string());
            }
            _ => {
                if rm.state() == RunState::Running {
                    rm.complete();
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Step execution
    // ────────────────────────────────────────────────────────────────────────

    fn exec_step(&self, step: &ProtocolStep, path: String, ctx: &mut ExecContext) -> Flow {
        let started = Instant::now();
        let params = {
            let store = self.captures.lock();
            template::resolve(&Value::Object(step.params.clone()), &store.variables)
        };
        debug!(step = %path, action = %step.action, "executing step");

        let outcome = match Action::parse(&step.action, params) {
            Ok(Action::Loop(lp)) => match self.exec_loop(&lp, &step.steps, &path, ctx) {
                Ok((value, Flow::Continue)) => Ok(value),
                Ok((value, Flow::Stop(reason))) => {
                    ctx.step_results.push(StepResult {
                        path,
                        action: step.action.clone(),
                        success: false,
                        result: Some(value),
                        error: Some(format!("loop stopped ({reason:?})").to_lowercase()),
                        duration_ms: elapsed_ms(started),
                    });
                    return Flow::Stop(reason);
                }
                Err(e) => Err(e),
            },
            Ok(action) => self.dispatch(action),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => {
                if let Some(name) = &step.capture_as {
                    self.captures.lock().capture(ctx.run_id, &path, name, value.clone());
                    info!(step = %path, variable = %name, "captured");
                }
                ctx.step_results.push(StepResult {
                    path,
                    action: step.action.clone(),
                    success: true,
                    result: Some(value),
                    error: None,
                    duration_ms: elapsed_ms(started),
                });
                Flow::Continue
            }
            Err(e) => {
                error!(step = %path, action = %step.action, error = %e, "step failed");
                ctx.step_results.push(StepResult {
                    path: path.clone(),
                    action: step.action.clone(),
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    duration_ms: elapsed_ms(started),
                });
                if ctx.failure.is_none() {
                    ctx.failure = Some((path, e));
                }
                Flow::Stop(StopReason::Failed)
            }
        }
    }

    fn exec_loop(
        &self,
        params: &LoopParams,
        body: &[ProtocolStep],
        path: &str,
        ctx: &mut ExecContext,
    ) -> Result<(Value, Flow), IvError> {
        let values = params.iteration_values()?;
        let mut done = 0usize;

        for (n, value) in values.iter().enumerate() {
            if self.run_manager.is_abort_requested() {
                return Ok((loop_summary(params, done), Flow::Stop(StopReason::Aborted)));
            }
            self.captures
                .lock()
                .variables
                .insert(params.variable.clone(), value.clone());
            debug!(step = %path, variable = %params.variable, %value, "loop iteration");

            let prefix = format!("{path}[{}]", n + 1);
            for (i, step) in body.iter().enumerate() {
                if self.run_manager.is_abort_requested() {
                    return Ok((loop_summary(params, done), Flow::Stop(StopReason::Aborted)));
                }
                if let Flow::Stop(reason) = self.exec_step(step, step_path(Some(&prefix), i), ctx) {
                    return Ok((loop_summary(params, done), Flow::Stop(reason)));
                }
            }
            done += 1;
        }
        Ok((loop_summary(params, done), Flow::Continue))
    }

    fn dispatch(&self, action: Action) -> Result<Value, IvError> {
        let reg = &self.registry;
        let rm = &self.run_manager;
        match action {
            Action::Wait(p) => {
                let duration = Duration::try_from_secs_f64(p.seconds).map_err(|_| {
                    IvError::InvalidArgument(format!("invalid wait of {} s", p.seconds))
                })?;
                let finished = rm.sleep(duration);
                Ok(json!({ "seconds": p.seconds, "interrupted": !finished }))
            }

            Action::SmuConnect(p) => {
                let address = p
                    .address
                    .filter(|a| !a.trim().is_empty())
                    .unwrap_or_else(|| self.options.default_address.clone());
                if address.is_empty() {
                    return Err(IvError::InvalidArgument(
                        "no SMU address given and no default configured".into(),
                    ));
                }
                let smu_type = match p.smu_type {
                    Some(tag) => SmuType::parse_tag(&tag)?,
                    None => self.options.default_smu_type,
                };
                let mock = p.mock.unwrap_or(self.options.default_mock);
                to_json(reg.connect(&address, smu_type, mock, p.channel)?)
            }
            Action::SmuDisconnect(_) => {
                reg.disconnect()?;
                Ok(json!({ "disconnected": true }))
            }
            Action::SmuConfigure(p) => {
                reg.configure(p.channel, p.compliance, p.compliance_type, p.nplc)?;
                to_json(&p)
            }
            Action::SmuSourceMode(p) => {
                reg.set_source_mode(p.channel, p.mode)?;
                Ok(json!({ "channel": p.channel, "mode": p.mode }))
            }
            Action::SmuSet(p) => {
                reg.set_value(p.channel, p.value)?;
                Ok(json!({ "channel": p.channel, "value": p.value }))
            }
            Action::SmuOutput(p) => {
                reg.output_control(p.channel, p.enabled)?;
                Ok(json!({ "channel": p.channel, "enabled": p.enabled }))
            }
            Action::SmuMeasure(p) => to_json(reg.measure(p.channel)?),
            Action::SmuSweep(p) => to_json(reg.sweep(p.channel, &p.to_request())?),
            Action::SmuListSweep(p) => to_json(reg.list_sweep(p.channel, &p.to_request())?),
            Action::SmuCurrentLimit(p) => {
                reg.set_current_limit(p.channel, p.limit)?;
                Ok(json!({ "channel": p.channel, "limit": p.limit }))
            }

            Action::RelaysPixel(p) => self.select_relay(PIXEL_BOARD, p.pixel_id),
            Action::RelaysLed(p) => self.select_relay(LED_BOARD, p.channel_id),
            Action::RelaysSelect(p) => self.select_relay(&p.board, p.index),
            Action::RelaysAllOff(p) => {
                let opened = self.on_boards(p.board.as_deref(), |b| b.all_off())?;
                Ok(json!({ "opened": opened }))
            }
            Action::RelaysConnect(p) => {
                let connected = self.on_boards(p.board.as_deref(), |b| b.connect())?;
                Ok(json!({ "connected": connected }))
            }
            Action::RelaysDisconnect(p) => {
                let disconnected = self.on_boards(p.board.as_deref(), |b| b.disconnect())?;
                Ok(json!({ "disconnected": disconnected }))
            }

            // The running protocol owns the cycle; only an abort may end it early.
            Action::StatusArm(_) | Action::StatusStart(_) | Action::StatusComplete(_) => {
                debug!(state = %rm.state(), "status step inside a run; state unchanged");
                Ok(transition_report(false, rm))
            }
            Action::StatusAbort(_) => Ok(transition_report(rm.abort(), rm)),

            Action::DataSave(p) => {
                let table = table_from_value(&p.data)?;
                let folder = p
                    .folder
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.options.data_dir.clone());
                to_json(self.sink.save(&table, &folder, &p.filename)?)
            }

            Action::Loop(_) => Err(IvError::InvalidArgument(
                "loop must be executed with its nested steps".into(),
            )),
        }
    }

    fn select_relay(&self, board: &str, index: u32) -> Result<Value, IvError> {
        let mut boards = self.boards.lock();
        let b = boards.get_mut(board).ok_or_else(|| IvError::Relay {
            board: board.to_string(),
            details: "no relay board registered under this name".into(),
        })?;
        b.select(index)?;
        Ok(json!({ "board": board, "selected": index }))
    }

    /// Apply `op` to the board named `only`, or to every registered board.
    /// Returns the names of the boards touched.
    fn on_boards<F>(&self, only: Option<&str>, mut op: F) -> Result<Vec<String>, IvError>
    where
        F: FnMut(&mut Box<dyn RelayBoard>) -> Result<(), IvError>,
    {
        let mut boards = self.boards.lock();
        let mut touched = Vec::new();
        for (name, board) in boards.iter_mut() {
            if only.is_some_and(|o| o != name) {
                continue;
            }
            op(board)?;
            touched.push(name.clone());
        }
        if let Some(o) = only
            && touched.is_empty()
        {
            return Err(IvError::Relay {
                board: o.to_string(),
                details: "no relay board registered under this name".into(),
            });
        }
        Ok(touched)
    }

    /// Disable every output, then open every relay.  Each action is
    /// attempted regardless of the other; nothing here returns an error.
    fn safety_cleanup(&self) {
        if let Err(e) = self.registry.disable_all_outputs() {
            error!(error = %e, "cleanup: disabling outputs failed");
        }
        let mut boards = self.boards.lock();
        for (name, board) in boards.iter_mut() {
            if let Err(first) = board.all_off() {
                warn!(board = %name, error = %first, "cleanup: relay all-off failed, retrying");
                if let Err(e) = board.all_off() {
                    error!(board = %name, error = %e, "cleanup: relay all-off failed twice");
                }
            }
        }
        debug!("safety cleanup finished");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1e3
}

fn to_json<T: Serialize>(value: T) -> Result<Value, IvError> {
    serde_json::to_value(value)
        .map_err(|e| IvError::InvalidArgument(format!("result not serialisable: {e}")))
}

fn loop_summary(params: &LoopParams, iterations: usize) -> Value {
    json!({ "variable": params.variable, "iterations": iterations })
}

fn transition_report(transitioned: bool, rm: &RunManager) -> Value {
    json!({ "transitioned": transitioned, "state": rm.state() })
}

/// Build a table from a sweep result, a list of row objects or a list of
/// scalars.
fn table_from_value(data: &Value) -> Result<DataTable, IvError> {
    let rows: &[Value] = match data {
        Value::Object(map) => match map.get("results") {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        },
        Value::Array(rows) => rows.as_slice(),
        _ => &[],
    };
    if rows.is_empty() {
        return Err(IvError::InvalidArgument("no data to save".into()));
    }

    if let Ok(samples) = serde_json::from_value::<Vec<Sample>>(Value::Array(rows.to_vec())) {
        return Ok(DataTable::from_samples(&samples));
    }

    let cell = |v: Option<&Value>| match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    match &rows[0] {
        Value::Object(first) => {
            let columns: Vec<String> = first.keys().cloned().collect();
            let cells = rows
                .iter()
                .map(|row| columns.iter().map(|c| cell(row.get(c))).collect::<Vec<String>>())
                .collect();
            Ok(DataTable {
                columns,
                rows: cells,
            })
        }
        _ => Ok(DataTable {
            columns: vec!["value".into()],
            rows: rows.iter().map(|v| vec![cell(Some(v))]).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivcore_hal::sim::{ScriptedConnector, SimRelayBoard};
    use ivcore_hal::sink::CsvSink;
    use ivcore_hal::{RegistryOptions, SmuFactory};

    struct Rig {
        engine: ProtocolEngine,
        registry: Arc<ChannelRegistry>,
        run_manager: Arc<RunManager>,
        pixel: SimRelayBoard,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let run_manager = Arc::new(RunManager::with_poll_interval(Duration::from_millis(5)));
        let registry = Arc::new(ChannelRegistry::new(
            SmuFactory::new(Arc::new(ScriptedConnector::new())),
            run_manager.clone(),
            RegistryOptions::default(),
        ));
        let engine = ProtocolEngine::new(
            registry.clone(),
            run_manager.clone(),
            Arc::new(CsvSink::new()),
            EngineOptions {
                default_address: "MOCK".into(),
                default_smu_type: Some(SmuType::KeysightB2902),
                default_mock: true,
                data_dir: dir.path().to_path_buf(),
            },
        );
        let pixel = SimRelayBoard::new("pixel", 8);
        engine.register_board(PIXEL_BOARD, Box::new(pixel.clone()));
        Rig {
            engine,
            registry,
            run_manager,
            pixel,
            _dir: dir,
        }
    }

    fn step(action: &str, params: Value) -> ProtocolStep {
        ProtocolStep::new(action, params)
    }

    fn output_on(registry: &ChannelRegistry, channel: u8) -> bool {
        registry
            .channel_status(channel)
            .map(|s| s.output_enabled)
            .unwrap_or(false)
    }

    #[test]
    fn capture_then_reference_resolves_verbatim() {
        let rig = rig();
        let steps = vec![
            step("smu/connect", json!({})),
            step("smu/list-sweep", json!({ "points": [0.0, 0.5], "delay": 0.0 })).capture_as("iv_data"),
            step("data/save", json!({ "data": "$iv_data", "filename": "iv" })),
        ];
        let result = rig.engine.run(&steps);

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.steps_completed, 3);
        let saved = result.step_results[2].result.as_ref().unwrap();
        assert_eq!(saved["rows_written"], json!(2));
        assert!(saved["path"].as_str().unwrap().ends_with("iv.csv"));
        assert_eq!(
            result.captured_data["iv_data"]["results"].as_array().map(Vec::len),
            Some(2)
        );
        assert_eq!(rig.run_manager.state(), RunState::Idle);
    }

    #[test]
    fn unknown_reference_stays_literal_and_fails_typing_not_lookup() {
        let rig = rig();
        let steps = vec![step("data/save", json!({ "data": "$never", "filename": "x" }))];
        let result = rig.engine.run(&steps);
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("1"));
        assert!(result.error.unwrap().contains("no data"));
    }

    #[test]
    fn captures_are_audited_with_context() {
        let rig = rig();
        let steps = vec![
            step("smu/connect", json!({})).capture_as("conn"),
            step("smu/measure", json!({})).capture_as("m"),
            step("smu/measure", json!({})).capture_as("m"),
        ];
        let result = rig.engine.run(&steps);
        assert!(result.success);

        let history = rig.engine.capture_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| r.run_id == result.run_id));
        assert!(history[1].context.contains_key("conn"));
        assert!(!history[2].context.contains_key("m"));
        assert_eq!(history[2].step, "3");

        // a second run starts from an empty variable set but keeps history
        let again = rig.engine.run(&[step("wait", json!({ "seconds": 0 }))]);
        assert!(again.captured_data.is_empty());
        assert_eq!(rig.engine.capture_history().len(), 3);
    }

    #[test]
    fn failure_mid_protocol_still_cleans_up() {
        let rig = rig();
        let steps = vec![
            step("smu/connect", json!({})),
            step("smu/output", json!({ "enabled": true })),
            step("relays/pixel", json!({ "pixel_id": 4 })),
            step("smu/set", json!({ "channel": 7, "value": 1.0 })),
            step("wait", json!({ "seconds": 0 })),
        ];
        assert!(!rig.registry.is_connected());
        let result = rig.engine.run(&steps);

        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Failed);
        assert_eq!(result.steps_completed, 3);
        assert_eq!(result.failed_step.as_deref(), Some("4"));
        assert_eq!(result.step_results.len(), 4);
        assert!(!output_on(&rig.registry, 1));
        assert_eq!(rig.pixel.selected(), None);
        assert_eq!(rig.run_manager.state(), RunState::Error);
        assert!(rig.run_manager.error_message().is_some());

        // the next run recovers from ERROR
        let next = rig.engine.run(&[step("wait", json!({ "seconds": 0 }))]);
        assert!(next.success);
        assert_eq!(rig.run_manager.state(), RunState::Idle);
    }

    #[test]
    fn unknown_action_rejects_the_whole_protocol_up_front() {
        let rig = rig();
        let steps = vec![
            step("relays/pixel", json!({ "pixel_id": 2 })),
            step("smu/frobnicate", json!({})),
        ];
        let result = rig.engine.run(&steps);
        assert!(!result.success);
        assert_eq!(result.steps_completed, 0);
        assert!(result.step_results.is_empty());
        assert_eq!(result.failed_step.as_deref(), Some("2"));
        assert!(rig.pixel.history().iter().all(Option::is_none));
    }

    #[test]
    fn loop_binds_variable_for_nested_steps() {
        let rig = rig();
        let steps = vec![
            step("loop", json!({ "variable": "px", "start": 1, "stop": 3, "step": 1 })).with_steps(vec![
                step("relays/pixel", json!({ "pixel_id": "$px" })),
                step("wait", json!({ "seconds": 0 })).capture_as("w"),
            ]),
        ];
        let result = rig.engine.run(&steps);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.step_results.len(), 7);
        assert_eq!(result.step_results[0].path, "1[1].1");
        assert_eq!(result.step_results[5].path, "1[3].2");
        assert_eq!(result.captured_data["px"], json!(3));

        let closed: Vec<Option<u32>> = rig.pixel.history().into_iter().filter(Option::is_some).collect();
        assert_eq!(closed, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(rig.pixel.selected(), None);
    }

    #[test]
    fn nested_failure_fails_the_run_with_nested_path() {
        let rig = rig();
        let steps = vec![
            step("loop", json!({ "variable": "px", "items": [1, 99] }))
                .with_steps(vec![step("relays/pixel", json!({ "pixel_id": "$px" }))]),
            step("wait", json!({ "seconds": 0 })),
        ];
        let result = rig.engine.run(&steps);
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("1[2].1"));
        assert_eq!(result.steps_completed, 0);
        assert!(!result.step_results.last().unwrap().success);
        assert_eq!(result.step_results.last().unwrap().path, "1");
    }

    #[test]
    fn status_abort_stops_the_run_and_ends_idle() {
        let rig = rig();
        let steps = vec![
            step("smu/connect", json!({})),
            step("smu/output", json!({})),
            step("status/abort", json!({})),
            step("smu/measure", json!({})),
        ];
        let result = rig.engine.run(&steps);
        assert!(result.aborted);
        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(result.steps_completed, 3);
        assert!(result.error.is_none());
        assert_eq!(rig.run_manager.state(), RunState::Idle);
        assert!(rig.run_manager.is_abort_requested());
        assert!(!output_on(&rig.registry, 1));
    }

    #[test]
    fn status_steps_report_without_failing() {
        let rig = rig();
        let result = rig.engine.run(&[step("status/arm", json!({})).capture_as("arm")]);
        assert!(result.success);
        assert_eq!(result.captured_data["arm"]["transitioned"], json!(false));
        assert_eq!(result.captured_data["arm"]["state"], json!("RUNNING"));
    }

    #[test]
    fn failure_after_status_complete_still_leaves_error() {
        let rig = rig();
        let steps = vec![
            step("status/complete", json!({})).capture_as("done"),
            step("relays/pixel", json!({ "pixel_id": 99 })),
        ];
        let result = rig.engine.run(&steps);
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("2"));
        assert_eq!(result.step_results[0].result.as_ref().unwrap()["transitioned"], json!(false));
        assert_eq!(rig.run_manager.state(), RunState::Error);
        let message = rig.run_manager.error_message().unwrap();
        assert!(message.contains("out of range"), "{message}");
    }

    #[test]
    fn status_transitions_inside_a_run_leave_the_cycle_alone() {
        let rig = rig();
        let steps = vec![
            step("status/complete", json!({})).capture_as("complete"),
            step("status/arm", json!({})).capture_as("arm"),
            step("status/start", json!({})).capture_as("start"),
        ];
        let result = rig.engine.run(&steps);
        assert!(result.success);
        for name in ["complete", "arm", "start"] {
            assert_eq!(result.captured_data[name]["transitioned"], json!(false), "{name}");
            assert_eq!(result.captured_data[name]["state"], json!("RUNNING"), "{name}");
        }
        assert_eq!(rig.run_manager.state(), RunState::Idle);
    }

    #[test]
    fn relays_reconnect_after_disconnect() {
        let rig = rig();
        let steps = vec![
            step("relays/pixel", json!({ "pixel_id": 2 })),
            step("relays/disconnect", json!({})).capture_as("down"),
            step("relays/connect", json!({ "board": "pixel" })).capture_as("up"),
            step("relays/pixel", json!({ "pixel_id": 5 })),
        ];
        let result = rig.engine.run(&steps);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.captured_data["down"]["disconnected"], json!(["pixel"]));
        assert_eq!(result.captured_data["up"]["connected"], json!(["pixel"]));
        assert!(rig.pixel.is_connected());
        assert_eq!(rig.pixel.history(), vec![Some(2), None, Some(5), None]);
    }

    #[test]
    fn selecting_on_a_disconnected_board_fails() {
        let rig = rig();
        let steps = vec![
            step("relays/disconnect", json!({ "board": "pixel" })),
            step("relays/pixel", json!({ "pixel_id": 1 })),
        ];
        let result = rig.engine.run(&steps);
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("2"));
        assert!(result.error.unwrap().contains("not connected"));
        assert!(!rig.pixel.is_connected());

        let unknown = rig.engine.run(&[step("relays/connect", json!({ "board": "led" }))]);
        assert!(!unknown.success);
        assert!(unknown.error.unwrap().contains("led"));
    }

    #[test]
    fn refuses_while_run_manager_is_running() {
        let rig = rig();
        assert!(rig.run_manager.arm() && rig.run_manager.start());
        let result = rig.engine.run(&[step("wait", json!({ "seconds": 0 }))]);
        assert!(!result.success);
        assert!(result.step_results.is_empty());
        assert_eq!(rig.run_manager.state(), RunState::Running);
    }

    #[test]
    fn abort_from_another_thread_interrupts_wait() {
        let rig = rig();
        let rm = rig.run_manager.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            rm.abort();
        });
        let result = rig.engine.run(&[
            step("wait", json!({ "seconds": 5 })),
            step("wait", json!({ "seconds": 5 })),
        ]);
        handle.join().unwrap();
        assert!(result.aborted);
        assert_eq!(result.step_results[0].result.as_ref().unwrap()["interrupted"], json!(true));
        assert!(result.duration_ms < 4000.0);
    }

    #[test]
    fn tables_from_rows_and_scalars() {
        let t = table_from_value(&json!([{ "a": 1, "b": "x" }, { "a": 2 }])).unwrap();
        assert_eq!(t.columns, vec!["a", "b"]);
        assert_eq!(t.rows[1], vec!["2".to_string(), String::new()]);

        let s = table_from_value(&json!([1.5, 2.5])).unwrap();
        assert_eq!(s.columns, vec!["value"]);

        let sweep = table_from_value(&json!({
            "results": [{ "set_value": 0.0, "voltage": 0.0, "current": null }],
            "aborted": false
        }))
        .unwrap();
        assert_eq!(sweep.columns, vec!["set_value", "voltage", "current"]);
        assert!(table_from_value(&json!({})).is_err());
    }
}
