//! Protocol step format and the typed action set.
//!
//! A protocol is a list of [`ProtocolStep`] records:
//!
//! ```yaml
//! - action: smu/connect
//!   params: { address: "TCPIP0::192.168.1.20::INSTR", channel: 1 }
//! - action: smu/sweep
//!   params: { start: 0.0, stop: 1.2, points: 61 }
//!   capture_as: iv_data
//! - action: data/save
//!   params: { data: "$iv_data", filename: "dark_iv" }
//! ```
//!
//! Steps stay untyped (`params` is a JSON object) until execution time,
//! because parameters may reference captured values (`$name`) that only
//! exist once earlier steps have run.  After template resolution the step
//! is parsed into an [`Action`], whose parameter structs reject unknown
//! keys.
//!
//! | Action | Parameters |
//! |---|---|
//! | `wait` | [`WaitParams`] |
//! | `smu/connect` | [`ConnectParams`] |
//! | `smu/disconnect` | none |
//! | `smu/configure` | [`ConfigureParams`] |
//! | `smu/source-mode` | [`SourceModeParams`] |
//! | `smu/set` | [`SetParams`] |
//! | `smu/output` | [`OutputParams`] |
//! | `smu/measure` | [`ChannelParams`] |
//! | `smu/sweep` | [`SweepParams`] |
//! | `smu/list-sweep` | [`ListSweepParams`] |
//! | `smu/current-limit` | [`CurrentLimitParams`] |
//! | `relays/pixel` | [`PixelParams`] |
//! | `relays/led` | [`LedParams`] |
//! | `relays/select` | [`SelectParams`] |
//! | `relays/all-off` | [`BoardParams`] |
//! | `relays/connect`, `relays/disconnect` | [`BoardParams`] |
//! | `status/arm`, `status/start`, `status/complete`, `status/abort` | none |
//! | `data/save` | [`SaveParams`] |
//! | `loop` | [`LoopParams`] plus nested `steps` |

use ivcore_hal::sweep::SweepShape;
use ivcore_hal::{ListSweepRequest, SweepRequest};
use ivcore_types::{IvError, SourceMode, SweepDirection, SweepKind, SweepScale};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Upper bound on the iterations of a numeric-range loop.
pub const MAX_LOOP_ITERATIONS: usize = 10_000;

// ─────────────────────────────────────────────────────────────────────────────
// Step format
// ─────────────────────────────────────────────────────────────────────────────

/// One declarative step.  `steps` is only meaningful for `loop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolStep {
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ProtocolStep>,
}

impl ProtocolStep {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            action: action.into(),
            params,
            capture_as: None,
            steps: Vec::new(),
        }
    }

    pub fn capture_as(mut self, name: impl Into<String>) -> Self {
        self.capture_as = Some(name.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<ProtocolStep>) -> Self {
        self.steps = steps;
        self
    }
}

/// A protocol file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProtocolDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<ProtocolStep>,
}

fn default_version() -> String {
    "1.0".into()
}

/// JSON schema of a protocol document.
pub fn document_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(ProtocolDocument)
}

/// JSON schema of the typed action set (`{action, params}`).
pub fn action_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Action)
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Every action name the engine understands.
pub const ACTION_NAMES: [&str; 23] = [
    "wait",
    "smu/connect",
    "smu/disconnect",
    "smu/configure",
    "smu/source-mode",
    "smu/set",
    "smu/output",
    "smu/measure",
    "smu/sweep",
    "smu/list-sweep",
    "smu/current-limit",
    "relays/pixel",
    "relays/led",
    "relays/select",
    "relays/all-off",
    "relays/connect",
    "relays/disconnect",
    "status/arm",
    "status/start",
    "status/complete",
    "status/abort",
    "data/save",
    "loop",
];

pub fn is_known_action(name: &str) -> bool {
    ACTION_NAMES.contains(&name)
}

/// Path of the `index`-th (0-based) step under `parent`, e.g. `"3"` or
/// `"3[2].1"` for the first nested step of the second iteration of step 3.
pub fn step_path(parent: Option<&str>, index: usize) -> String {
    match parent {
        Some(p) => format!("{p}.{}", index + 1),
        None => (index + 1).to_string(),
    }
}

/// Check action names, nesting and capture names of a whole step tree
/// before anything is executed.
///
/// # Errors
///
/// [`IvError::Protocol`] naming the first offending step.
pub fn validate_steps(steps: &[ProtocolStep]) -> Result<(), IvError> {
    validate_level(steps, None)
}

fn validate_level(steps: &[ProtocolStep], parent: Option<&str>) -> Result<(), IvError> {
    for (i, step) in steps.iter().enumerate() {
        let path = step_path(parent, i);
        let err = |details: String| IvError::Protocol {
            step: path.clone(),
            details,
        };

        if !is_known_action(&step.action) {
            return Err(err(format!("unknown action '{}'", step.action)));
        }
        if let Some(name) = &step.capture_as
            && !crate::template::is_identifier(name)
        {
            return Err(err(format!("capture name '{name}' is not an identifier")));
        }
        if step.action == "loop" {
            if step.steps.is_empty() {
                return Err(err("loop has no nested steps".into()));
            }
            validate_level(&step.steps, Some(&path))?;
        } else if !step.steps.is_empty() {
            return Err(err(format!(
                "only loop steps may contain nested steps (found under '{}')",
                step.action
            )));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed actions
// ─────────────────────────────────────────────────────────────────────────────

/// A resolved step, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", content = "params")]
pub enum Action {
    #[serde(rename = "wait")]
    Wait(WaitParams),
    #[serde(rename = "smu/connect")]
    SmuConnect(ConnectParams),
    #[serde(rename = "smu/disconnect")]
    SmuDisconnect(NoParams),
    #[serde(rename = "smu/configure")]
    SmuConfigure(ConfigureParams),
    #[serde(rename = "smu/source-mode")]
    SmuSourceMode(SourceModeParams),
    #[serde(rename = "smu/set")]
    SmuSet(SetParams),
    #[serde(rename = "smu/output")]
    SmuOutput(OutputParams),
    #[serde(rename = "smu/measure")]
    SmuMeasure(ChannelParams),
    #[serde(rename = "smu/sweep")]
    SmuSweep(SweepParams),
    #[serde(rename = "smu/list-sweep")]
    SmuListSweep(ListSweepParams),
    #[serde(rename = "smu/current-limit")]
    SmuCurrentLimit(CurrentLimitParams),
    #[serde(rename = "relays/pixel")]
    RelaysPixel(PixelParams),
    #[serde(rename = "relays/led")]
    RelaysLed(LedParams),
    #[serde(rename = "relays/select")]
    RelaysSelect(SelectParams),
    #[serde(rename = "relays/all-off")]
    RelaysAllOff(BoardParams),
    #[serde(rename = "relays/connect")]
    RelaysConnect(BoardParams),
    #[serde(rename = "relays/disconnect")]
    RelaysDisconnect(BoardParams),
    #[serde(rename = "status/arm")]
    StatusArm(NoParams),
    #[serde(rename = "status/start")]
    StatusStart(NoParams),
    #[serde(rename = "status/complete")]
    StatusComplete(NoParams),
    #[serde(rename = "status/abort")]
    StatusAbort(NoParams),
    #[serde(rename = "data/save")]
    DataSave(SaveParams),
    #[serde(rename = "loop")]
    Loop(LoopParams),
}

impl Action {
    /// Parse an action from its name and (already resolved) parameters.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] for unknown actions, unknown parameter
    /// keys and ill-typed values.
    pub fn parse(name: &str, params: Value) -> Result<Action, IvError> {
        if !is_known_action(name) {
            return Err(IvError::InvalidArgument(format!("unknown action '{name}'")));
        }
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        serde_json::from_value(json!({ "action": name, "params": params }))
            .map_err(|e| IvError::InvalidArgument(format!("bad parameters for '{name}': {e}")))
    }
}

fn default_channel() -> u8 {
    1
}

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

fn compliance_on_current() -> SourceMode {
    SourceMode::Curr
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WaitParams {
    #[serde(default = "one")]
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConnectParams {
    /// Falls back to the engine's default address when empty or absent.
    #[serde(default)]
    pub address: Option<String>,
    /// Type tag or `"auto"`.
    #[serde(default)]
    pub smu_type: Option<String>,
    #[serde(default)]
    pub mock: Option<bool>,
    #[serde(default = "default_channel")]
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChannelParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfigureParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "ConfigureParams::default_compliance")]
    pub compliance: f64,
    /// Quantity the compliance limit applies to.
    #[serde(default = "compliance_on_current")]
    pub compliance_type: SourceMode,
    #[serde(default = "one")]
    pub nplc: f64,
}

impl ConfigureParams {
    fn default_compliance() -> f64 {
        0.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SourceModeParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub mode: SourceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SetParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OutputParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "yes")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SweepParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default)]
    pub start: f64,
    #[serde(default = "one")]
    pub stop: f64,
    #[serde(default = "SweepParams::default_points")]
    pub points: usize,
    #[serde(default)]
    pub scale: SweepScale,
    #[serde(default)]
    pub direction: SweepDirection,
    #[serde(default)]
    pub sweep_type: SweepKind,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default = "SweepParams::default_compliance")]
    pub compliance: f64,
    #[serde(default)]
    pub nplc: Option<f64>,
    /// Settling delay per point, seconds.
    #[serde(default = "SweepParams::default_delay")]
    pub delay: f64,
    #[serde(default)]
    pub keep_output_on: bool,
}

impl SweepParams {
    fn default_points() -> usize {
        11
    }

    fn default_compliance() -> f64 {
        0.01
    }

    fn default_delay() -> f64 {
        0.05
    }

    pub fn to_request(&self) -> SweepRequest {
        SweepRequest {
            shape: SweepShape {
                start: self.start,
                stop: self.stop,
                points: self.points,
                scale: self.scale,
                direction: self.direction,
                kind: self.sweep_type,
            },
            source_mode: self.source_mode,
            compliance: self.compliance,
            nplc: self.nplc,
            delay_s: self.delay,
            keep_output_on: self.keep_output_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListSweepParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "ListSweepParams::default_points")]
    pub points: Vec<f64>,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default = "ListSweepParams::default_compliance")]
    pub compliance: f64,
    #[serde(default = "one")]
    pub nplc: f64,
    #[serde(default = "ListSweepParams::default_delay")]
    pub delay: f64,
    #[serde(default)]
    pub keep_output_on: bool,
}

impl ListSweepParams {
    fn default_points() -> Vec<f64> {
        vec![0.0]
    }

    fn default_compliance() -> f64 {
        0.1
    }

    fn default_delay() -> f64 {
        0.1
    }

    pub fn to_request(&self) -> ListSweepRequest {
        ListSweepRequest {
            points: self.points.clone(),
            source_mode: self.source_mode,
            compliance: self.compliance,
            nplc: Some(self.nplc),
            delay_s: self.delay,
            keep_output_on: self.keep_output_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CurrentLimitParams {
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Amps; `null` removes the ceiling.
    #[serde(default)]
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PixelParams {
    pub pixel_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LedParams {
    pub channel_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SelectParams {
    pub board: String,
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BoardParams {
    /// Every registered board when absent.
    #[serde(default)]
    pub board: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SaveParams {
    /// A sweep result (`{results: [...]}`), a list of row objects or a list
    /// of numbers.
    pub data: Value,
    #[serde(default = "SaveParams::default_filename")]
    pub filename: String,
    /// Falls back to the engine's data directory.
    #[serde(default)]
    pub folder: Option<String>,
}

impl SaveParams {
    fn default_filename() -> String {
        "output".into()
    }
}

/// `variable` plus either `items` or an inclusive `start..=stop` range
/// walked in increments of `step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoopParams {
    pub variable: String,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub stop: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
}

impl LoopParams {
    /// The values bound to `variable`, in iteration order.  Ranges whose
    /// start and step are whole numbers yield integers.
    ///
    /// # Errors
    ///
    /// [`IvError::InvalidArgument`] for a missing or non-identifier
    /// variable, for mixing `items` with a range, for an incomplete range,
    /// a zero step, a step moving away from `stop`, or too many iterations.
    pub fn iteration_values(&self) -> Result<Vec<Value>, IvError> {
        if !crate::template::is_identifier(&self.variable) {
            return Err(IvError::InvalidArgument(format!(
                "loop variable '{}' is not an identifier",
                self.variable
            )));
        }
        let has_range = self.start.is_some() || self.stop.is_some() || self.step.is_some();
        match (&self.items, has_range) {
            (Some(_), true) => Err(IvError::InvalidArgument(
                "loop takes either items or start/stop/step, not both".into(),
            )),
            (Some(items), false) => Ok(items.clone()),
            (None, _) => {
                let (Some(start), Some(stop), Some(step)) = (self.start, self.stop, self.step) else {
                    return Err(IvError::InvalidArgument(
                        "loop needs items or all of start, stop and step".into(),
                    ));
                };
                range_values(start, stop, step)
            }
        }
    }
}

fn range_values(start: f64, stop: f64, step: f64) -> Result<Vec<Value>, IvError> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(IvError::InvalidArgument("loop range must be finite".into()));
    }
    if step == 0.0 {
        return Err(IvError::InvalidArgument("loop step must be non-zero".into()));
    }
    if (stop - start) * step < 0.0 {
        return Err(IvError::InvalidArgument(format!(
            "loop step {step} never reaches {stop} from {start}"
        )));
    }

    // Tolerate rounding so 0..=1 step 0.1 includes 1.
    let span = ((stop - start) / step + 1e-9).floor();
    if span >= MAX_LOOP_ITERATIONS as f64 {
        return Err(IvError::InvalidArgument(format!(
            "loop range exceeds {MAX_LOOP_ITERATIONS} iterations"
        )));
    }
    let count = span as usize + 1;
    let integral = start.fract() == 0.0 && step.fract() == 0.0;

    Ok((0..count)
        .map(|i| {
            let v = start + step * i as f64;
            if integral { json!(v as i64) } else { json!(v) }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_name_parses() {
        let params = |name: &str| match name {
            "relays/pixel" => json!({ "pixel_id": 1 }),
            "relays/led" => json!({ "channel_id": 2 }),
            "relays/select" => json!({ "board": "pixel", "index": 3 }),
            "data/save" => json!({ "data": [] }),
            "loop" => json!({ "variable": "i", "items": [1] }),
            _ => json!({}),
        };
        for name in ACTION_NAMES {
            assert!(Action::parse(name, params(name)).is_ok(), "{name}");
        }
    }

    #[test]
    fn defaults_follow_the_step_format() {
        let Action::SmuSweep(p) = Action::parse("smu/sweep", json!({})).unwrap() else {
            panic!("expected sweep");
        };
        assert_eq!((p.channel, p.start, p.stop, p.points), (1, 0.0, 1.0, 11));
        assert_eq!(p.compliance, 0.01);
        assert_eq!(p.delay, 0.05);

        let Action::SmuConfigure(c) = Action::parse("smu/configure", Value::Null).unwrap() else {
            panic!("expected configure");
        };
        assert_eq!(c.compliance_type, SourceMode::Curr);
        assert_eq!(c.nplc, 1.0);
    }

    #[test]
    fn unknown_parameter_keys_are_rejected() {
        let err = Action::parse("smu/set", json!({ "valeu": 1.0 })).unwrap_err();
        assert!(err.to_string().contains("valeu"), "{err}");
        assert!(Action::parse("smu/teleport", json!({})).is_err());
    }

    #[test]
    fn sweep_params_map_onto_a_request() {
        let Action::SmuSweep(p) = Action::parse(
            "smu/sweep",
            json!({ "start": -0.1, "stop": 0.6, "points": 8, "sweep_type": "double", "scale": "linear" }),
        )
        .unwrap() else {
            panic!("expected sweep");
        };
        let req = p.to_request();
        assert_eq!(req.shape.points, 8);
        assert_eq!(req.shape.kind, SweepKind::Double);
        assert_eq!(req.delay_s, 0.05);
    }

    #[test]
    fn validation_reports_nested_path() {
        let steps = vec![
            ProtocolStep::new("wait", json!({ "seconds": 0 })),
            ProtocolStep::new("loop", json!({ "variable": "px", "items": [1, 2] })).with_steps(vec![
                ProtocolStep::new("relays/pixel", json!({ "pixel_id": "$px" })),
                ProtocolStep::new("smu/fly", json!({})),
            ]),
        ];
        match validate_steps(&steps).unwrap_err() {
            IvError::Protocol { step, details } => {
                assert_eq!(step, "2.2");
                assert!(details.contains("smu/fly"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_misplaced_nesting_and_bad_capture_names() {
        let nested = vec![ProtocolStep::new("wait", json!({}))
            .with_steps(vec![ProtocolStep::new("wait", json!({}))])];
        assert!(validate_steps(&nested).is_err());

        let capture = vec![ProtocolStep::new("smu/measure", json!({})).capture_as("iv data")];
        assert!(validate_steps(&capture).is_err());

        let empty_loop = vec![ProtocolStep::new("loop", json!({ "variable": "i", "items": [] }))];
        assert!(validate_steps(&empty_loop).is_err());
    }

    #[test]
    fn integer_ranges_yield_integers() {
        let p = LoopParams {
            variable: "px".into(),
            items: None,
            start: Some(1.0),
            stop: Some(4.0),
            step: Some(1.0),
        };
        assert_eq!(p.iteration_values().unwrap(), vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn fractional_ranges_include_the_endpoint() {
        let values = range_values(0.0, 1.0, 0.25).unwrap();
        assert_eq!(values.len(), 5);
        assert_eq!(values[4], json!(1.0));

        let down = range_values(3.0, 1.0, -1.0).unwrap();
        assert_eq!(down, vec![json!(3), json!(2), json!(1)]);
    }

    #[test]
    fn bad_ranges_are_rejected() {
        assert!(range_values(0.0, 1.0, 0.0).is_err());
        assert!(range_values(0.0, 1.0, -0.5).is_err());
        assert!(range_values(0.0, 1e9, 1.0).is_err());

        let both = LoopParams {
            variable: "i".into(),
            items: Some(vec![json!(1)]),
            start: Some(0.0),
            stop: None,
            step: None,
        };
        assert!(both.iteration_values().is_err());
    }

    #[test]
    fn document_schema_names_steps() {
        let schema = serde_json::to_string(&document_schema()).unwrap();
        assert!(schema.contains("capture_as"));
        let actions = serde_json::to_string(&action_schema()).unwrap();
        assert!(actions.contains("smu/list-sweep"));
    }
}
