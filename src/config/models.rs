use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// A project: an ordered list of actions plus display metadata.
///
/// Actions are stored in `order_index` order on disk, but the engine never relies on
/// file order; it always sorts by `order_index` before running.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Project {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub favorite: bool,
    /// Creation time (RFC 3339 / ISO 8601 text).
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last modification time (RFC 3339 / ISO 8601 text).
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Project {
    /// Create an empty project.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            id,
            name: name.into(),
            description: String::new(),
            category: String::new(),
            favorite: false,
            created_at: Some(now.clone()),
            updated_at: Some(now),
            actions: Vec::new(),
        }
    }

    /// Actions cloned and sorted by ascending `order_index`.
    pub fn sorted_actions(&self) -> Vec<Action> {
        sort_by_order(&self.actions)
    }

    /// Append an action at the end of the sequence, assigning it the next `order_index`.
    pub fn push_action(&mut self, mut action: Action) {
        action.order_index = self.actions.len() as u32 + 1;
        self.actions.push(action);
        self.touch();
    }

    /// Remove an action by id and close the gap in `order_index`.
    pub fn remove_action(&mut self, id: u64) -> bool {
        let before = self.actions.len();
        self.actions.retain(|a| a.id != id);
        if self.actions.len() == before {
            return false;
        }
        self.renumber();
        true
    }

    /// Swap the action with its predecessor. Returns false if it is already first or missing.
    pub fn move_action_up(&mut self, id: u64) -> bool {
        self.actions.sort_by_key(|a| a.order_index);
        match self.actions.iter().position(|a| a.id == id) {
            Some(pos) if pos > 0 => {
                self.actions.swap(pos, pos - 1);
                self.renumber();
                true
            }
            _ => false,
        }
    }

    /// Swap the action with its successor. Returns false if it is already last or missing.
    pub fn move_action_down(&mut self, id: u64) -> bool {
        self.actions.sort_by_key(|a| a.order_index);
        match self.actions.iter().position(|a| a.id == id) {
            Some(pos) if pos + 1 < self.actions.len() => {
                self.actions.swap(pos, pos + 1);
                self.renumber();
                true
            }
            _ => false,
        }
    }

    /// Reassign `order_index` as 1..=N following the current vector order.
    pub fn renumber(&mut self) {
        for (i, action) in self.actions.iter_mut().enumerate() {
            action.order_index = i as u32 + 1;
        }
        self.touch();
    }

    /// Check that `order_index` values form a permutation of 1..=N.
    pub fn check_order(&self) -> Result<(), String> {
        let n = self.actions.len() as u32;
        let mut seen = HashSet::with_capacity(self.actions.len());
        for action in &self.actions {
            if action.order_index == 0 || action.order_index > n {
                return Err(format!(
                    "action {} has order_index {} outside 1..={}",
                    action.id, action.order_index, n
                ));
            }
            if !seen.insert(action.order_index) {
                return Err(format!(
                    "order_index {} is used more than once",
                    action.order_index
                ));
            }
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Some(timestamp_now());
    }
}

/// One step of an automation sequence.
///
/// On disk an action is a flat record:
/// `{ "id": 1, "order_index": 1, "action_type": "mouse_move", "description": "...", "parameters": { "x": 10, "y": 10 } }`.
/// The `action_type`/`parameters` pair is decoded into the closed [`ActionKind`] enum at load time,
/// so unknown kinds and wrongly-typed parameters are rejected before anything runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Action {
    pub id: u64,
    pub order_index: u32,
    /// Free text shown in progress reports.
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    pub fn new(id: u64, order_index: u32, kind: ActionKind) -> Self {
        Self {
            id,
            order_index,
            description: String::new(),
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Human-readable label: the description, or `<kind> #<id>` when it is empty.
    pub fn label(&self) -> String {
        if self.description.trim().is_empty() {
            format!("{} #{}", self.kind.name(), self.id)
        } else {
            self.description.clone()
        }
    }
}

/// Action kinds and their typed parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "action_type", content = "parameters", rename_all = "snake_case")]
pub enum ActionKind {
    // --- Pointer ---
    /// Move the pointer to an absolute position, optionally animated over `duration`.
    MouseMove(MoveParams),
    /// Click at a position (or at the current pointer position).
    MouseClick(ClickParams),
    MouseDoubleClick(PointParams),
    MouseRightClick(PointParams),
    /// Press at one point, move to another, release.
    MouseDrag(DragParams),

    // --- Keyboard ---
    /// Type literal text, one character every `interval` seconds.
    KeyboardType(TypeParams),
    /// Press and release a single named key.
    KeyboardPress(KeyParams),
    /// Press a key combination such as `ctrl+c`.
    #[serde(alias = "key_combination")]
    KeyboardHotkey(HotkeyParams),

    // --- Clipboard ---
    ClipboardCopy(ClipboardCopyParams),
    ClipboardPaste(ClipboardPasteParams),

    // --- Timing & capture ---
    Delay(DelayParams),
    Screenshot(ScreenshotParams),

    // --- Control flow ---
    /// Evaluate a condition and continue with one of two nested action lists.
    Conditional(ConditionalParams),

    // --- Image recognition ---
    ImageClick(ImageClickParams),
    ImageWait(ImageWaitParams),
    WaitForAnyImage(AnyImageParams),

    // --- Data loops ---
    /// Replay the actions up to the matching `data_loop_end` once per data row.
    DataLoopStart(DataLoopParams),
    DataLoopEnd(LoopEndParams),
}

impl ActionKind {
    /// Snake-case kind name as used in project files.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::MouseMove(_) => "mouse_move",
            ActionKind::MouseClick(_) => "mouse_click",
            ActionKind::MouseDoubleClick(_) => "mouse_double_click",
            ActionKind::MouseRightClick(_) => "mouse_right_click",
            ActionKind::MouseDrag(_) => "mouse_drag",
            ActionKind::KeyboardType(_) => "keyboard_type",
            ActionKind::KeyboardPress(_) => "keyboard_press",
            ActionKind::KeyboardHotkey(_) => "keyboard_hotkey",
            ActionKind::ClipboardCopy(_) => "clipboard_copy",
            ActionKind::ClipboardPaste(_) => "clipboard_paste",
            ActionKind::Delay(_) => "delay",
            ActionKind::Screenshot(_) => "screenshot",
            ActionKind::Conditional(_) => "conditional",
            ActionKind::ImageClick(_) => "image_click",
            ActionKind::ImageWait(_) => "image_wait",
            ActionKind::WaitForAnyImage(_) => "wait_for_any_image",
            ActionKind::DataLoopStart(_) => "data_loop_start",
            ActionKind::DataLoopEnd(_) => "data_loop_end",
        }
    }

    /// Whether a failure of this action terminates the whole run.
    ///
    /// Image actions and conditionals carry their own `stop_on_failure` flag; data loops are
    /// always fatal; everything else is reported and skipped.
    pub fn stop_on_failure(&self) -> bool {
        match self {
            ActionKind::ImageClick(p) => p.stop_on_failure,
            ActionKind::ImageWait(p) => p.stop_on_failure,
            ActionKind::WaitForAnyImage(p) => p.stop_on_failure,
            ActionKind::Conditional(p) => p.stop_on_failure,
            ActionKind::DataLoopStart(_) | ActionKind::DataLoopEnd(_) => true,
            _ => false,
        }
    }

    /// Check parameter constraints. Run after placeholder resolution, right before dispatch.
    pub fn validate(&self) -> Result<(), String> {
        fn check<T: Validate>(params: &T) -> Result<(), String> {
            params.validate().map_err(|e| e.to_string())
        }

        match self {
            ActionKind::MouseMove(p) => check(p),
            ActionKind::MouseClick(p) => check(p),
            ActionKind::MouseDoubleClick(_) | ActionKind::MouseRightClick(_) => Ok(()),
            ActionKind::MouseDrag(p) => check(p),
            ActionKind::KeyboardType(p) => check(p),
            ActionKind::KeyboardPress(p) => check(p),
            ActionKind::KeyboardHotkey(p) => {
                if p.keys.keys().is_empty() {
                    Err("hotkey needs at least one key".to_string())
                } else {
                    Ok(())
                }
            }
            ActionKind::ClipboardCopy(_) | ActionKind::ClipboardPaste(_) => Ok(()),
            ActionKind::Delay(p) => {
                check(p)?;
                match p.max_seconds {
                    Some(max) if max < p.seconds => Err(format!(
                        "max_seconds ({max}) is smaller than seconds ({})",
                        p.seconds
                    )),
                    _ => Ok(()),
                }
            }
            ActionKind::Screenshot(_) => Ok(()),
            ActionKind::Conditional(p) => match &p.condition {
                Condition::ImagePresent(image) | Condition::ImageAbsent(image) => check(image),
                Condition::LastActionSucceeded | Condition::LastActionFailed => Ok(()),
            },
            ActionKind::ImageClick(p) => check(p),
            ActionKind::ImageWait(p) => check(p),
            ActionKind::WaitForAnyImage(p) => check(p),
            ActionKind::DataLoopStart(p) => check(p),
            ActionKind::DataLoopEnd(_) => Ok(()),
        }
    }
}

/// A screen point in absolute pixel coordinates.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// A rectangle region on screen.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Mouse button enumeration.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct MoveParams {
    pub x: i32,
    pub y: i32,
    /// Animation time in seconds (0 = jump).
    #[serde(default = "default_move_duration")]
    #[validate(minimum = 0.0)]
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct ClickParams {
    /// Target x; when `x`/`y` are absent the click happens at the current pointer position.
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "default_clicks")]
    #[validate(minimum = 1)]
    pub clicks: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PointParams {
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct DragParams {
    pub start_x: i32,
    pub start_y: i32,
    pub end_x: i32,
    pub end_y: i32,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "default_move_duration")]
    #[validate(minimum = 0.0)]
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct TypeParams {
    #[validate(min_length = 1)]
    pub text: String,
    /// Seconds between characters.
    #[serde(default = "default_type_interval")]
    #[validate(minimum = 0.0)]
    pub interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct KeyParams {
    /// Key name, e.g. "enter", "tab", "f5" or a single character.
    #[validate(min_length = 1)]
    pub key: String,
    #[serde(default = "default_clicks")]
    #[validate(minimum = 1)]
    pub presses: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HotkeyParams {
    pub keys: KeyCombo,
}

/// Key combination, either as a list (`["ctrl", "c"]`) or a `+`-joined string (`"ctrl+c"`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum KeyCombo {
    List(Vec<String>),
    Joined(String),
}

impl KeyCombo {
    /// Normalized, non-empty key names in press order.
    pub fn keys(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            KeyCombo::List(keys) => keys.iter().map(String::as_str).collect(),
            KeyCombo::Joined(joined) => joined.split('+').collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ClipboardCopyParams {
    /// Text to put on the clipboard. Without it, the platform copy shortcut is pressed.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ClipboardPasteParams {
    #[serde(default)]
    pub method: PasteMethod,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PasteMethod {
    /// Ctrl+V (Cmd+V on macOS).
    #[default]
    #[serde(alias = "Ctrl+V")]
    Shortcut,
    /// Right click at the pointer, then press `v`.
    ContextMenu,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct DelayParams {
    #[serde(default = "default_delay_seconds")]
    #[validate(minimum = 0.0)]
    pub seconds: f64,
    /// When set, the delay is drawn uniformly from `[seconds, max_seconds]`.
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub max_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScreenshotParams {
    #[serde(default)]
    pub region: Option<Rect>,
    /// Save the capture here (PNG). Without it the capture is discarded.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConditionalParams {
    pub condition: Condition,
    #[serde(default)]
    pub then_actions: Vec<Action>,
    #[serde(default)]
    pub else_actions: Vec<Action>,
    /// Abort the run if the condition cannot be evaluated (e.g. capture failed).
    #[serde(default)]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// The previous dispatched action succeeded.
    LastActionSucceeded,
    /// The previous dispatched action failed (or was skipped as invalid).
    LastActionFailed,
    ImagePresent(ImageCheck),
    ImageAbsent(ImageCheck),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct ImageCheck {
    pub template: PathBuf,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub region: Option<Rect>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct ImageClickParams {
    pub template: PathBuf,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub confidence: Option<f64>,
    /// Seconds to keep looking (0 = single attempt).
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub timeout: f64,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub region: Option<Rect>,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "default_clicks")]
    #[validate(minimum = 1)]
    pub clicks: u32,
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct ImageWaitParams {
    pub template: PathBuf,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub confidence: Option<f64>,
    #[serde(default = "default_image_timeout")]
    #[validate(minimum = 0.0)]
    pub timeout: f64,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub region: Option<Rect>,
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct AnyImageParams {
    #[validate(min_items = 1)]
    pub templates: Vec<PathBuf>,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub confidence: Option<f64>,
    #[serde(default = "default_image_timeout")]
    #[validate(minimum = 0.0)]
    pub timeout: f64,
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub region: Option<Rect>,
    /// Click the first template that shows up.
    #[serde(default)]
    pub click: bool,
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct DataLoopParams {
    /// Spreadsheet (`.xlsx`, `.xls`, `.ods`), CSV/TSV or JSON file holding the rows.
    pub source: PathBuf,
    /// Worksheet to read from a spreadsheet. Defaults to the first one.
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    #[serde(default)]
    #[validate(minimum = 1)]
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LoopEndParams {}

/// Row filter applied once when a data loop loads its rows.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RowFilter {
    pub column: String,
    #[serde(default)]
    pub operator: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FilterOp {
    #[default]
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "contains")]
    Contains,
}

/// Playback pace: a settle delay inserted after every dispatched action.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSpeed {
    Instant,
    Fast,
    #[default]
    Normal,
    Slow,
}

impl ExecutionSpeed {
    pub fn settle_delay(self) -> std::time::Duration {
        use std::time::Duration;
        match self {
            ExecutionSpeed::Instant => Duration::ZERO,
            ExecutionSpeed::Fast => Duration::from_millis(100),
            ExecutionSpeed::Normal => Duration::from_millis(500),
            ExecutionSpeed::Slow => Duration::from_secs(1),
        }
    }
}

/// Engine settings. Loaded from an optional JSON file and overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RunSettings {
    pub execution_speed: ExecutionSpeed,
    /// Granularity of pause/stop checks inside waits, in milliseconds.
    pub poll_interval_ms: u64,
    /// Confidence used by image actions that do not set one.
    pub default_confidence: f64,
    /// Interval between image searches, in milliseconds, when the action does not set one.
    pub image_poll_interval_ms: u64,
    /// Log backend calls instead of injecting input.
    pub dry_run: bool,
    /// How many times the whole sequence is replayed.
    pub repeat: u32,
    /// Seconds to wait between repetitions.
    pub repeat_interval: f64,
    /// Key that triggers an emergency stop.
    pub panic_key: String,
    /// Extra attempts after a run fails. Each attempt replays the whole sequence.
    pub retries: u32,
    /// Seconds to wait before each retry.
    pub retry_interval: f64,
    /// Checks that must hold before a run is allowed to start.
    pub conditions: RunConditions,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            execution_speed: ExecutionSpeed::default(),
            poll_interval_ms: 100,
            default_confidence: 0.8,
            image_poll_interval_ms: 500,
            dry_run: false,
            repeat: 1,
            repeat_interval: 1.0,
            panic_key: "Escape".to_string(),
            retries: 0,
            retry_interval: 5.0,
            conditions: RunConditions::default(),
        }
    }
}

/// Upper bound for settings intervals, in seconds (one week).
pub const MAX_INTERVAL_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Pre-run checks. Every field that is set must hold, otherwise the run is refused.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RunConditions {
    /// Earliest local time of day (`HH:MM`) a run may start.
    pub start_time: Option<String>,
    /// Latest local time of day (`HH:MM`). Before `start_time` means the window spans midnight.
    pub end_time: Option<String>,
    /// A file that must exist.
    pub file_exists: Option<PathBuf>,
    /// A screen pixel that must show an exact colour.
    pub pixel: Option<PixelCheck>,
}

impl RunConditions {
    pub fn is_empty(&self) -> bool {
        self.start_time.is_none()
            && self.end_time.is_none()
            && self.file_exists.is_none()
            && self.pixel.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PixelCheck {
    pub x: i32,
    pub y: i32,
    /// Expected RGB colour.
    pub color: [u8; 3],
}

/// Pair every `data_loop_start` with its matching `data_loop_end`.
///
/// Positions refer to the order of `actions` as given. Returns start -> end.
pub fn match_data_loops<'a, I>(actions: I) -> Result<BTreeMap<usize, usize>, String>
where
    I: IntoIterator<Item = &'a Action>,
{
    let mut open: Vec<usize> = Vec::new();
    let mut pairs = BTreeMap::new();
    for (pos, action) in actions.into_iter().enumerate() {
        match action.kind {
            ActionKind::DataLoopStart(_) => open.push(pos),
            ActionKind::DataLoopEnd(_) => {
                let start = open.pop().ok_or_else(|| {
                    format!("data_loop_end at position {pos} has no matching data_loop_start")
                })?;
                pairs.insert(start, pos);
            }
            _ => {}
        }
    }
    if let Some(start) = open.pop() {
        return Err(format!(
            "data_loop_start at position {start} is never closed"
        ));
    }
    Ok(pairs)
}

/// Clone and sort actions by `order_index` (stable for equal indexes).
pub fn sort_by_order(actions: &[Action]) -> Vec<Action> {
    let mut sorted = actions.to_vec();
    sorted.sort_by_key(|a| a.order_index);
    sorted
}

fn timestamp_now() -> String {
    chrono::Local::now().to_rfc3339()
}

fn default_move_duration() -> f64 {
    0.5
}

fn default_clicks() -> u32 {
    1
}

fn default_type_interval() -> f64 {
    0.1
}

fn default_delay_seconds() -> f64 {
    1.0
}

fn default_image_timeout() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> Action {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_record_decodes_into_typed_kind() {
        let a = parse(json!({
            "id": 7, "order_index": 1, "action_type": "mouse_move",
            "description": "go", "parameters": {"x": 10, "y": 20}
        }));
        assert_eq!(a.id, 7);
        match a.kind {
            ActionKind::MouseMove(p) => {
                assert_eq!((p.x, p.y), (10, 20));
                assert_eq!(p.duration, 0.5);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_key_combination_alias_and_joined_keys() {
        let a = parse(json!({
            "id": 1, "order_index": 1, "action_type": "key_combination",
            "description": "", "parameters": {"keys": "ctrl + c"}
        }));
        match a.kind {
            ActionKind::KeyboardHotkey(p) => assert_eq!(p.keys.keys(), vec!["ctrl", "c"]),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let res: Result<Action, _> = serde_json::from_value(json!({
            "id": 1, "order_index": 1, "action_type": "teleport", "parameters": {}
        }));
        assert!(res.is_err());
    }

    #[test]
    fn test_wrongly_typed_parameter_is_rejected() {
        let res: Result<Action, _> = serde_json::from_value(json!({
            "id": 1, "order_index": 1, "action_type": "mouse_move",
            "parameters": {"x": "left", "y": 3}
        }));
        assert!(res.is_err());
    }

    #[test]
    fn test_image_defaults_and_failure_policy() {
        let a = parse(json!({
            "id": 1, "order_index": 1, "action_type": "image_wait",
            "parameters": {"template": "ok.png"}
        }));
        assert!(a.kind.stop_on_failure());
        match &a.kind {
            ActionKind::ImageWait(p) => assert_eq!(p.timeout, 10.0),
            other => panic!("unexpected kind {other:?}"),
        }

        let click = parse(json!({
            "id": 2, "order_index": 2, "action_type": "mouse_click", "parameters": {}
        }));
        assert!(!click.kind.stop_on_failure());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let bad_conf = ActionKind::ImageWait(ImageWaitParams {
            template: "a.png".into(),
            confidence: Some(1.5),
            timeout: 1.0,
            poll_interval: None,
            region: None,
            stop_on_failure: true,
        });
        assert!(bad_conf.validate().is_err());

        let empty_text = ActionKind::KeyboardType(TypeParams {
            text: String::new(),
            interval: 0.0,
        });
        assert!(empty_text.validate().is_err());

        let inverted = ActionKind::Delay(DelayParams {
            seconds: 2.0,
            max_seconds: Some(1.0),
        });
        assert!(inverted.validate().is_err());

        let hotkey = ActionKind::KeyboardHotkey(HotkeyParams {
            keys: KeyCombo::Joined(" + ".into()),
        });
        assert!(hotkey.validate().is_err());
    }

    #[test]
    fn test_conditional_nests_actions() {
        let a = parse(json!({
            "id": 1, "order_index": 1, "action_type": "conditional",
            "parameters": {
                "condition": {"type": "image_present", "template": "dialog.png"},
                "then_actions": [
                    {"id": 10, "order_index": 1, "action_type": "keyboard_press", "parameters": {"key": "enter"}}
                ]
            }
        }));
        match a.kind {
            ActionKind::Conditional(p) => {
                assert_eq!(p.then_actions.len(), 1);
                assert!(p.else_actions.is_empty());
                assert!(matches!(p.condition, Condition::ImagePresent(_)));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_kind_roundtrips_through_value() {
        let kind = ActionKind::ClipboardPaste(ClipboardPasteParams {
            method: PasteMethod::ContextMenu,
        });
        let v = serde_json::to_value(&kind).unwrap();
        assert_eq!(v["action_type"], "clipboard_paste");
        assert_eq!(v["parameters"]["method"], "context_menu");
        let back: ActionKind = serde_json::from_value(v).unwrap();
        assert_eq!(back, kind);
    }

    fn delay(id: u64, order: u32) -> Action {
        Action::new(
            id,
            order,
            ActionKind::Delay(DelayParams {
                seconds: 0.0,
                max_seconds: None,
            }),
        )
    }

    #[test]
    fn test_move_up_down_keeps_permutation() {
        let mut p = Project::new(1, "demo");
        p.push_action(delay(10, 0));
        p.push_action(delay(11, 0));
        p.push_action(delay(12, 0));

        assert!(p.move_action_up(12));
        assert!(p.check_order().is_ok());
        let ids: Vec<u64> = p.sorted_actions().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![10, 12, 11]);

        assert!(!p.move_action_up(10));
        assert!(p.move_action_down(10));
        assert!(!p.move_action_down(11));
        let ids: Vec<u64> = p.sorted_actions().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![12, 10, 11]);
        assert!(p.check_order().is_ok());

        assert!(p.remove_action(10));
        assert!(p.check_order().is_ok());
        assert_eq!(p.actions.len(), 2);
    }

    #[test]
    fn test_check_order_detects_gaps_and_duplicates() {
        let mut p = Project::new(1, "demo");
        p.actions = vec![delay(1, 1), delay(2, 3)];
        assert!(p.check_order().is_err());
        p.actions = vec![delay(1, 1), delay(2, 1)];
        assert!(p.check_order().is_err());
    }

    #[test]
    fn test_match_data_loops() {
        let start = || {
            Action::new(
                0,
                0,
                ActionKind::DataLoopStart(DataLoopParams {
                    source: "rows.csv".into(),
                    sheet: None,
                    filter: None,
                    max_rows: None,
                }),
            )
        };
        let end = || Action::new(0, 0, ActionKind::DataLoopEnd(LoopEndParams {}));

        let seq = vec![start(), start(), delay(1, 1), end(), end()];
        let pairs = match_data_loops(&seq).unwrap();
        assert_eq!(pairs.get(&0), Some(&4));
        assert_eq!(pairs.get(&1), Some(&3));

        assert!(match_data_loops(&vec![end()]).is_err());
        assert!(match_data_loops(&vec![start(), delay(1, 1)]).is_err());
    }
}
