use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use deck_core::stats::SystemStats;
use deck_core::url::HostInfo;
use deck_core::wire::{BuildRequest, DeleteMode, TerminalSize};
use deck_core::{GpuSet, PLACEHOLDER_ID};
use deck_storage::{PrefStore, SplitSizes};
use deck_sync::dirty::{EditableFields, Field, FieldEdit};
use deck_sync::session::log_tail::LogTailConnector;
use deck_sync::session::ws::WsConnector;
use deck_sync::session::{Connector, Handshake};
use deck_sync::{
    execute, ActionId, Command, CommandReport, CycleOutcome, Dispatch, DispatchTable, HttpApi,
    NoticeBoard, NoticeLevel, PollPolicy, RemoteApi, RowContext, RowView, SessionEvent,
    SessionKind, SyncEngine, ToolsPane, ViewRequest,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const OUTPUT_LIMIT: usize = 64 * 1024;
const SPLIT_STEP: f32 = 5.0;
const SPLIT_MIN: f32 = 20.0;
const SPLIT_MAX: f32 = 80.0;
const DEFAULT_BUILD_ARCH: &str = "auto";
const DEFAULT_BUILD_PYTHON: &str = "3.12";
const DEFAULT_BUILD_CUDA: &str = "cu130";

#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: String,
    pub state_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub poll: PollPolicy,
    pub log_interval: Duration,
    pub fallback_size: TerminalSize,
}

#[derive(Debug)]
pub enum AppEvent {
    Snapshot {
        records: Vec<Value>,
        ack: oneshot::Sender<CycleOutcome>,
    },
    FetchFailed(String),
    CommandDone {
        command: Command,
        report: CommandReport,
    },
    Stats(SystemStats),
    Blueprints(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptPurpose {
    Clone,
    Instantiate,
    Build,
}

impl PromptPurpose {
    pub fn title(self) -> &'static str {
        match self {
            PromptPurpose::Clone => "Name of the copy",
            PromptPurpose::Instantiate => "Name of the satellite",
            PromptPurpose::Build => "Build preset (preset or preset git-url)",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputMode {
    Browse,
    Edit { id: String, field: usize },
    Prompt { purpose: PromptPurpose, buffer: String },
    Terminal,
}

/// Accumulated output of one tool session, ANSI sequences removed.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        let chunk = String::from_utf8_lossy(bytes);
        push_plain(&mut self.text, &chunk);
        if self.text.len() > OUTPUT_LIMIT {
            let mut cut = self.text.len() - OUTPUT_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn tail(&self, lines: usize) -> Vec<&str> {
        let all: Vec<&str> = self.text.split('\n').collect();
        let skip = all.len().saturating_sub(lines);
        all[skip..].to_vec()
    }
}

pub struct App {
    config: Config,
    api: Arc<HttpApi>,
    engine: SyncEngine<PrefStore>,
    table: DispatchTable,
    host: HostInfo,
    notices: NoticeBoard,
    tools: ToolsPane,
    outputs: HashMap<SessionKind, OutputBuffer>,
    tool_view: Option<SessionKind>,
    mode: InputMode,
    selected: usize,
    splits: SplitSizes,
    stats: Option<SystemStats>,
    blueprints: Vec<String>,
    connected: bool,
    last_error: Option<String>,
    overwrite_armed: Option<String>,
    resync_requested: bool,
    tool_size: Option<TerminalSize>,
    help_open: bool,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    focus_tx: watch::Sender<bool>,
}

impl App {
    pub fn new(
        config: Config,
        api: Arc<HttpApi>,
        prefs: PrefStore,
        app_tx: mpsc::UnboundedSender<AppEvent>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
        focus_tx: watch::Sender<bool>,
    ) -> Self {
        let host = HostInfo {
            scheme: api.base_url().scheme().to_string(),
            hostname: api.base_url().host_str().unwrap_or("localhost").to_string(),
            port: api.base_url().port(),
        };
        let splits = prefs.split_sizes();
        Self {
            config,
            api,
            engine: SyncEngine::new(prefs),
            table: DispatchTable::standard(),
            host,
            notices: NoticeBoard::default(),
            tools: ToolsPane::new(session_tx),
            outputs: HashMap::new(),
            tool_view: None,
            mode: InputMode::Browse,
            selected: 0,
            splits,
            stats: None,
            blueprints: Vec::new(),
            connected: false,
            last_error: None,
            overwrite_armed: None,
            resync_requested: false,
            tool_size: None,
            help_open: false,
            app_tx,
            focus_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &SyncEngine<PrefStore> {
        &self.engine
    }

    pub fn mode(&self) -> &InputMode {
        &self.mode
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn splits(&self) -> &SplitSizes {
        &self.splits
    }

    pub fn stats(&self) -> Option<&SystemStats> {
        self.stats.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn help_open(&self) -> bool {
        self.help_open
    }

    pub fn tool_view(&self) -> Option<SessionKind> {
        self.tool_view
    }

    pub fn tool_target(&self, kind: SessionKind) -> Option<&str> {
        self.tools.target(kind)
    }

    pub fn output(&self, kind: SessionKind) -> Option<&OutputBuffer> {
        self.outputs.get(&kind)
    }

    pub fn notice(&self) -> Option<(NoticeLevel, &str)> {
        self.notices
            .current(Instant::now())
            .map(|notice| (notice.level, notice.message.as_str()))
    }

    /// Ids in display order: the placeholder first when open, then the table.
    pub fn row_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.engine.view().rows().len() + 1);
        if self.engine.guard().placeholder().is_some() {
            ids.push(PLACEHOLDER_ID.to_string());
        }
        ids.extend(self.engine.view().rows().iter().map(|row| row.id.clone()));
        ids
    }

    pub fn selected_id(&self) -> Option<String> {
        self.row_ids().into_iter().nth(self.selected)
    }

    /// Fields offered for editing on `id`; satellites do not get the blueprint.
    pub fn edit_fields(&self, id: &str) -> Vec<Field> {
        let satellite = self.engine.view().row(id).is_some_and(RowView::is_satellite);
        Field::ALL
            .into_iter()
            .filter(|field| !(satellite && *field == Field::Blueprint))
            .collect()
    }

    pub fn current_fields(&self, id: &str) -> Option<&EditableFields> {
        if id == PLACEHOLDER_ID {
            self.engine.guard().placeholder().map(|draft| &draft.fields)
        } else {
            self.engine.guard().draft(id)
        }
    }

    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.resync_requested)
    }

    /// Latest size of the output panel. Only changes reach the terminal session.
    pub fn sync_tool_size(&mut self, size: TerminalSize) {
        if self.tool_size == Some(size) {
            return;
        }
        self.tool_size = Some(size);
        self.tools.resize(size);
    }

    pub fn prune_notices(&mut self) {
        self.notices.prune(Instant::now());
    }

    pub fn shutdown(&mut self) {
        self.tools.close_all();
    }

    fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        self.notices.push(level, message, Instant::now());
    }

    fn sync_focus(&self) {
        self.focus_tx.send_replace(self.engine.should_skip());
    }

    fn clamp_selection(&mut self) {
        let len = self.row_ids().len();
        self.selected = self.selected.min(len.saturating_sub(1));
    }

    pub fn apply_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Snapshot { records, ack } => {
                let summary = self.engine.reconcile(records);
                if !self.connected {
                    info!(event = "control_plane_reachable", base_url = %self.config.base_url);
                }
                self.connected = true;
                self.last_error = None;
                self.clamp_selection();
                let _ = ack.send(summary.outcome);
            }
            AppEvent::FetchFailed(reason) => {
                if self.connected {
                    self.notify(NoticeLevel::Error, format!("Connection lost: {reason}"));
                }
                self.connected = false;
                self.last_error = Some(reason);
            }
            AppEvent::CommandDone { command, report } => self.on_command_done(command, report),
            AppEvent::Stats(stats) => self.stats = Some(stats),
            AppEvent::Blueprints(blueprints) => self.blueprints = blueprints,
        }
    }

    fn on_command_done(&mut self, command: Command, report: CommandReport) {
        self.notify(report.level, report.message.clone());
        if let Command::Delete { id, .. } = &command {
            self.overwrite_armed = report.needs_overwrite.then(|| id.clone());
        }
        if let Some(saved) = &report.saved {
            if matches!(command, Command::Create { .. }) {
                self.engine.cancel_placeholder();
            } else {
                self.engine.commit_saved(saved);
            }
        }
        self.sync_focus();
        self.resync_requested = true;
    }

    pub fn on_session_event(&mut self, event: SessionEvent) {
        if !self.tools.is_current(&event) {
            return;
        }
        self.tools.on_event(&event);
        match event {
            SessionEvent::Output { kind, bytes, .. } => {
                self.outputs.entry(kind).or_default().push(&bytes);
            }
            SessionEvent::Finished { kind, state, .. } => {
                debug!(event = "tool_session_finished", kind = %kind, state = %state);
                if kind == SessionKind::Terminal && self.mode == InputMode::Terminal {
                    self.mode = InputMode::Browse;
                }
            }
        }
    }

    /// Returns true when the operator asked to quit.
    pub fn handle_event(&mut self, event: Event) -> bool {
        let quit = match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            _ => false,
        };
        self.sync_focus();
        quit
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if self.help_open {
            if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::F(1)) {
                self.help_open = false;
            }
            return false;
        }
        match self.mode.clone() {
            InputMode::Browse => self.browse_key(key),
            InputMode::Edit { id, field } => {
                self.edit_key(&id, field, key);
                false
            }
            InputMode::Prompt { purpose, buffer } => {
                self.prompt_key(purpose, buffer, key);
                false
            }
            InputMode::Terminal => {
                self.terminal_key(key);
                false
            }
        }
    }

    fn browse_key(&mut self, key: KeyEvent) -> bool {
        match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Char('?') | KeyCode::F(1) => self.help_open = true,
            KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),
            KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
            KeyCode::Char('g') => self.selected = 0,
            KeyCode::Char('n') => self.open_placeholder(),
            KeyCode::Char('e') => self.begin_edit(),
            KeyCode::Enter => self.run_action(ActionId::Save, None),
            KeyCode::Esc => self.run_action(ActionId::Discard, None),
            KeyCode::Char('s') => self.run_action(ActionId::Start, None),
            KeyCode::Char('x') => self.run_action(ActionId::Stop, None),
            KeyCode::Char('D') => self.run_action(ActionId::Delete, None),
            KeyCode::Char('r') => self.run_action(ActionId::RebuildEnv, None),
            KeyCode::Char('l') => self.run_action(ActionId::Logs, None),
            KeyCode::Char('t') => self.run_action(ActionId::Terminal, None),
            KeyCode::Char('o') => self.run_action(ActionId::Open, None),
            KeyCode::Char('v') => self.run_action(ActionId::View, None),
            KeyCode::Char('a') => self.run_action(ActionId::ToggleAutostart, None),
            KeyCode::Char('B') => self.run_action(ActionId::SaveBlueprint, None),
            KeyCode::Char('c') => self.begin_prompt(PromptPurpose::Clone),
            KeyCode::Char('i') => self.begin_prompt(PromptPurpose::Instantiate),
            KeyCode::Char('b') => self.begin_prompt(PromptPurpose::Build),
            KeyCode::Char('J') => self.move_root(1),
            KeyCode::Char('K') => self.move_root(-1),
            KeyCode::Char('+') => self.adjust_split(SPLIT_STEP),
            KeyCode::Char('-') => self.adjust_split(-SPLIT_STEP),
            KeyCode::Tab => self.cycle_tool_view(),
            KeyCode::Char('w') => self.close_tool_view(),
            KeyCode::Char('R') => self.resync_requested = true,
            _ => {}
        }
        false
    }

    fn move_selection(&mut self, delta: isize) {
        let len = self.row_ids().len();
        if len == 0 {
            self.selected = 0;
            return;
        }
        let next = (self.selected as isize + delta).clamp(0, len as isize - 1);
        self.selected = next as usize;
    }

    fn open_placeholder(&mut self) {
        let gpus = self
            .stats
            .as_ref()
            .and_then(SystemStats::best_gpu)
            .map(|gpu| GpuSet::from_iter([gpu]))
            .unwrap_or_default();
        if !self.engine.open_placeholder(gpus) {
            self.notify(NoticeLevel::Info, "A new instance is already being edited.");
        }
        self.selected = 0;
        self.enter_edit(PLACEHOLDER_ID.to_string());
    }

    fn begin_edit(&mut self) {
        match self.selected_id() {
            Some(id) => self.enter_edit(id),
            None => self.notify(NoticeLevel::Info, "No instance selected."),
        }
    }

    fn enter_edit(&mut self, id: String) {
        if id == PLACEHOLDER_ID {
            self.engine.focus_placeholder(true);
        }
        self.mode = InputMode::Edit { id, field: 0 };
    }

    fn leave_edit(&mut self) {
        self.engine.focus_placeholder(false);
        self.mode = InputMode::Browse;
    }

    fn edit_key(&mut self, id: &str, field: usize, key: KeyEvent) {
        let fields = self.edit_fields(id);
        let count = fields.len().max(1);
        match key.code {
            KeyCode::Tab | KeyCode::Down => {
                self.mode = InputMode::Edit {
                    id: id.to_string(),
                    field: (field + 1) % count,
                };
            }
            KeyCode::BackTab | KeyCode::Up if !is_blueprint_cycle(&fields, field, key.code) => {
                self.mode = InputMode::Edit {
                    id: id.to_string(),
                    field: (field + count - 1) % count,
                };
            }
            KeyCode::Enter => {
                self.leave_edit();
                self.run_action_on(id.to_string(), ActionId::Save, None);
            }
            KeyCode::Esc => {
                self.leave_edit();
                self.run_action_on(id.to_string(), ActionId::Discard, None);
            }
            code => {
                let Some(current_field) = fields.get(field).copied() else {
                    return;
                };
                let Some(current) = self.current_fields(id) else {
                    self.leave_edit();
                    return;
                };
                if let Some(edit) = field_edit(current_field, current, code, &self.blueprints) {
                    self.engine.apply_input(id, &edit);
                }
            }
        }
    }

    fn begin_prompt(&mut self, purpose: PromptPurpose) {
        if purpose != PromptPurpose::Build && self.selected_id().is_none() {
            self.notify(NoticeLevel::Info, "No instance selected.");
            return;
        }
        self.mode = InputMode::Prompt {
            purpose,
            buffer: String::new(),
        };
    }

    fn prompt_key(&mut self, purpose: PromptPurpose, mut buffer: String, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => self.mode = InputMode::Browse,
            KeyCode::Enter => {
                self.mode = InputMode::Browse;
                match purpose {
                    PromptPurpose::Clone => self.run_action(ActionId::Clone, Some(&buffer)),
                    PromptPurpose::Instantiate => {
                        self.run_action(ActionId::Instantiate, Some(&buffer))
                    }
                    PromptPurpose::Build => self.start_build(&buffer),
                }
            }
            KeyCode::Backspace => {
                buffer.pop();
                self.mode = InputMode::Prompt { purpose, buffer };
            }
            KeyCode::Char(ch) => {
                buffer.push(ch);
                self.mode = InputMode::Prompt { purpose, buffer };
            }
            _ => {}
        }
    }

    fn terminal_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.mode = InputMode::Browse;
            return;
        }
        if let Some(bytes) = key_to_bytes(key) {
            if !self.tools.send_input(SessionKind::Terminal, bytes) {
                self.mode = InputMode::Browse;
            }
        }
    }

    fn run_action(&mut self, action: ActionId, input: Option<&str>) {
        match self.selected_id() {
            Some(id) => self.run_action_on(id, action, input),
            None => self.notify(NoticeLevel::Info, "No instance selected."),
        }
    }

    /// Rows can shift under the selection between polls, so edit mode names
    /// its row explicitly.
    fn run_action_on(&mut self, id: String, action: ActionId, input: Option<&str>) {
        if id != PLACEHOLDER_ID && self.engine.view().row(&id).is_none() {
            self.notify(NoticeLevel::Info, "That instance is no longer listed.");
            return;
        }
        let overwrite = action == ActionId::Delete && self.overwrite_armed.as_deref() == Some(id.as_str());
        let outcome = {
            let row = if id == PLACEHOLDER_ID {
                None
            } else {
                self.engine.view().row(&id)
            };
            let ctx = RowContext {
                row,
                guard: self.engine.guard(),
                host: &self.host,
                input,
                delete_mode: DeleteMode::Trash,
                overwrite,
            };
            self.table.dispatch(action, &ctx)
        };
        debug!(event = "action_dispatched", action = %action, instance = %id);
        match outcome {
            Dispatch::Command(command) => self.spawn_command(command),
            Dispatch::View(request) => self.open_view(request),
            Dispatch::Refused(reason) => self.notify(NoticeLevel::Info, reason),
        }
    }

    fn spawn_command(&mut self, command: Command) {
        let api = self.api.clone();
        let tx = self.app_tx.clone();
        tokio::spawn(async move {
            let report = execute(api.as_ref(), &command).await;
            let _ = tx.send(AppEvent::CommandDone { command, report });
        });
    }

    fn open_view(&mut self, request: ViewRequest) {
        match request {
            ViewRequest::Logs { id, name } => {
                let source: Arc<dyn RemoteApi> = self.api.clone();
                let connector = LogTailConnector::new(source, id.clone(), self.config.log_interval);
                self.open_tool(SessionKind::Logs, &id, Handshake::None, Arc::new(connector));
                self.notify(NoticeLevel::Info, format!("Tailing logs of '{name}'."));
            }
            ViewRequest::Terminal { id, name } => match self.api.terminal_url(&id) {
                Ok(url) => {
                    let size = self.tool_size.unwrap_or(self.config.fallback_size);
                    self.open_tool(
                        SessionKind::Terminal,
                        &id,
                        Handshake::Terminal(size),
                        Arc::new(WsConnector::new(url)),
                    );
                    self.mode = InputMode::Terminal;
                    self.notify(
                        NoticeLevel::Info,
                        format!("Terminal on '{name}'. Ctrl-] returns to the table."),
                    );
                }
                Err(err) => self.notify(NoticeLevel::Error, err.reason()),
            },
            ViewRequest::Url { url } => self.notify(NoticeLevel::Info, format!("Open {url}")),
            ViewRequest::DiscardEdits { id } => {
                if self.engine.guard().is_dirty(&id) {
                    self.engine.discard(&id);
                    self.notify(NoticeLevel::Info, "Changes discarded.");
                }
            }
            ViewRequest::DiscardNew => {
                self.engine.cancel_placeholder();
                self.clamp_selection();
            }
            ViewRequest::BlueprintEditor { .. } => self.notify(
                NoticeLevel::Info,
                "Blueprint editing is not available in the console.",
            ),
        }
    }

    fn start_build(&mut self, input: &str) {
        let Some(request) = build_request(input) else {
            self.notify(NoticeLevel::Info, "A build preset is required.");
            return;
        };
        match self.api.build_url() {
            Ok(url) => {
                let target = request.preset.clone();
                self.open_tool(
                    SessionKind::Build,
                    &target,
                    Handshake::Build(request),
                    Arc::new(WsConnector::new(url)),
                );
                self.notify(NoticeLevel::Info, format!("Building '{target}'."));
            }
            Err(err) => self.notify(NoticeLevel::Error, err.reason()),
        }
    }

    fn open_tool(
        &mut self,
        kind: SessionKind,
        target: &str,
        handshake: Handshake,
        connector: Arc<dyn Connector>,
    ) {
        self.outputs.insert(kind, OutputBuffer::default());
        self.tools.open(kind, target, handshake, connector);
        self.tool_view = Some(kind);
    }

    fn cycle_tool_view(&mut self) {
        let order = [SessionKind::Logs, SessionKind::Terminal, SessionKind::Build];
        let start = self
            .tool_view
            .and_then(|kind| order.iter().position(|candidate| *candidate == kind))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        self.tool_view = (0..order.len())
            .map(|offset| order[(start + offset) % order.len()])
            .find(|kind| self.outputs.contains_key(kind))
            .or(self.tool_view);
    }

    fn close_tool_view(&mut self) {
        if let Some(kind) = self.tool_view {
            self.tools.close(kind);
        }
    }

    fn move_root(&mut self, delta: isize) {
        let Some(id) = self.selected_id() else {
            return;
        };
        if self.engine.view().row(&id).map_or(true, RowView::is_satellite) {
            self.notify(NoticeLevel::Info, "Only top-level instances can be reordered.");
            return;
        }
        match self.engine.move_root(&id, delta) {
            Ok(true) => {
                if let Some(pos) = self.row_ids().iter().position(|candidate| *candidate == id) {
                    self.selected = pos;
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(event = "display_order_save_failed", error = %err);
                self.notify(NoticeLevel::Error, format!("Could not save the order: {err}"));
            }
        }
    }

    fn adjust_split(&mut self, delta: f32) {
        let table = (self.splits.vertical[0] + delta).clamp(SPLIT_MIN, SPLIT_MAX);
        self.splits.vertical = [table, 100.0 - table];
        if let Err(err) = self.engine.order_store().save_split_sizes(&self.splits) {
            warn!(event = "split_sizes_save_failed", error = %err);
        }
    }
}

fn is_blueprint_cycle(fields: &[Field], field: usize, code: KeyCode) -> bool {
    code == KeyCode::Up && fields.get(field) == Some(&Field::Blueprint)
}

/// Maps one key press onto an edit of `field`, given its current value.
pub fn field_edit(
    field: Field,
    current: &EditableFields,
    code: KeyCode,
    blueprints: &[String],
) -> Option<FieldEdit> {
    match field {
        Field::Gpus => match code {
            KeyCode::Char(ch) => ch.to_digit(10).map(FieldEdit::ToggleGpu),
            KeyCode::Backspace | KeyCode::Delete => Some(FieldEdit::Gpus(GpuSet::new())),
            _ => None,
        },
        Field::Port => {
            let mut digits = current.value(Field::Port);
            match code {
                KeyCode::Char(ch) if ch.is_ascii_digit() => digits.push(ch),
                KeyCode::Backspace => {
                    digits.pop();
                }
                _ => return None,
            }
            if digits.is_empty() {
                return Some(FieldEdit::Port(None));
            }
            digits.parse::<u16>().ok().map(|port| FieldEdit::Port(Some(port)))
        }
        field if field.is_flag() => match code {
            KeyCode::Char(' ') | KeyCode::Left | KeyCode::Right => {
                Some(FieldEdit::Flag(field, current.value(field) != "true"))
            }
            _ => None,
        },
        Field::Blueprint if matches!(code, KeyCode::Up) && !blueprints.is_empty() => {
            let value = current.value(Field::Blueprint);
            let next = blueprints
                .iter()
                .position(|name| *name == value)
                .map(|pos| (pos + 1) % blueprints.len())
                .unwrap_or(0);
            Some(FieldEdit::Text(Field::Blueprint, blueprints[next].clone()))
        }
        field => {
            let mut value = current.value(field);
            match code {
                KeyCode::Char(ch) => value.push(ch),
                KeyCode::Backspace => {
                    value.pop()?;
                }
                _ => return None,
            }
            Some(FieldEdit::Text(field, value))
        }
    }
}

/// Build request from `preset [git-url]`, with the default toolchain pins.
pub fn build_request(input: &str) -> Option<BuildRequest> {
    let mut parts = input.split_whitespace();
    let preset = parts.next()?.to_string();
    Some(BuildRequest {
        preset,
        arch: DEFAULT_BUILD_ARCH.to_string(),
        git_url: parts.next().unwrap_or_default().to_string(),
        python_ver: DEFAULT_BUILD_PYTHON.to_string(),
        cuda_ver: DEFAULT_BUILD_CUDA.to_string(),
    })
}

/// Raw bytes a terminal expects for a key press.
pub fn key_to_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    let bytes = match key.code {
        KeyCode::Char(ch) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            if !ch.is_ascii_alphabetic() {
                return None;
            }
            vec![ch.to_ascii_lowercase() as u8 - b'a' + 1]
        }
        KeyCode::Char(ch) => ch.to_string().into_bytes(),
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => b"\x1b".to_vec(),
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Appends `chunk` to `out` without escape sequences or carriage returns.
fn push_plain(out: &mut String, chunk: &str) {
    let mut chars = chunk.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\x1b' => match chars.next() {
                Some('[') => {
                    for next in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&next) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\r' => {}
            '\x08' => {
                out.pop();
            }
            ch if ch == '\n' || ch == '\t' || !ch.is_control() => out.push(ch),
            _ => {}
        }
    }
}
