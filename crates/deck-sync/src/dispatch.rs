//! Row actions resolved through a table of pure handlers.

use crate::commands::Command;
use crate::dirty::DirtyGuard;
use crate::reconcile::RowView;
use deck_core::url::{instance_url, HostInfo, UrlPurpose};
use deck_core::wire::{DeleteMode, DeleteOptions};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionId {
    Start,
    Stop,
    Delete,
    Save,
    Discard,
    Logs,
    Terminal,
    View,
    Open,
    RebuildEnv,
    Clone,
    Instantiate,
    SaveBlueprint,
    ToggleAutostart,
}

impl ActionId {
    pub const ALL: [ActionId; 14] = [
        ActionId::Start,
        ActionId::Stop,
        ActionId::Delete,
        ActionId::Save,
        ActionId::Discard,
        ActionId::Logs,
        ActionId::Terminal,
        ActionId::View,
        ActionId::Open,
        ActionId::RebuildEnv,
        ActionId::Clone,
        ActionId::Instantiate,
        ActionId::SaveBlueprint,
        ActionId::ToggleAutostart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionId::Start => "start",
            ActionId::Stop => "stop",
            ActionId::Delete => "delete",
            ActionId::Save => "save",
            ActionId::Discard => "discard",
            ActionId::Logs => "logs",
            ActionId::Terminal => "terminal",
            ActionId::View => "view",
            ActionId::Open => "open",
            ActionId::RebuildEnv => "rebuild-env",
            ActionId::Clone => "clone",
            ActionId::Instantiate => "instantiate",
            ActionId::SaveBlueprint => "save-blueprint",
            ActionId::ToggleAutostart => "autostart",
        }
    }

    /// Satellites share their parent's environment and cannot run these.
    pub fn allowed_for_satellite(self) -> bool {
        !matches!(
            self,
            ActionId::Terminal | ActionId::RebuildEnv | ActionId::Clone | ActionId::SaveBlueprint
        )
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ActionId::ALL
            .into_iter()
            .find(|action| action.as_str() == input)
            .ok_or_else(|| format!("unknown action: {input}"))
    }
}

/// Everything a handler may look at. `row` is `None` for the placeholder row.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub row: Option<&'a RowView>,
    pub guard: &'a DirtyGuard,
    pub host: &'a HostInfo,
    /// Operator-supplied text, such as the new name for clone and instantiate.
    pub input: Option<&'a str>,
    pub delete_mode: DeleteMode,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewRequest {
    Logs { id: String, name: String },
    Terminal { id: String, name: String },
    Url { url: String },
    DiscardEdits { id: String },
    DiscardNew,
    BlueprintEditor { id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Command(Command),
    View(ViewRequest),
    Refused(String),
}

pub type Handler = fn(&RowContext<'_>) -> Dispatch;

pub struct DispatchTable {
    handlers: HashMap<ActionId, Handler>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl DispatchTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(ActionId::Start, start);
        table.register(ActionId::Stop, stop);
        table.register(ActionId::Delete, delete);
        table.register(ActionId::Save, save);
        table.register(ActionId::Discard, discard);
        table.register(ActionId::Logs, logs);
        table.register(ActionId::Terminal, terminal);
        table.register(ActionId::View, view);
        table.register(ActionId::Open, open);
        table.register(ActionId::RebuildEnv, rebuild);
        table.register(ActionId::Clone, clone_instance);
        table.register(ActionId::Instantiate, instantiate);
        table.register(ActionId::SaveBlueprint, save_blueprint);
        table.register(ActionId::ToggleAutostart, toggle_autostart);
        table
    }

    pub fn register(&mut self, action: ActionId, handler: Handler) {
        self.handlers.insert(action, handler);
    }

    pub fn dispatch(&self, action: ActionId, ctx: &RowContext<'_>) -> Dispatch {
        if let Some(row) = ctx.row {
            if row.is_satellite() && !action.allowed_for_satellite() {
                return Dispatch::Refused(format!("{action} is not available for satellites"));
            }
        }
        match self.handlers.get(&action) {
            Some(handler) => handler(ctx),
            None => Dispatch::Refused(format!("no handler for {action}")),
        }
    }

    pub fn dispatch_str(&self, action: &str, ctx: &RowContext<'_>) -> Dispatch {
        match action.parse::<ActionId>() {
            Ok(action) => self.dispatch(action, ctx),
            Err(reason) => Dispatch::Refused(reason),
        }
    }
}

fn existing<'a>(ctx: &RowContext<'a>) -> Result<&'a RowView, Dispatch> {
    ctx.row
        .ok_or_else(|| Dispatch::Refused("save the new instance first".to_string()))
}

macro_rules! row_or_refuse {
    ($ctx:expr) => {
        match existing($ctx) {
            Ok(row) => row,
            Err(refusal) => return refusal,
        }
    };
}

fn ids(row: &RowView) -> (String, String) {
    (row.id.clone(), row.entity.name.clone())
}

fn start(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    if !row.actions.start {
        return Dispatch::Refused(format!("'{}' is not stopped", row.entity.name));
    }
    let (id, name) = ids(row);
    Dispatch::Command(Command::Start { id, name })
}

fn stop(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    if !row.actions.stop {
        return Dispatch::Refused(format!("'{}' is already stopped", row.entity.name));
    }
    let (id, name) = ids(row);
    Dispatch::Command(Command::Stop { id, name })
}

fn delete(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    if !row.actions.delete {
        return Dispatch::Refused(format!("stop '{}' before deleting it", row.entity.name));
    }
    let (id, name) = ids(row);
    Dispatch::Command(Command::Delete {
        id,
        name,
        options: DeleteOptions {
            mode: ctx.delete_mode,
            overwrite: ctx.overwrite,
        },
    })
}

fn save(ctx: &RowContext<'_>) -> Dispatch {
    let Some(row) = ctx.row else {
        return match ctx.guard.placeholder() {
            None => Dispatch::Refused("nothing to save".to_string()),
            Some(draft) if !draft.can_save() => {
                Dispatch::Refused("name and blueprint are required".to_string())
            }
            Some(draft) => Dispatch::Command(Command::Create {
                draft: draft.to_patch(),
            }),
        };
    };
    match ctx.guard.change_set(&row.id) {
        Some(change) if !change.is_empty() => Dispatch::Command(Command::Update {
            name: row.entity.name.clone(),
            change,
        }),
        _ => Dispatch::Refused(format!("no pending changes for '{}'", row.entity.name)),
    }
}

fn discard(ctx: &RowContext<'_>) -> Dispatch {
    match ctx.row {
        Some(row) => Dispatch::View(ViewRequest::DiscardEdits { id: row.id.clone() }),
        None => Dispatch::View(ViewRequest::DiscardNew),
    }
}

fn logs(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    let (id, name) = ids(row);
    Dispatch::View(ViewRequest::Logs { id, name })
}

fn terminal(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    if !row.status.is_started() {
        return Dispatch::Refused(format!("'{}' is not running", row.entity.name));
    }
    let (id, name) = ids(row);
    Dispatch::View(ViewRequest::Terminal { id, name })
}

fn link(ctx: &RowContext<'_>, purpose: UrlPurpose) -> Dispatch {
    let row = row_or_refuse!(ctx);
    match instance_url(&row.entity, ctx.host, purpose) {
        Some(url) => Dispatch::View(ViewRequest::Url { url }),
        None => Dispatch::Refused(format!("'{}' is not running", row.entity.name)),
    }
}

fn view(ctx: &RowContext<'_>) -> Dispatch {
    link(ctx, UrlPurpose::View)
}

fn open(ctx: &RowContext<'_>) -> Dispatch {
    link(ctx, UrlPurpose::Open)
}

fn rebuild(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    let (id, name) = ids(row);
    Dispatch::Command(Command::Rebuild { id, name })
}

fn new_name(ctx: &RowContext<'_>) -> Option<String> {
    ctx.input
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn clone_instance(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    let Some(new_name) = new_name(ctx) else {
        return Dispatch::Refused("a name for the copy is required".to_string());
    };
    let (id, name) = ids(row);
    Dispatch::Command(Command::Clone { id, name, new_name })
}

fn instantiate(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    let Some(new_name) = new_name(ctx) else {
        return Dispatch::Refused("a name for the satellite is required".to_string());
    };
    let (id, name) = ids(row);
    Dispatch::Command(Command::Instantiate { id, name, new_name })
}

fn save_blueprint(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    Dispatch::View(ViewRequest::BlueprintEditor { id: row.id.clone() })
}

fn toggle_autostart(ctx: &RowContext<'_>) -> Dispatch {
    let row = row_or_refuse!(ctx);
    let (id, name) = ids(row);
    Dispatch::Command(Command::SetAutostart {
        id,
        name,
        value: !row.entity.autostart,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::{Field, FieldEdit};
    use crate::reconcile::{self, TableView};
    use deck_core::{normalize_snapshot, GpuSet, PLACEHOLDER_ID};
    use serde_json::json;

    struct Fixture {
        view: TableView,
        guard: DirtyGuard,
        host: HostInfo,
    }

    impl Fixture {
        fn new() -> Self {
            let (snapshot, _) = normalize_snapshot(vec![
                json!({"id": "1", "name": "comfy", "status": "started", "port": 8188}),
                json!({"id": "2", "name": "comfy-sat", "status": "stopped", "parent_instance_id": "1"}),
                json!({"id": "3", "name": "forge", "status": "stopped"}),
            ]);
            let mut view = TableView::default();
            let mut guard = DirtyGuard::new();
            let plan = reconcile::plan(&guard, &snapshot, &[]);
            reconcile::apply(&mut view, &mut guard, plan);
            Self {
                view,
                guard,
                host: HostInfo {
                    scheme: "http".to_string(),
                    hostname: "deck.lan".to_string(),
                    port: None,
                },
            }
        }

        fn ctx(&self, id: Option<&str>) -> RowContext<'_> {
            RowContext {
                row: id.and_then(|id| self.view.row(id)),
                guard: &self.guard,
                host: &self.host,
                input: None,
                delete_mode: DeleteMode::Trash,
                overwrite: false,
            }
        }
    }

    #[test]
    fn lifecycle_actions_follow_status() {
        let fx = Fixture::new();
        let table = DispatchTable::standard();

        assert!(matches!(
            table.dispatch(ActionId::Stop, &fx.ctx(Some("1"))),
            Dispatch::Command(Command::Stop { .. })
        ));
        assert!(matches!(
            table.dispatch(ActionId::Start, &fx.ctx(Some("1"))),
            Dispatch::Refused(_)
        ));
        assert!(matches!(
            table.dispatch(ActionId::Delete, &fx.ctx(Some("1"))),
            Dispatch::Refused(_)
        ));
        match table.dispatch_str("delete", &fx.ctx(Some("3"))) {
            Dispatch::Command(Command::Delete { options, .. }) => {
                assert_eq!(options.mode, DeleteMode::Trash);
                assert!(!options.overwrite);
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[test]
    fn satellites_refuse_environment_actions() {
        let fx = Fixture::new();
        let table = DispatchTable::standard();
        for action in ["terminal", "rebuild-env", "clone", "save-blueprint"] {
            assert!(
                matches!(table.dispatch_str(action, &fx.ctx(Some("2"))), Dispatch::Refused(_)),
                "{action} should be refused"
            );
        }
        assert!(matches!(
            table.dispatch(ActionId::Logs, &fx.ctx(Some("2"))),
            Dispatch::View(ViewRequest::Logs { .. })
        ));
        assert!(matches!(
            table.dispatch(ActionId::RebuildEnv, &fx.ctx(Some("3"))),
            Dispatch::Command(Command::Rebuild { .. })
        ));
    }

    #[test]
    fn links_and_terminal_need_a_running_instance() {
        let fx = Fixture::new();
        let table = DispatchTable::standard();
        assert_eq!(
            table.dispatch(ActionId::Open, &fx.ctx(Some("1"))),
            Dispatch::View(ViewRequest::Url {
                url: "http://deck.lan:8188/".to_string()
            })
        );
        assert!(matches!(
            table.dispatch(ActionId::Terminal, &fx.ctx(Some("1"))),
            Dispatch::View(ViewRequest::Terminal { .. })
        ));
        assert!(matches!(
            table.dispatch(ActionId::View, &fx.ctx(Some("3"))),
            Dispatch::Refused(_)
        ));
    }

    #[test]
    fn save_uses_change_set_or_placeholder() {
        let mut fx = Fixture::new();
        let table = DispatchTable::standard();
        assert!(matches!(
            table.dispatch(ActionId::Save, &fx.ctx(Some("3"))),
            Dispatch::Refused(_)
        ));

        fx.guard
            .apply_input("3", &FieldEdit::Text(Field::Name, "forge-xl".into()));
        match table.dispatch(ActionId::Save, &fx.ctx(Some("3"))) {
            Dispatch::Command(Command::Update { change, .. }) => {
                assert_eq!(change.patch.name.as_deref(), Some("forge-xl"));
                assert!(!change.requires_restart);
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }

        assert!(matches!(
            table.dispatch(ActionId::Save, &fx.ctx(None)),
            Dispatch::Refused(_)
        ));
        fx.guard.open_placeholder(GpuSet::from_csv("0"));
        fx.guard
            .apply_input(PLACEHOLDER_ID, &FieldEdit::Text(Field::Name, "flux".into()));
        assert!(matches!(
            table.dispatch(ActionId::Save, &fx.ctx(None)),
            Dispatch::Refused(_)
        ));
        fx.guard.apply_input(
            PLACEHOLDER_ID,
            &FieldEdit::Text(Field::Blueprint, "flux.sh".into()),
        );
        assert!(matches!(
            table.dispatch(ActionId::Save, &fx.ctx(None)),
            Dispatch::Command(Command::Create { .. })
        ));
        assert_eq!(
            table.dispatch(ActionId::Discard, &fx.ctx(None)),
            Dispatch::View(ViewRequest::DiscardNew)
        );
    }

    #[test]
    fn copies_need_a_name_and_unknown_actions_are_refused() {
        let fx = Fixture::new();
        let table = DispatchTable::standard();
        let mut ctx = fx.ctx(Some("3"));
        assert!(matches!(
            table.dispatch(ActionId::Clone, &ctx),
            Dispatch::Refused(_)
        ));
        ctx.input = Some("  forge-copy ");
        assert_eq!(
            table.dispatch(ActionId::Clone, &ctx),
            Dispatch::Command(Command::Clone {
                id: "3".into(),
                name: "forge".into(),
                new_name: "forge-copy".into()
            })
        );
        assert!(matches!(
            table.dispatch_str("reboot", &ctx),
            Dispatch::Refused(_)
        ));
        assert!(matches!(
            DispatchTable::empty().dispatch(ActionId::Start, &ctx),
            Dispatch::Refused(_)
        ));
    }
}
