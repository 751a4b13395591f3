use async_trait::async_trait;
use deck_core::stats::SystemStats;
use deck_core::url::HostInfo;
use deck_core::wire::{DeleteMode, DeleteOptions, InstancePatch, LogChunk};
use deck_core::{Entity, GpuSet, InstanceStatus, PLACEHOLDER_ID};
use deck_sync::dirty::{Field, FieldEdit};
use deck_sync::session::log_tail::LogTailConnector;
use deck_sync::session::Handshake;
use deck_sync::{
    execute, ActionId, ApiError, Command, CycleOutcome, Dispatch, DispatchTable, MemoryOrderStore,
    NoticeBoard, NoticeLevel, OrderStore, RemoteApi, RowContext, SessionEvent, SessionKind,
    SessionState, SyncEngine, ToolsPane,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    records: Vec<Value>,
    calls: Vec<String>,
    trashed: Vec<String>,
    logs: VecDeque<LogChunk>,
}

/// In-process control plane keeping records as raw JSON.
#[derive(Default)]
struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    fn with_records(records: Value) -> Arc<Self> {
        let api = Self::default();
        api.state.lock().expect("state").records = records.as_array().cloned().unwrap_or_default();
        Arc::new(api)
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().expect("state").calls.clone()
    }

    fn push_log(&self, content: &str, size: u64) {
        self.state.lock().expect("state").logs.push_back(LogChunk {
            content: content.to_string(),
            size,
        });
    }

    fn set_field(&self, id: &str, key: &str, value: Value) -> Result<(), ApiError> {
        let mut state = self.state.lock().expect("state");
        let record = state
            .records
            .iter_mut()
            .find(|record| record["id"] == json!(id))
            .ok_or_else(|| ApiError::Rejected {
                status: 404,
                reason: "Instance not found".to_string(),
            })?;
        record[key] = value;
        Ok(())
    }

    fn record(&self, id: &str) -> Result<Entity, ApiError> {
        let state = self.state.lock().expect("state");
        let record = state
            .records
            .iter()
            .find(|record| record["id"] == json!(id))
            .cloned()
            .ok_or_else(|| ApiError::Decode(format!("no record {id}")))?;
        Entity::from_record(0, record).map_err(|err| ApiError::Decode(err.to_string()))
    }

    fn log_call(&self, call: String) {
        self.state.lock().expect("state").calls.push(call);
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn list_instances(&self) -> Result<Vec<Value>, ApiError> {
        self.log_call("list".to_string());
        Ok(self.state.lock().expect("state").records.clone())
    }

    async fn start(&self, id: &str) -> Result<(), ApiError> {
        self.log_call(format!("start {id}"));
        self.set_field(id, "status", json!("starting"))
    }

    async fn stop(&self, id: &str) -> Result<(), ApiError> {
        self.log_call(format!("stop {id}"));
        self.set_field(id, "status", json!("stopping"))
    }

    async fn delete(&self, id: &str, options: DeleteOptions) -> Result<(), ApiError> {
        self.log_call(format!("delete {id} overwrite={}", options.overwrite));
        let mut state = self.state.lock().expect("state");
        if options.mode == DeleteMode::Trash
            && state.trashed.iter().any(|trashed| trashed == id)
            && !options.overwrite
        {
            return Err(ApiError::Conflict {
                reason: "Trashcan already holds this instance".to_string(),
            });
        }
        state.records.retain(|record| record["id"] != json!(id));
        Ok(())
    }

    async fn update(&self, id: &str, patch: &InstancePatch) -> Result<Entity, ApiError> {
        self.log_call(format!("update {id}"));
        let fields = serde_json::to_value(patch).map_err(|err| ApiError::Decode(err.to_string()))?;
        if let Value::Object(fields) = fields {
            for (key, value) in fields {
                self.set_field(id, &key, value)?;
            }
        }
        self.record(id)
    }

    async fn create(&self, draft: &InstancePatch) -> Result<Entity, ApiError> {
        self.log_call("create".to_string());
        let mut record =
            serde_json::to_value(draft).map_err(|err| ApiError::Decode(err.to_string()))?;
        let id = {
            let state = self.state.lock().expect("state");
            format!("{}", state.records.len() + 100)
        };
        record["id"] = json!(id);
        record["status"] = json!("stopped");
        self.state.lock().expect("state").records.push(record);
        self.record(&id)
    }

    async fn rebuild(&self, id: &str) -> Result<(), ApiError> {
        self.log_call(format!("rebuild {id}"));
        Ok(())
    }

    async fn clone_instance(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        self.log_call(format!("clone {id} {new_name}"));
        Ok(())
    }

    async fn instantiate(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        self.log_call(format!("instantiate {id} {new_name}"));
        Ok(())
    }

    async fn fetch_logs(&self, id: &str, offset: u64) -> Result<LogChunk, ApiError> {
        self.log_call(format!("logs {id} {offset}"));
        self.state
            .lock()
            .expect("state")
            .logs
            .pop_front()
            .ok_or_else(|| ApiError::LogsUnavailable { id: id.to_string() })
    }

    async fn system_stats(&self) -> Result<SystemStats, ApiError> {
        Ok(SystemStats::default())
    }

    async fn list_blueprints(&self) -> Result<Vec<String>, ApiError> {
        Ok(vec!["ComfyUI.sh".to_string()])
    }
}

fn host() -> HostInfo {
    HostInfo {
        scheme: "http".to_string(),
        hostname: "deck.lan".to_string(),
        port: None,
    }
}

async fn resync<S: OrderStore>(engine: &mut SyncEngine<S>, api: &FakeApi) -> CycleOutcome {
    let records = api.list_instances().await.expect("list");
    engine.reconcile(records).outcome
}

fn dispatch<S: OrderStore>(
    engine: &SyncEngine<S>,
    action: ActionId,
    id: Option<&str>,
    overwrite: bool,
) -> Dispatch {
    let host = host();
    let ctx = RowContext {
        row: id.and_then(|id| engine.view().row(id)),
        guard: engine.guard(),
        host: &host,
        input: None,
        delete_mode: DeleteMode::Trash,
        overwrite,
    };
    DispatchTable::standard().dispatch(action, &ctx)
}

#[tokio::test]
async fn stored_order_wins_over_server_order() {
    let api = FakeApi::with_records(json!([
        {"id": "a", "name": "alpha"},
        {"id": "c", "name": "gamma"},
        {"id": "b", "name": "beta"}
    ]));
    let store = MemoryOrderStore::new(vec!["b".to_string(), "a".to_string()]);
    let mut engine = SyncEngine::new(store.clone());
    resync(&mut engine, &api).await;
    assert_eq!(engine.view().root_ids(), vec!["b", "a", "c"]);

    engine.move_root("c", -2).expect("persist order");
    assert_eq!(store.load(), vec!["b", "c", "a"]);
    resync(&mut engine, &api).await;
    assert_eq!(engine.view().root_ids(), vec!["b", "c", "a"]);
}

#[tokio::test]
async fn dirty_row_survives_polls_until_saved() {
    let api = FakeApi::with_records(json!([
        {"id": "1", "name": "comfy", "status": "stopped", "hostname": ""},
        {"id": "2", "name": "forge", "status": "stopped"}
    ]));
    let mut engine = SyncEngine::new(MemoryOrderStore::default());
    resync(&mut engine, &api).await;

    assert!(engine.apply_input("1", &FieldEdit::Text(Field::Hostname, "comfy.lan".into())));
    api.set_field("2", "status", json!("starting")).expect("status");
    api.state.lock().expect("state").records.push(json!({"id": "3", "name": "fresh"}));

    let outcome = resync(&mut engine, &api).await;
    assert_eq!(
        outcome,
        CycleOutcome::Reconciled {
            any_transitional: true
        }
    );
    assert_eq!(engine.view().rebuild_count(), 1);
    assert!(engine.view().row("3").is_none());
    assert_eq!(
        engine.view().row("2").map(|row| row.status.clone()),
        Some(InstanceStatus::Starting)
    );
    assert_eq!(
        engine.guard().draft("1").map(|draft| draft.hostname.as_str()),
        Some("comfy.lan")
    );

    let Dispatch::Command(command) = dispatch(&engine, ActionId::Save, Some("1"), false) else {
        panic!("save should produce a command");
    };
    let report = execute(api.as_ref(), &command).await;
    assert!(report.is_success());
    engine.commit_saved(report.saved.as_ref().expect("saved entity"));
    assert!(!engine.guard().any_dirty());

    resync(&mut engine, &api).await;
    assert_eq!(engine.view().rebuild_count(), 2);
    assert!(engine.view().row("3").is_some());
    assert_eq!(
        engine.view().row("1").and_then(|row| row.entity.hostname.clone()),
        Some("comfy.lan".to_string())
    );
}

#[tokio::test]
async fn typing_into_the_placeholder_is_never_overwritten() {
    let api = FakeApi::with_records(json!([]));
    let mut engine = SyncEngine::new(MemoryOrderStore::default());
    resync(&mut engine, &api).await;
    assert!(engine.view().shows_empty_notice());

    assert!(engine.open_placeholder(GpuSet::from_csv("1")));
    engine.focus_placeholder(true);
    engine.apply_input(PLACEHOLDER_ID, &FieldEdit::Text(Field::Name, "flux".into()));
    assert!(engine.should_skip());
    assert_eq!(resync(&mut engine, &api).await, CycleOutcome::Skipped);

    engine.apply_input(
        PLACEHOLDER_ID,
        &FieldEdit::Text(Field::Blueprint, "Flux.sh".into()),
    );
    engine.focus_placeholder(false);
    resync(&mut engine, &api).await;
    let draft = engine.guard().placeholder().expect("placeholder kept");
    assert_eq!(draft.fields.name, "flux");
    assert_eq!(draft.fields.output_path, "flux");
    assert!(!engine.view().shows_empty_notice());

    let Dispatch::Command(command) = dispatch(&engine, ActionId::Save, None, false) else {
        panic!("placeholder save should produce a command");
    };
    let report = execute(api.as_ref(), &command).await;
    assert_eq!(report.level, NoticeLevel::Success);
    engine.cancel_placeholder();
    resync(&mut engine, &api).await;
    let created = &engine.view().rows()[0];
    assert_eq!(created.entity.name, "flux");
    assert_eq!(created.entity.gpus.to_csv(), "1");
}

#[tokio::test]
async fn command_posts_notice_and_resyncs() {
    let api = FakeApi::with_records(json!([
        {"id": "1", "name": "comfy", "status": "stopped"}
    ]));
    let mut engine = SyncEngine::new(MemoryOrderStore::default());
    let mut notices = NoticeBoard::default();
    resync(&mut engine, &api).await;

    let Dispatch::Command(command) = dispatch(&engine, ActionId::Start, Some("1"), false) else {
        panic!("start should produce a command");
    };
    assert_eq!(command, Command::Start { id: "1".into(), name: "comfy".into() });
    let report = execute(api.as_ref(), &command).await;
    let now = Instant::now();
    notices.push(report.level, report.message.clone(), now);
    assert_eq!(
        notices.current(now).map(|notice| notice.message.as_str()),
        Some("Starting 'comfy'.")
    );

    assert_eq!(
        resync(&mut engine, &api).await,
        CycleOutcome::Reconciled {
            any_transitional: true
        }
    );
    let row = engine.view().row("1").expect("row");
    assert!(row.actions.stop);
    assert!(matches!(
        dispatch(&engine, ActionId::Delete, Some("1"), false),
        Dispatch::Refused(_)
    ));
    assert_eq!(api.calls(), vec!["list", "start 1", "list"]);
}

#[tokio::test]
async fn delete_conflict_asks_for_overwrite() {
    let api = FakeApi::with_records(json!([
        {"id": "1", "name": "comfy", "status": "stopped"}
    ]));
    api.state.lock().expect("state").trashed.push("1".to_string());
    let mut engine = SyncEngine::new(MemoryOrderStore::default());
    resync(&mut engine, &api).await;

    let Dispatch::Command(first) = dispatch(&engine, ActionId::Delete, Some("1"), false) else {
        panic!("delete should produce a command");
    };
    let report = execute(api.as_ref(), &first).await;
    assert!(report.needs_overwrite);
    assert_eq!(report.level, NoticeLevel::Info);

    let Dispatch::Command(second) = dispatch(&engine, ActionId::Delete, Some("1"), true) else {
        panic!("delete should produce a command");
    };
    let report = execute(api.as_ref(), &second).await;
    assert!(report.is_success());
    assert_eq!(report.message, "Instance 'comfy' moved to trashcan.");

    resync(&mut engine, &api).await;
    assert!(engine.view().rows().is_empty());
    assert!(engine.view().shows_empty_notice());
}

#[tokio::test(start_paused = true)]
async fn log_pane_tails_until_logs_end() {
    let api = FakeApi::with_records(json!([{"id": "7", "name": "comfy"}]));
    api.push_log("booting\n", 8);
    api.push_log("ready\n", 14);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut pane = ToolsPane::new(events_tx);
    let source: Arc<dyn RemoteApi> = api.clone();
    let connector = LogTailConnector::new(source, "7", Duration::from_millis(2000));
    let session = pane.open(SessionKind::Logs, "7", Handshake::None, Arc::new(connector));

    let mut output = Vec::new();
    let state = loop {
        match events.recv().await.expect("session event") {
            SessionEvent::Output { bytes, .. } => output.extend_from_slice(&bytes),
            event @ SessionEvent::Finished { state, .. } => {
                assert_eq!(event.session(), session);
                pane.on_event(&event);
                break state;
            }
        }
    };
    assert_eq!(state, SessionState::Closed);
    assert_eq!(
        String::from_utf8_lossy(&output),
        "booting\nready\n\n[ENDED] logs unavailable\n"
    );
    assert!(pane.target(SessionKind::Logs).is_none());
    assert_eq!(
        api.calls().iter().filter(|call| call.starts_with("logs")).cloned().collect::<Vec<_>>(),
        vec!["logs 7 0", "logs 7 8", "logs 7 14"]
    );
}
