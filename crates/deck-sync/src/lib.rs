//! Keeps a local view of the remote instance fleet in step with the control
//! plane while the operator edits it, and drives the streaming tool sessions.

pub mod client;
pub mod commands;
pub mod dirty;
pub mod dispatch;
pub mod engine;
pub mod hierarchy;
pub mod notice;
pub mod order;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod tools;

pub use client::{ApiError, HttpApi, RemoteApi};
pub use commands::{execute, Command, CommandReport};
pub use dirty::{ChangeSet, DirtyGuard, Field, FieldEdit};
pub use dispatch::{ActionId, Dispatch, DispatchTable, RowContext, ViewRequest};
pub use engine::{ReconcileSummary, SyncEngine};
pub use notice::{NoticeBoard, NoticeLevel};
pub use order::{MemoryOrderStore, OrderStore};
pub use reconcile::{RenderPlan, RowView, TableView};
pub use scheduler::{CycleOutcome, PollPolicy, PollScheduler};
pub use session::{SessionKind, SessionState};
pub use tools::{SessionEvent, ToolsPane};
