//! Commands against the control plane and the notice each outcome produces.

use crate::client::{ApiError, RemoteApi};
use crate::dirty::ChangeSet;
use crate::notice::NoticeLevel;
use deck_core::wire::{DeleteMode, DeleteOptions, InstancePatch};
use deck_core::Entity;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        id: String,
        name: String,
    },
    Stop {
        id: String,
        name: String,
    },
    Delete {
        id: String,
        name: String,
        options: DeleteOptions,
    },
    Update {
        name: String,
        change: ChangeSet,
    },
    Create {
        draft: InstancePatch,
    },
    Rebuild {
        id: String,
        name: String,
    },
    Clone {
        id: String,
        name: String,
        new_name: String,
    },
    Instantiate {
        id: String,
        name: String,
        new_name: String,
    },
    SetAutostart {
        id: String,
        name: String,
        value: bool,
    },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Delete { .. } => "delete",
            Command::Update { .. } => "update",
            Command::Create { .. } => "create",
            Command::Rebuild { .. } => "rebuild",
            Command::Clone { .. } => "clone",
            Command::Instantiate { .. } => "instantiate",
            Command::SetAutostart { .. } => "autostart",
        }
    }
}

/// Outcome of one command. A resync is due after every report, success or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    pub level: NoticeLevel,
    pub message: String,
    /// Server copy of a saved or created entity.
    pub saved: Option<Entity>,
    /// Set when a delete hit an existing trashed copy and needs overwrite.
    pub needs_overwrite: bool,
}

impl CommandReport {
    fn success(message: String) -> Self {
        Self {
            level: NoticeLevel::Success,
            message,
            saved: None,
            needs_overwrite: false,
        }
    }

    fn failure(err: &ApiError) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: err.reason(),
            saved: None,
            needs_overwrite: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.level != NoticeLevel::Error
    }
}

pub async fn execute(api: &dyn RemoteApi, command: &Command) -> CommandReport {
    let outcome = run(api, command).await;
    match &outcome {
        Ok(report) => {
            info!(event = "command_succeeded", command = command.label(), message = %report.message)
        }
        Err(err) => warn!(event = "command_failed", command = command.label(), error = %err),
    }
    match outcome {
        Ok(report) => report,
        Err(ApiError::Conflict { reason }) => match command {
            Command::Delete { name, .. } => CommandReport {
                level: NoticeLevel::Info,
                message: format!("A trashed copy of '{name}' already exists: delete again to overwrite it."),
                saved: None,
                needs_overwrite: true,
            },
            _ => CommandReport::failure(&ApiError::Conflict { reason }),
        },
        Err(err) => CommandReport::failure(&err),
    }
}

async fn run(api: &dyn RemoteApi, command: &Command) -> Result<CommandReport, ApiError> {
    Ok(match command {
        Command::Start { id, name } => {
            api.start(id).await?;
            CommandReport::success(format!("Starting '{name}'."))
        }
        Command::Stop { id, name } => {
            api.stop(id).await?;
            CommandReport::success(format!("Stopping '{name}'."))
        }
        Command::Delete { id, name, options } => {
            api.delete(id, *options).await?;
            CommandReport::success(match options.mode {
                DeleteMode::Trash => format!("Instance '{name}' moved to trashcan."),
                DeleteMode::Permanent => format!("Instance '{name}' permanently deleted."),
            })
        }
        Command::Update { name, change } => {
            let saved = api.update(&change.id, &change.patch).await?;
            let mut report = CommandReport::success(if change.requires_restart {
                format!("Instance '{name}' is being updated and restarted.")
            } else {
                format!("Instance '{name}' updated.")
            });
            report.saved = Some(saved);
            report
        }
        Command::Create { draft } => {
            let created = api.create(draft).await?;
            let mut report =
                CommandReport::success(format!("Instance '{}' created successfully.", created.name));
            report.saved = Some(created);
            report
        }
        Command::Rebuild { id, name } => {
            api.rebuild(id).await?;
            CommandReport::success(format!(
                "Rebuild process for '{name}' has been successfully initiated."
            ))
        }
        Command::Clone { id, name, new_name } => {
            api.clone_instance(id, new_name).await?;
            CommandReport::success(format!(
                "Instance '{name}' successfully cloned as '{new_name}'."
            ))
        }
        Command::Instantiate { id, name, new_name } => {
            api.instantiate(id, new_name).await?;
            CommandReport::success(format!(
                "Instance '{name}' successfully instantiated as '{new_name}'."
            ))
        }
        Command::SetAutostart { id, name, value } => {
            let patch = InstancePatch {
                autostart: Some(*value),
                ..InstancePatch::default()
            };
            let saved = api.update(id, &patch).await?;
            let mut report = CommandReport::success(format!("Autostart for '{name}' updated."));
            report.saved = Some(saved);
            report
        }
    })
}
