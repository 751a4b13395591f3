//! Tracks which rows carry unsaved edits.
//!
//! Every row keeps the last server-confirmed values of its editable fields
//! (the baseline) next to the live values the operator is typing (the draft).
//! A row is dirty when the two diverge, or when it was explicitly marked.

use deck_core::wire::InstancePatch;
use deck_core::{Entity, GpuSet, InstanceStatus, PLACEHOLDER_ID};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Name,
    Blueprint,
    OutputPath,
    Gpus,
    PersistentMode,
    UseCustomHostname,
    Hostname,
    Port,
    Autostart,
    PythonVersion,
    CudaVersion,
    TorchVersion,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Name,
        Field::Blueprint,
        Field::OutputPath,
        Field::Gpus,
        Field::PersistentMode,
        Field::UseCustomHostname,
        Field::Hostname,
        Field::Port,
        Field::Autostart,
        Field::PythonVersion,
        Field::CudaVersion,
        Field::TorchVersion,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Blueprint => "blueprint",
            Field::OutputPath => "output path",
            Field::Gpus => "gpus",
            Field::PersistentMode => "persistent mode",
            Field::UseCustomHostname => "custom hostname",
            Field::Hostname => "hostname",
            Field::Port => "port",
            Field::Autostart => "autostart",
            Field::PythonVersion => "python",
            Field::CudaVersion => "cuda",
            Field::TorchVersion => "torch",
        }
    }

    pub fn is_flag(self) -> bool {
        matches!(
            self,
            Field::PersistentMode | Field::UseCustomHostname | Field::Autostart
        )
    }

    pub fn is_text(self) -> bool {
        matches!(
            self,
            Field::Name
                | Field::Blueprint
                | Field::OutputPath
                | Field::Hostname
                | Field::PythonVersion
                | Field::CudaVersion
                | Field::TorchVersion
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One field-level input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldEdit {
    Text(Field, String),
    Flag(Field, bool),
    ToggleGpu(u32),
    Gpus(GpuSet),
    Port(Option<u16>),
}

impl FieldEdit {
    pub fn field(&self) -> Field {
        match self {
            FieldEdit::Text(field, _) | FieldEdit::Flag(field, _) => *field,
            FieldEdit::ToggleGpu(_) | FieldEdit::Gpus(_) => Field::Gpus,
            FieldEdit::Port(_) => Field::Port,
        }
    }
}

/// Values of every operator-editable attribute of a row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditableFields {
    pub name: String,
    pub blueprint: String,
    pub output_path: String,
    pub gpus: GpuSet,
    pub persistent_mode: bool,
    pub use_custom_hostname: bool,
    pub hostname: String,
    pub port: Option<u16>,
    pub autostart: bool,
    pub python_version: String,
    pub cuda_version: String,
    pub torch_version: String,
}

impl EditableFields {
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            name: entity.name.clone(),
            blueprint: entity.blueprint.clone(),
            output_path: entity.output_path.clone().unwrap_or_default(),
            gpus: entity.gpus.clone(),
            persistent_mode: entity.persistent_mode,
            use_custom_hostname: entity.use_custom_hostname,
            hostname: entity.hostname.clone().unwrap_or_default(),
            port: entity.port,
            autostart: entity.autostart,
            python_version: entity.python_version.clone().unwrap_or_default(),
            cuda_version: entity.cuda_version.clone().unwrap_or_default(),
            torch_version: entity.torch_version.clone().unwrap_or_default(),
        }
    }

    /// Display form of one field, as shown in the pending-changes list.
    pub fn value(&self, field: Field) -> String {
        match field {
            Field::Name => self.name.clone(),
            Field::Blueprint => self.blueprint.clone(),
            Field::OutputPath => self.output_path.clone(),
            Field::Gpus => self.gpus.to_csv(),
            Field::PersistentMode => self.persistent_mode.to_string(),
            Field::UseCustomHostname => self.use_custom_hostname.to_string(),
            Field::Hostname => self.hostname.clone(),
            Field::Port => self.port.map(|port| port.to_string()).unwrap_or_default(),
            Field::Autostart => self.autostart.to_string(),
            Field::PythonVersion => self.python_version.clone(),
            Field::CudaVersion => self.cuda_version.clone(),
            Field::TorchVersion => self.torch_version.clone(),
        }
    }

    fn text_mut(&mut self, field: Field) -> Option<&mut String> {
        match field {
            Field::Name => Some(&mut self.name),
            Field::Blueprint => Some(&mut self.blueprint),
            Field::OutputPath => Some(&mut self.output_path),
            Field::Hostname => Some(&mut self.hostname),
            Field::PythonVersion => Some(&mut self.python_version),
            Field::CudaVersion => Some(&mut self.cuda_version),
            Field::TorchVersion => Some(&mut self.torch_version),
            _ => None,
        }
    }

    fn flag_mut(&mut self, field: Field) -> Option<&mut bool> {
        match field {
            Field::PersistentMode => Some(&mut self.persistent_mode),
            Field::UseCustomHostname => Some(&mut self.use_custom_hostname),
            Field::Autostart => Some(&mut self.autostart),
            _ => None,
        }
    }

    /// Applies an edit; returns false when the edit does not fit the field kind.
    pub fn apply(&mut self, edit: &FieldEdit) -> bool {
        match edit {
            FieldEdit::Text(field, value) => match self.text_mut(*field) {
                Some(slot) => {
                    slot.clone_from(value);
                    true
                }
                None => false,
            },
            FieldEdit::Flag(field, value) => match self.flag_mut(*field) {
                Some(slot) => {
                    *slot = *value;
                    true
                }
                None => false,
            },
            FieldEdit::ToggleGpu(idx) => {
                self.gpus.toggle(*idx);
                true
            }
            FieldEdit::Gpus(gpus) => {
                self.gpus = gpus.clone();
                true
            }
            FieldEdit::Port(port) => {
                self.port = *port;
                true
            }
        }
    }

    pub fn copy_field(&mut self, from: &EditableFields, field: Field) {
        match field {
            Field::Name => self.name.clone_from(&from.name),
            Field::Blueprint => self.blueprint.clone_from(&from.blueprint),
            Field::OutputPath => self.output_path.clone_from(&from.output_path),
            Field::Gpus => self.gpus.clone_from(&from.gpus),
            Field::PersistentMode => self.persistent_mode = from.persistent_mode,
            Field::UseCustomHostname => self.use_custom_hostname = from.use_custom_hostname,
            Field::Hostname => self.hostname.clone_from(&from.hostname),
            Field::Port => self.port = from.port,
            Field::Autostart => self.autostart = from.autostart,
            Field::PythonVersion => self.python_version.clone_from(&from.python_version),
            Field::CudaVersion => self.cuda_version.clone_from(&from.cuda_version),
            Field::TorchVersion => self.torch_version.clone_from(&from.torch_version),
        }
    }

    pub fn changed_fields(&self, other: &EditableFields) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| self.value(*field) != other.value(*field))
            .collect()
    }

    /// Body carrying only the listed fields.
    pub fn to_patch(&self, fields: &[Field]) -> InstancePatch {
        let mut patch = InstancePatch::default();
        for field in fields {
            match field {
                Field::Name => patch.name = Some(self.name.clone()),
                Field::Blueprint => patch.base_blueprint = Some(self.blueprint.clone()),
                Field::OutputPath => patch.output_path = Some(self.output_path.clone()),
                Field::Gpus => patch.gpu_ids = Some(self.gpus.to_csv()),
                Field::PersistentMode => patch.persistent_mode = Some(self.persistent_mode),
                Field::UseCustomHostname => {
                    patch.use_custom_hostname = Some(self.use_custom_hostname)
                }
                Field::Hostname => patch.hostname = Some(self.hostname.clone()),
                Field::Port => patch.port = self.port,
                Field::Autostart => patch.autostart = Some(self.autostart),
                Field::PythonVersion => patch.python_version = Some(self.python_version.clone()),
                Field::CudaVersion => patch.cuda_version = Some(self.cuda_version.clone()),
                Field::TorchVersion => patch.torch_version = Some(self.torch_version.clone()),
            }
        }
        patch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: Field,
    pub old: String,
    pub new: String,
}

/// Pending update of one dirty row, ready to be confirmed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub id: String,
    pub changes: Vec<FieldChange>,
    pub requires_restart: bool,
    pub patch: InstancePatch,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct RowState {
    baseline: EditableFields,
    draft: EditableFields,
    status: InstanceStatus,
    satellite: bool,
}

impl RowState {
    fn new(entity: &Entity) -> Self {
        let baseline = EditableFields::from_entity(entity);
        Self {
            draft: baseline.clone(),
            baseline,
            status: entity.status.clone(),
            satellite: entity.parent_id.is_some(),
        }
    }

    fn diverges(&self) -> bool {
        self.baseline != self.draft
    }
}

/// The local "new instance" row. It has no server counterpart until saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderDraft {
    pub fields: EditableFields,
    output_path_touched: bool,
}

impl PlaceholderDraft {
    pub fn new(gpus: GpuSet) -> Self {
        Self {
            fields: EditableFields {
                gpus,
                ..EditableFields::default()
            },
            output_path_touched: false,
        }
    }

    /// The output path mirrors the name until it is edited directly.
    pub fn apply(&mut self, edit: &FieldEdit) -> bool {
        if !self.fields.apply(edit) {
            return false;
        }
        match edit {
            FieldEdit::Text(Field::OutputPath, _) => self.output_path_touched = true,
            FieldEdit::Text(Field::Name, name) if !self.output_path_touched => {
                self.fields.output_path.clone_from(name);
            }
            _ => {}
        }
        true
    }

    pub fn can_save(&self) -> bool {
        !self.fields.name.trim().is_empty() && !self.fields.blueprint.trim().is_empty()
    }

    /// Create body: every field the operator can fill in on a new row.
    pub fn to_patch(&self) -> InstancePatch {
        let mut patch = self.fields.to_patch(&Field::ALL);
        patch.name = Some(self.fields.name.trim().to_string());
        patch
    }
}

/// Dirty tracking for every rendered row plus the optional placeholder.
#[derive(Debug, Default)]
pub struct DirtyGuard {
    rows: HashMap<String, RowState>,
    forced: BTreeSet<String>,
    placeholder: Option<PlaceholderDraft>,
    placeholder_focused: bool,
}

impl DirtyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.forced.contains(id) || self.rows.get(id).is_some_and(RowState::diverges)
    }

    /// Forces a row dirty regardless of its field values.
    pub fn mark_dirty(&mut self, id: &str) {
        if self.rows.contains_key(id) {
            self.forced.insert(id.to_string());
        }
    }

    /// Discards unsaved edits: the draft snaps back to the baseline.
    pub fn clear_dirty(&mut self, id: &str) {
        self.forced.remove(id);
        if let Some(row) = self.rows.get_mut(id) {
            row.draft = row.baseline.clone();
        }
    }

    pub fn any_dirty(&self) -> bool {
        !self.forced.is_empty() || self.rows.values().any(RowState::diverges)
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.forced.clone();
        ids.extend(
            self.rows
                .iter()
                .filter(|(_, row)| row.diverges())
                .map(|(id, _)| id.clone()),
        );
        ids.into_iter().collect()
    }

    /// Feeds one input event and returns the row's dirty state afterwards.
    /// Edits to the placeholder never make a tracked row dirty.
    pub fn apply_input(&mut self, id: &str, edit: &FieldEdit) -> bool {
        if id == PLACEHOLDER_ID {
            if let Some(placeholder) = self.placeholder.as_mut() {
                placeholder.apply(edit);
            }
            return false;
        }
        let Some(row) = self.rows.get_mut(id) else {
            return false;
        };
        if row.satellite && edit.field() == Field::Blueprint {
            return self.is_dirty(id);
        }
        row.draft.apply(edit);
        self.is_dirty(id)
    }

    pub fn draft(&self, id: &str) -> Option<&EditableFields> {
        self.rows.get(id).map(|row| &row.draft)
    }

    pub fn baseline(&self, id: &str) -> Option<&EditableFields> {
        self.rows.get(id).map(|row| &row.baseline)
    }

    /// Adopts a freshly accepted snapshot. Clean rows take the server values
    /// as both baseline and draft; rows no longer present are forgotten.
    pub fn accept_snapshot(&mut self, entities: &[Entity]) {
        let mut next = HashMap::with_capacity(entities.len());
        for entity in entities {
            let state = match self.rows.remove(&entity.id) {
                Some(mut existing) if self.forced.contains(&entity.id) || existing.diverges() => {
                    existing.baseline = EditableFields::from_entity(entity);
                    existing.status = entity.status.clone();
                    existing.satellite = entity.parent_id.is_some();
                    existing
                }
                _ => RowState::new(entity),
            };
            next.insert(entity.id.clone(), state);
        }
        self.forced.retain(|id| next.contains_key(id));
        self.rows = next;
    }

    /// Status updates that arrive through a partial patch. Baselines stay put.
    pub fn observe_status(&mut self, id: &str, status: &InstanceStatus) {
        if let Some(row) = self.rows.get_mut(id) {
            row.status = status.clone();
        }
    }

    /// A save went through: the server's entity becomes the new baseline.
    /// Fields edited locally and not covered by the save stay in the draft.
    pub fn commit(&mut self, entity: &Entity) {
        self.forced.remove(&entity.id);
        let next = RowState::new(entity);
        let Some(row) = self.rows.get_mut(&entity.id) else {
            self.rows.insert(entity.id.clone(), next);
            return;
        };
        let mut draft = next.baseline.clone();
        for field in row.baseline.changed_fields(&row.draft) {
            draft.copy_field(&row.draft, field);
        }
        row.baseline = next.baseline;
        row.draft = draft;
        row.status = next.status;
        row.satellite = next.satellite;
    }

    pub fn change_set(&self, id: &str) -> Option<ChangeSet> {
        let row = self.rows.get(id)?;
        let mut fields = row.baseline.changed_fields(&row.draft);
        if row.satellite {
            fields.retain(|field| *field != Field::Blueprint);
        }
        let changes = fields
            .iter()
            .map(|field| FieldChange {
                field: *field,
                old: row.baseline.value(*field),
                new: row.draft.value(*field),
            })
            .collect();
        Some(ChangeSet {
            id: id.to_string(),
            changes,
            requires_restart: !row.status.is_stopped(),
            patch: row.draft.to_patch(&fields),
        })
    }

    /// Opens the placeholder row; false when one is already open.
    pub fn open_placeholder(&mut self, gpus: GpuSet) -> bool {
        if self.placeholder.is_some() {
            return false;
        }
        self.placeholder = Some(PlaceholderDraft::new(gpus));
        true
    }

    pub fn placeholder(&self) -> Option<&PlaceholderDraft> {
        self.placeholder.as_ref()
    }

    pub fn cancel_placeholder(&mut self) -> Option<PlaceholderDraft> {
        self.placeholder_focused = false;
        self.placeholder.take()
    }

    pub fn set_placeholder_focus(&mut self, focused: bool) {
        self.placeholder_focused = focused && self.placeholder.is_some();
    }

    /// True while an input of the placeholder row holds focus.
    pub fn placeholder_focused(&self) -> bool {
        self.placeholder_focused
    }
}
