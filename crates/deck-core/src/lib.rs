pub mod stats;
pub mod url;
pub mod wire;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Id carried by the local "new instance" row until it is saved.
pub const PLACEHOLDER_ID: &str = "new";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Installing,
    Stopping,
    Stalled,
    Error,
    Unknown(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Started => "started",
            InstanceStatus::Installing => "installing",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stalled => "stalled",
            InstanceStatus::Error => "error",
            InstanceStatus::Unknown(raw) => raw.as_str(),
        }
    }

    /// Statuses expected to change on their own shortly.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Installing | InstanceStatus::Stopping
        )
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, InstanceStatus::Stopped)
    }

    pub fn is_started(&self) -> bool {
        matches!(self, InstanceStatus::Started)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        Ok(match normalized.as_str() {
            "stopped" | "" => InstanceStatus::Stopped,
            "starting" => InstanceStatus::Starting,
            "started" | "running" => InstanceStatus::Started,
            "installing" => InstanceStatus::Installing,
            "stopping" => InstanceStatus::Stopping,
            "stalled" => InstanceStatus::Stalled,
            "error" | "failed" => InstanceStatus::Error,
            _ => InstanceStatus::Unknown(normalized),
        })
    }
}

impl Serialize for InstanceStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InstanceStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw.parse::<InstanceStatus>().unwrap_or_default())
    }
}

/// Set of GPU indices assigned to an instance. Travels as a comma separated
/// string (`"0,2"`), but arrays and bare integers are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GpuSet(BTreeSet<u32>);

impl GpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_csv(input: &str) -> Self {
        Self(
            input
                .split(',')
                .filter_map(|part| part.trim().parse::<u32>().ok())
                .collect(),
        )
    }

    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(|idx| idx.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.0.contains(&idx)
    }

    pub fn insert(&mut self, idx: u32) {
        self.0.insert(idx);
    }

    pub fn toggle(&mut self, idx: u32) {
        if !self.0.remove(&idx) {
            self.0.insert(idx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<u32> for GpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv())
    }
}

impl Serialize for GpuSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_csv())
    }
}

impl<'de> Deserialize<'de> for GpuSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GpuSetVisitor;

        impl<'de> Visitor<'de> for GpuSetVisitor {
            type Value = GpuSet;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a comma separated gpu list, an array of indices or null")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GpuSet::from_csv(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let idx = u32::try_from(value)
                    .map_err(|_| E::custom(format!("gpu index out of range: {value}")))?;
                Ok(GpuSet::from_iter([idx]))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!("gpu index cannot be negative: {value}")));
                }
                self.visit_u64(value as u64)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GpuSet::default())
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GpuSet::default())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut set = GpuSet::default();
                while let Some(value) = seq.next_element::<Value>()? {
                    let idx = match &value {
                        Value::Number(n) => n.as_u64().and_then(|u| u32::try_from(u).ok()),
                        Value::String(s) => s.trim().parse::<u32>().ok(),
                        _ => None,
                    };
                    if let Some(idx) = idx {
                        set.insert(idx);
                    }
                }
                Ok(set)
            }
        }

        deserializer.deserialize_any(GpuSetVisitor)
    }
}

/// One tracked remote instance as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(
        default,
        rename = "parent_instance_id",
        deserialize_with = "deserialize_opt_id"
    )]
    pub parent_id: Option<String>,
    #[serde(default, rename = "base_blueprint", deserialize_with = "nullable_string")]
    pub blueprint: String,
    #[serde(default, rename = "gpu_ids")]
    pub gpus: GpuSet,
    #[serde(default, deserialize_with = "nullable_bool")]
    pub autostart: bool,
    #[serde(default, deserialize_with = "nullable_bool")]
    pub persistent_mode: bool,
    #[serde(default, deserialize_with = "nullable_bool")]
    pub use_custom_hostname: bool,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub persistent_port: Option<u16>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub output_path: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub python_version: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub cuda_version: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub torch_version: Option<String>,
}

/// Which row actions the current lifecycle status allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionAvailability {
    pub start: bool,
    pub stop: bool,
    pub delete: bool,
    pub view: bool,
}

impl Entity {
    /// Local, never-persisted row used while the operator fills in a new instance.
    pub fn placeholder(gpus: GpuSet) -> Self {
        Self {
            id: PLACEHOLDER_ID.to_string(),
            name: String::new(),
            status: InstanceStatus::Stopped,
            parent_id: None,
            blueprint: String::new(),
            gpus,
            autostart: false,
            persistent_mode: false,
            use_custom_hostname: false,
            hostname: None,
            port: None,
            persistent_port: None,
            output_path: None,
            python_version: None,
            cuda_version: None,
            torch_version: None,
        }
    }

    pub fn from_record(index: usize, record: Value) -> Result<Self, EntityError> {
        if !record.is_object() {
            return Err(EntityError::NotAnObject { index });
        }
        let entity: Entity = serde_json::from_value(record).map_err(|err| EntityError::Invalid {
            index,
            reason: err.to_string(),
        })?;
        if entity.id == PLACEHOLDER_ID {
            return Err(EntityError::ReservedId {
                index,
                id: entity.id,
            });
        }
        Ok(entity)
    }

    pub fn is_placeholder(&self) -> bool {
        self.id == PLACEHOLDER_ID
    }

    /// Port shown to the operator: the persistent UI port when persistent mode is on.
    pub fn display_port(&self) -> Option<u16> {
        if self.persistent_mode {
            self.persistent_port
        } else {
            self.port
        }
    }

    pub fn actions(&self) -> ActionAvailability {
        let stopped = self.status.is_stopped();
        ActionAvailability {
            start: stopped,
            stop: !stopped,
            delete: stopped,
            view: self.status.is_started(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("record {index} is not an object")]
    NotAnObject { index: usize },
    #[error("record {index} rejected: {reason}")]
    Invalid { index: usize, reason: String },
    #[error("record {index} reuses id {id}")]
    DuplicateId { index: usize, id: String },
    #[error("record {index} uses reserved id {id}")]
    ReservedId { index: usize, id: String },
}

/// Outcome of normalizing one snapshot: how many records made it through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub accepted: usize,
    pub total: usize,
    pub rejected: Vec<EntityError>,
}

impl NormalizeReport {
    pub fn is_partial(&self) -> bool {
        self.accepted < self.total
    }
}

/// Normalized snapshot: entities in server order plus an id index.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn from_entities(entities: Vec<Entity>) -> Self {
        let index = entities
            .iter()
            .enumerate()
            .map(|(pos, entity)| (entity.id.clone(), pos))
            .collect();
        Self { entities, index }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|pos| &self.entities[*pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities declaring `id` as parent, in server order.
    pub fn children_of(&self, id: &str) -> Vec<&Entity> {
        self.entities
            .iter()
            .filter(|entity| entity.parent_id.as_deref() == Some(id))
            .collect()
    }

    pub fn any_transitional(&self) -> bool {
        self.entities
            .iter()
            .any(|entity| entity.status.is_transitional())
    }
}

/// Turn raw snapshot records into entities. Malformed records are dropped and
/// counted; the first occurrence of an id wins.
pub fn normalize_snapshot(records: Vec<Value>) -> (Snapshot, NormalizeReport) {
    let total = records.len();
    let mut report = NormalizeReport {
        total,
        ..NormalizeReport::default()
    };
    let mut seen = HashSet::new();
    let mut entities = Vec::with_capacity(total);

    for (index, record) in records.into_iter().enumerate() {
        match Entity::from_record(index, record) {
            Ok(entity) => {
                if !seen.insert(entity.id.clone()) {
                    report.rejected.push(EntityError::DuplicateId {
                        index,
                        id: entity.id,
                    });
                    continue;
                }
                entities.push(entity);
            }
            Err(err) => report.rejected.push(err),
        }
    }
    report.accepted = entities.len();

    if report.is_partial() {
        warn!(
            event = "snapshot_records_rejected",
            accepted = report.accepted,
            total = report.total,
            first_error = %report.rejected[0],
        );
    }

    (Snapshot::from_entities(entities), report)
}

/// Deserialize an id that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::String(_) => Err(de::Error::custom("id cannot be empty")),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(de::Error::custom("expected string or number for parent id")),
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_and_parent_ids_normalize_to_strings() {
        let (snapshot, report) = normalize_snapshot(vec![
            json!({"id": 7, "name": "comfy", "status": "started"}),
            json!({"id": "8", "name": "comfy-sat", "status": "stopped", "parent_instance_id": 7}),
        ]);

        assert_eq!(report.accepted, 2);
        assert!(!report.is_partial());
        assert_eq!(snapshot.get("8").and_then(|e| e.parent_id.as_deref()), Some("7"));
        assert_eq!(snapshot.children_of("7").len(), 1);
    }

    #[test]
    fn malformed_records_are_counted_not_fatal() {
        let (snapshot, report) = normalize_snapshot(vec![
            json!({"name": "no-id"}),
            json!("not an object"),
            json!({"id": "a", "name": "alpha"}),
            json!({"id": "a", "name": "alpha-again"}),
            json!({"id": "new", "name": "reserved"}),
        ]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(report.total, 5);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 4);
        assert!(matches!(report.rejected[1], EntityError::NotAnObject { index: 1 }));
        assert!(matches!(report.rejected[2], EntityError::DuplicateId { .. }));
        assert!(matches!(report.rejected[3], EntityError::ReservedId { .. }));
        assert_eq!(snapshot.get("a").map(|e| e.name.as_str()), Some("alpha"));
    }

    #[test]
    fn nullable_fields_fall_back_to_defaults() {
        let entity = Entity::from_record(
            0,
            json!({
                "id": 3,
                "name": null,
                "status": null,
                "base_blueprint": null,
                "gpu_ids": null,
                "autostart": null,
                "hostname": "",
                "output_path": "  "
            }),
        )
        .expect("entity");

        assert_eq!(entity.name, "");
        assert_eq!(entity.status, InstanceStatus::Stopped);
        assert!(entity.gpus.is_empty());
        assert!(entity.hostname.is_none());
        assert!(entity.output_path.is_none());
    }

    #[test]
    fn gpu_set_accepts_csv_arrays_and_integers() {
        let csv: GpuSet = serde_json::from_value(json!("0, 2,x,")).expect("csv");
        assert_eq!(csv.to_csv(), "0,2");
        let array: GpuSet = serde_json::from_value(json!([1, "3"])).expect("array");
        assert_eq!(array.to_csv(), "1,3");
        let single: GpuSet = serde_json::from_value(json!(4)).expect("single");
        assert_eq!(single.to_csv(), "4");
        assert_eq!(serde_json::to_value(&csv).expect("serialize"), json!("0,2"));
    }

    #[test]
    fn status_parsing_keeps_unknown_values() {
        assert_eq!("Installing".parse::<InstanceStatus>(), Ok(InstanceStatus::Installing));
        assert_eq!("running".parse::<InstanceStatus>(), Ok(InstanceStatus::Started));
        let odd: InstanceStatus = "Migrating".parse().unwrap_or_default();
        assert_eq!(odd.as_str(), "migrating");
        assert!(!odd.is_transitional());
        assert!(InstanceStatus::Stopping.is_transitional());
        assert!(!InstanceStatus::Stalled.is_transitional());
    }

    #[test]
    fn action_availability_follows_status() {
        let mut entity = Entity::placeholder(GpuSet::new());
        entity.id = "1".to_string();
        assert_eq!(
            entity.actions(),
            ActionAvailability {
                start: true,
                stop: false,
                delete: true,
                view: false
            }
        );
        entity.status = InstanceStatus::Started;
        let actions = entity.actions();
        assert!(actions.stop && actions.view && !actions.start && !actions.delete);
        entity.status = InstanceStatus::Starting;
        assert!(!entity.actions().view);
    }

    #[test]
    fn display_port_prefers_persistent_port() {
        let mut entity = Entity::placeholder(GpuSet::new());
        entity.port = Some(8188);
        entity.persistent_port = Some(6080);
        assert_eq!(entity.display_port(), Some(8188));
        entity.persistent_mode = true;
        assert_eq!(entity.display_port(), Some(6080));
    }
}
