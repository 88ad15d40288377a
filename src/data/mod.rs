//! Data shapes flowing between node ports.
//!
//! Ports carry either a single [`DataRecord`] or a non-empty sequence of
//! records; a node's output is a map from output-port name to its payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque mapping from string keys to serializable values
pub type DataRecord = serde_json::Map<String, serde_json::Value>;

/// Mapping from output-port name to the data it produced
pub type NodeOutput = HashMap<String, PortData>;

/// Mapping from input-port name to the data collected for it
pub type NodeInput = HashMap<String, PortData>;

/// Mapping from node name to its last completed output
pub type ExecutionState = HashMap<String, NodeOutput>;

/// Payload travelling over one port: one record, or a sequence of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortData {
    /// A single record
    Single(DataRecord),
    /// Two or more records
    Sequence(Vec<DataRecord>),
}

impl PortData {
    /// Build port data from collected records.
    ///
    /// Returns `None` for an empty collection; exactly one record is passed
    /// through as [`PortData::Single`], more become a [`PortData::Sequence`].
    pub fn from_records(mut records: Vec<DataRecord>) -> Option<Self> {
        match records.len() {
            0 => None,
            1 => Some(PortData::Single(records.remove(0))),
            _ => Some(PortData::Sequence(records)),
        }
    }

    /// View the payload as a slice-like list of records
    pub fn records(&self) -> Vec<&DataRecord> {
        match self {
            PortData::Single(record) => vec![record],
            PortData::Sequence(records) => records.iter().collect(),
        }
    }

    /// Consume the payload into its records
    pub fn into_records(self) -> Vec<DataRecord> {
        match self {
            PortData::Single(record) => vec![record],
            PortData::Sequence(records) => records,
        }
    }

    /// Number of records carried
    pub fn len(&self) -> usize {
        match self {
            PortData::Single(_) => 1,
            PortData::Sequence(records) => records.len(),
        }
    }

    /// Whether the payload carries no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<DataRecord> for PortData {
    fn from(record: DataRecord) -> Self {
        PortData::Single(record)
    }
}

/// Convert a JSON value into a record, wrapping non-objects under `"value"`
pub fn into_record(value: serde_json::Value) -> DataRecord {
    match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = DataRecord::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: serde_json::Value) -> DataRecord {
        into_record(value)
    }

    #[test]
    fn test_from_records_flattening() {
        assert_eq!(PortData::from_records(vec![]), None);
        assert_eq!(
            PortData::from_records(vec![rec(json!({"a": 1}))]),
            Some(PortData::Single(rec(json!({"a": 1}))))
        );
        assert_eq!(
            PortData::from_records(vec![rec(json!({"a": 1})), rec(json!({"b": 2}))]),
            Some(PortData::Sequence(vec![
                rec(json!({"a": 1})),
                rec(json!({"b": 2}))
            ]))
        );
    }

    #[test]
    fn test_serde_shape_is_untagged() {
        let single = PortData::Single(rec(json!({"x": 1})));
        assert_eq!(serde_json::to_value(&single).unwrap(), json!({"x": 1}));

        let seq = PortData::Sequence(vec![rec(json!({"x": 1})), rec(json!({"y": 2}))]);
        assert_eq!(
            serde_json::to_value(&seq).unwrap(),
            json!([{"x": 1}, {"y": 2}])
        );
    }

    #[test]
    fn test_into_record_wraps_scalars() {
        assert_eq!(rec(json!(5)), rec(json!({"value": 5})));
        assert_eq!(rec(json!({"k": "v"}))["k"], json!("v"));
    }
}
