//! Reassembly of `$batch` responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::endpoint::DEFAULT_ID_PREFIX;
use crate::error::GraphError;

/// Demultiplexed batch responses.
///
/// Positional when every sub-request used a generated id (or ids that are
/// their own index), named otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchResult {
    Ordered(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl BatchResult {
    pub fn len(&self) -> usize {
        match self {
            Self::Ordered(values) => values.len(),
            Self::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key each response object by its `id`, removing the id from the object.
pub fn demultiplex(responses: Vec<Value>) -> Result<BTreeMap<String, Value>, GraphError> {
    let mut keyed = BTreeMap::new();

    for response in responses {
        let Value::Object(mut fields) = response else {
            return Err(GraphError::ParseFailed(
                "batch response entry is not an object".into(),
            ));
        };

        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(GraphError::ParseFailed(
                    "batch response entry has no id".into(),
                ))
            }
        };

        keyed.insert(id, Value::Object(fields));
    }

    Ok(keyed)
}

/// Flatten keyed responses into a sequence when the sorted keys are
/// exactly their positions (after stripping the generated-id prefix).
pub fn normalize(keyed: BTreeMap<String, Value>) -> BatchResult {
    let positional = keyed
        .keys()
        .enumerate()
        .filter(|(index, key)| {
            let key = key.strip_prefix(DEFAULT_ID_PREFIX).unwrap_or(key);
            key.parse::<usize>().ok() == Some(*index)
        })
        .count();

    if positional == keyed.len() {
        BatchResult::Ordered(keyed.into_values().collect())
    } else {
        BatchResult::Named(keyed)
    }
}
