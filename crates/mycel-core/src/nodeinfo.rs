//! Local node-info object.
//!
//! Node info is an arbitrary JSON object returned to any node that asks for
//! it. Unless privacy is requested, four build fields are filled in first:
//! `buildname`, `buildversion`, `buildplatform` and `buildarch`. Operator
//! fields override them, and a field set to `null` (or the string `"null"`)
//! removes it.

use crate::node::error::MAX_NODE_INFO_SIZE;
use crate::node::{NodeError, Result};
use serde_json::{Map, Value};

/// Serialize the node-info object to send to remote nodes.
///
/// # Errors
/// Returns `NodeError::NodeInfoTooLarge` if the serialized object exceeds
/// 16384 bytes.
pub fn build_node_info(given: &Map<String, Value>, privacy: bool) -> Result<Vec<u8>> {
    let mut info = if privacy { Map::new() } else { default_fields() };
    for (field, value) in given {
        if is_null(value) {
            info.remove(field);
        } else {
            info.insert(field.clone(), value.clone());
        }
    }

    let json = serde_json::to_vec(&Value::Object(info))?;
    if json.len() > MAX_NODE_INFO_SIZE {
        return Err(NodeError::NodeInfoTooLarge);
    }
    Ok(json)
}

fn default_fields() -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("buildname".into(), env!("CARGO_PKG_NAME").into());
    info.insert("buildversion".into(), env!("CARGO_PKG_VERSION").into());
    info.insert("buildplatform".into(), std::env::consts::OS.into());
    info.insert("buildarch".into(), std::env::consts::ARCH.into());
    info
}

fn is_null(value: &Value) -> bool {
    value.is_null() || value.as_str() == Some("null")
}
