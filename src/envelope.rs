use serde_json::Value;
use tracing::debug;

use crate::extract::ExtractionError;
use crate::models::RawBlock;

// Webhook and JSON-RPC wrappers, checked in this order.
const WRAPPER_KEYS: [&str; 5] = ["data", "body", "event", "block", "result"];
// An object needs at least one of these to count as a block.
const BLOCK_IDENTITY_KEYS: [&str; 2] = ["number", "hash"];
const MAX_UNWRAP_DEPTH: usize = 6;

/// The shapes a provider payload can arrive in. Whatever the shape, the only thing
/// that leaves the envelope is one canonical [`RawBlock`].
#[derive(Debug, Clone)]
pub enum RawBlockEnvelope {
    /// A bare `eth_getBlockByNumber` result object.
    Rpc(RawBlock),
    /// A block found inside a webhook/Streams wrapper (`{data: [{block: ..}]}` and friends).
    Wrapped(RawBlock),
    /// Nothing resembling a block object was present.
    Empty,
}

impl RawBlockEnvelope {
    pub fn from_value(value: Value) -> Self {
        match locate_block(value, 0) {
            Some((object, 0)) => match serde_json::from_value(object) {
                Ok(block) => RawBlockEnvelope::Rpc(block),
                Err(err) => {
                    debug!("block object failed to decode: {}", err);
                    RawBlockEnvelope::Empty
                }
            },
            Some((object, _)) => match serde_json::from_value(object) {
                Ok(block) => RawBlockEnvelope::Wrapped(block),
                Err(err) => {
                    debug!("wrapped block object failed to decode: {}", err);
                    RawBlockEnvelope::Empty
                }
            },
            None => RawBlockEnvelope::Empty,
        }
    }

    pub fn into_block(self) -> Result<RawBlock, ExtractionError> {
        match self {
            RawBlockEnvelope::Rpc(block) | RawBlockEnvelope::Wrapped(block) => Ok(block),
            RawBlockEnvelope::Empty => Err(ExtractionError::MissingBlock),
        }
    }
}

impl From<RawBlock> for RawBlockEnvelope {
    fn from(block: RawBlock) -> Self {
        RawBlockEnvelope::Rpc(block)
    }
}

// Returns the block object and how many wrappers were peeled off to reach it.
fn locate_block(value: Value, depth: usize) -> Option<(Value, usize)> {
    if depth > MAX_UNWRAP_DEPTH {
        return None;
    }
    match value {
        Value::Array(items) => {
            let first = items.into_iter().next()?;
            locate_block(first, depth + 1)
        }
        Value::Object(mut map) => {
            let wrapper = WRAPPER_KEYS
                .iter()
                .find(|key| map.get(**key).is_some_and(|v| !v.is_null()));
            match wrapper {
                Some(key) => {
                    let inner = map.remove(*key)?;
                    locate_block(inner, depth + 1)
                }
                // `{ "block": null }` and similar: a wrapper with nothing inside.
                None if !map.is_empty()
                    && map.keys().all(|k| WRAPPER_KEYS.contains(&k.as_str())) =>
                {
                    None
                }
                None if !BLOCK_IDENTITY_KEYS
                    .iter()
                    .any(|key| map.get(*key).is_some_and(|v| !v.is_null())) =>
                {
                    None
                }
                None => Some((Value::Object(map), depth)),
            }
        }
        _ => None,
    }
}
