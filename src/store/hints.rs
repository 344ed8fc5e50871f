use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::warn;

use super::schema::{metadata_with_prefix, set_metadata};
use crate::generator::GradientHint;

const HINT_KEY_PREFIX: &str = "gradient_hint:";

/// Keeps the latest gradient hint per system so a later process can direct
/// its generation the same way.
pub fn save_hint(connection: &Connection, hint: &GradientHint) -> Result<()> {
    let value = serde_json::to_string(hint)
        .with_context(|| format!("failed to serialize gradient hint for {}", hint.system))?;
    set_metadata(connection, &format!("{HINT_KEY_PREFIX}{}", hint.system), &value)
}

pub fn load_hints(connection: &Connection) -> Result<Vec<GradientHint>> {
    let mut hints = Vec::<GradientHint>::new();
    for (key, value) in metadata_with_prefix(connection, HINT_KEY_PREFIX)? {
        match serde_json::from_str::<GradientHint>(&value) {
            Ok(hint) => hints.push(hint),
            Err(err) => warn!(key = %key, error = %err, "ignoring unreadable gradient hint"),
        }
    }
    Ok(hints)
}
