//! The `persistence` module keeps persistent topics on disk.
//!
//! Topics with the `persistent` property are written to a JSON file whenever
//! they change (checked every save interval) and loaded back at startup.
//! The file format lives in `json_store`.

pub mod json_store;

use std::path::{Path, PathBuf};

use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::broker::engine::{SharedServer, lock};

/// Load `path` into the server. A missing file is not an error; per-entry
/// problems are returned as a newline-separated string.
pub fn load_into(server: &SharedServer, path: &Path) -> std::io::Result<String> {
    let input = match json_store::load_file(path) {
        Ok(input) => input,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no persistent file at {}", path.display());
            return Ok(String::new());
        }
        Err(e) => return Err(e),
    };
    Ok(lock(server).load_persistent(&input))
}

/// Write the persistent topics if anything changed since the last save.
/// Returns whether a save happened. A failed save leaves the changes
/// pending so the next call tries again.
pub fn save_if_changed(server: &SharedServer, path: &Path) -> std::io::Result<bool> {
    let dump = {
        let mut server = lock(server);
        if !server.persistent_changed() {
            return Ok(false);
        }
        server.dump_persistent()
    };
    if let Err(e) = json_store::save_file(path, &dump) {
        lock(server).mark_persistent_changed();
        return Err(e);
    }
    Ok(true)
}

/// Validate persistent JSON without loading it anywhere. Returns how many
/// entries are usable and the error lines for the rest.
pub fn check(input: &str) -> (usize, String) {
    let items = match json_store::parse_array(input) {
        Ok(items) => items,
        Err(e) => return (0, format!("{e}\n")),
    };
    let mut usable = 0;
    let mut errors = String::new();
    for (i, item) in items.iter().enumerate() {
        match json_store::parse_entry(item, 0) {
            Ok(_) => usable += 1,
            Err(e) => errors.push_str(&format!("{i}: {e}\n")),
        }
    }
    (usable, errors)
}

/// Background task saving persistent topics every `interval_ms`.
pub async fn start_persistent_saver(server: SharedServer, path: PathBuf, interval_ms: u64) {
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match save_if_changed(&server, &path) {
            Ok(true) => debug!("saved persistent topics to {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("could not save persistent file {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests;
