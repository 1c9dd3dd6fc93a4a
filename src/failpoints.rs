//! Feature-gated failpoint injection.
//!
//! Compile with `--features failpoints` to enable injection. Without the
//! feature, the `fp!()` macro evaluates to `Ok(())`.
//!
//! Failpoints in the merge path:
//! - [`MERGE_AFTER_PUBLISH`]: after the publish commit, before cleanup.
//! - [`MERGE_BEFORE_PUBLISH`]: after the batch is built, before publish.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fires between the publish and cleanup commits.
pub const MERGE_AFTER_PUBLISH: &str = "FP_MERGE_AFTER_PUBLISH";

/// Fires right before the publish commit.
pub const MERGE_BEFORE_PUBLISH: &str = "FP_MERGE_BEFORE_PUBLISH";

/// Actions a failpoint can take when triggered.
#[derive(Clone, Debug)]
pub enum FailpointAction {
    /// No-op (default).
    Off,
    /// Return an error with the given message.
    Error(String),
    /// Panic with the given message.
    Panic(String),
    /// Sleep for the given duration.
    Sleep(Duration),
}

/// Thread-safe global registry of active failpoints.
static REGISTRY: LazyLock<Mutex<HashMap<&'static str, FailpointAction>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<&'static str, FailpointAction>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set a failpoint action.
pub fn set(name: &'static str, action: FailpointAction) {
    registry().insert(name, action);
}

/// Clear a specific failpoint.
pub fn clear(name: &'static str) {
    registry().remove(name);
}

/// Clear all failpoints.
pub fn clear_all() {
    registry().clear();
}

/// Check if a failpoint is set and execute its action.
///
/// # Errors
/// Returns the configured message for an `Error` action.
///
/// # Panics
/// Panics when the action is `Panic`.
pub fn check(name: &str) -> Result<(), String> {
    let registry = registry();
    match registry.get(name) {
        None | Some(FailpointAction::Off) => Ok(()),
        Some(FailpointAction::Error(msg)) => Err(msg.clone()),
        Some(FailpointAction::Panic(msg)) => panic!("failpoint {name}: {msg}"),
        Some(FailpointAction::Sleep(d)) => {
            let d = *d;
            drop(registry);
            std::thread::sleep(d);
            Ok(())
        }
    }
}

/// Failpoint injection point.
///
/// Evaluates to `Result<(), String>`; the error names the failpoint.
///
/// Usage: `fp!(failpoints::MERGE_AFTER_PUBLISH).map_err(MergeError::Injected)?;`
#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        $crate::failpoints::check($name).map_err(|msg| format!("failpoint {}: {}", $name, msg))
    };
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {{
        let _ = $name;
        Ok::<(), String>(())
    }};
}
