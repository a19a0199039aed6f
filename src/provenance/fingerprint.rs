//! BLAKE3 fingerprints of queue contents.

use crate::core::types::Task;

/// Fingerprint of a task list, over its canonical JSON encoding.
///
/// Any change to a task (status, params, result, timestamps) or to the set
/// of tasks changes the fingerprint.
pub fn fingerprint_tasks(tasks: &[Task]) -> String {
    let mut hasher = blake3::Hasher::new();
    for task in tasks {
        // Task serialization cannot fail: all keys are strings
        let encoded = serde_json::to_vec(task).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update(b"\n");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
