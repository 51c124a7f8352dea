//! Name and label sanitizers
//!
//! Pod names must be DNS labels (lowercase alphanumerics and dashes, at most
//! 63 characters); label values allow a little more but share the length cap.
//! The sanitizers here are lossy by design: they fold the characters task ids
//! and repository references commonly carry into dashes and truncate the rest.

/// Label key identifying pods owned by this system
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Label value identifying pods owned by this system
pub const MANAGED_BY_VALUE: &str = "stagehand";
/// Application label key
pub const APP_LABEL: &str = "app";
/// Application label value for worker pods
pub const WORKER_APP_VALUE: &str = "stagehand-worker";
pub const TASK_ID_LABEL: &str = "task-id";
pub const PIPELINE_ID_LABEL: &str = "pipeline-id";
pub const STAGE_ID_LABEL: &str = "stage-id";
pub const STAGE_TYPE_LABEL: &str = "stage-type";

/// Prefix for every pod name this system creates
pub const POD_NAME_PREFIX: &str = "stagehand";

/// Label selector matching every pod owned by this system
pub fn managed_by_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Sanitizes an identifier for use as a pod-name fragment
///
/// Lowercases, folds `_` and `.` into `-`, and truncates to 50 characters so
/// the composite name stays within the 63-character pod-name limit once the
/// prefix and worker index are attached.
pub fn sanitize_pod_name(raw: &str) -> String {
    let mut sanitized = raw.to_lowercase().replace(['_', '.'], "-");
    truncate_on_boundary(&mut sanitized, 50);
    sanitized
}

/// Sanitizes a value for use as a pod label
///
/// Truncates to 63 characters and folds `/`, `:` and `@` into `-`.
pub fn sanitize_label_value(raw: &str) -> String {
    let mut value = raw.to_string();
    truncate_on_boundary(&mut value, 63);
    value.replace(['/', ':', '@'], "-")
}

/// Truncates a string to at most `max` bytes without splitting a character
pub fn truncate_on_boundary(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}
