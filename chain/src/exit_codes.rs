//! Stable exit codes for chain CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Unreadable input, bad config or tool declarations, or other errors.
pub const INVALID: i32 = 1;
/// `chain validate` found schema violations in the document.
pub const VALIDATION_FAILED: i32 = 2;
