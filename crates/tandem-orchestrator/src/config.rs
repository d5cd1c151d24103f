//! Central bundle of tunable limits: prompt-context sizing, inbox and
//! history caps, and timing constants. Kept in one place so tests can
//! assert against the same bounds the engine enforces.

use std::time::Duration;

/// Total character budget for the artifact context slice injected into a task prompt.
pub const ARTIFACT_SLICE_BUDGET_BYTES: usize = 50 * 1024;

/// Maximum number of most-recent inbox messages injected into a task prompt.
pub const INBOX_INJECT_LIMIT: usize = 20;

/// Bounded capacity of a pod's inbox before back-pressure drops low-priority messages.
pub const POD_INBOX_CAP: usize = 200;

/// Number of most-recent errors injected into a task prompt as warnings.
pub const RECENT_ERROR_WARNING_COUNT: usize = 3;

/// Bounded history length of the update stream, per work order.
pub const UPDATE_STREAM_HISTORY_CAP: usize = 200;

/// Maximum tool-use iterations within a single pod task execution.
pub const TOOL_LOOP_MAX_ITERATIONS: usize = 10;

/// Default period of the time-tracking ticker.
pub const TICKER_PERIOD: Duration = Duration::from_secs(10);

/// Default checkpoint decision timeout before auto-continue.
pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default clarification timeout before falling back to auto-answer.
pub const CLARIFICATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Maximum pause window before the engine resumes itself.
pub const MAX_PAUSE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Upper bound on wake latency after an external mutation (checkpoint
/// decision, pause reply, cancellation) is recorded. Watch-channel waiters
/// wake immediately in practice; this is the documented worst case.
pub const EXTERNAL_WAIT_WAKE_LATENCY: Duration = Duration::from_secs(2);

/// Bounded length of a pod's rolling message log.
pub const POD_MESSAGE_LOG_CAP: usize = 500;

/// Default delay before workspace cleanup after successful completion.
pub const WORKSPACE_CLEANUP_DELAY_SUCCESS: Duration = Duration::from_secs(30 * 60);

/// Delay before workspace cleanup after failure.
pub const WORKSPACE_CLEANUP_DELAY_FAILURE: Duration = Duration::from_secs(5 * 60);

/// Consecutive-failure thresholds that downgrade a pod's health status.
pub const POD_HEALTH_WARNING_CONSECUTIVE_FAILURES: u32 = 3;
pub const POD_HEALTH_CRITICAL_CONSECUTIVE_FAILURES: u32 = 5;

/// Inline code preview truncation length for file delivery.
pub const FILE_PREVIEW_TRUNCATE_BYTES: usize = 3 * 1024;

/// Storage quota that forces the persistor to retain only recently updated work orders.
pub const PERSISTED_STATE_QUOTA_BYTES: usize = 2 * 1024 * 1024;
pub const PERSISTED_STATE_RETAIN_COUNT: usize = 5;

/// Quality score threshold at or above which the receipt's build status is `success`.
pub const RECEIPT_SUCCESS_QUALITY_THRESHOLD: f64 = 70.0;
