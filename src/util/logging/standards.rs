//! Centralised logging metadata (event names, shared keys, etc.).

/// Canonical event names used across the service.
pub mod events {
    /// HTTP request lifecycle.
    pub const REQUEST_RECEIVED: &str = "request.received";
    pub const REQUEST_REJECTED: &str = "request.rejected";
    pub const REQUEST_COMPLETE: &str = "request.complete";
    pub const REQUEST_ERROR: &str = "request.error";

    /// Single-sheet recognition.
    pub const SUBMISSION_ADMITTED: &str = "submission.admitted";
    pub const SUBMISSION_REJECTED: &str = "submission.rejected";
    pub const STAGING_CREATED: &str = "staging.created";
    pub const STAGING_RELEASED: &str = "staging.released";
    pub const RECOGNITION_START: &str = "recognition.start";
    pub const RECOGNITION_COMPLETE: &str = "recognition.complete";
    pub const RECOGNITION_ERROR: &str = "recognition.error";
    pub const RECOGNITION_TIMEOUT: &str = "recognition.timeout";
    pub const RECOGNIZER_UNAVAILABLE: &str = "recognizer.unavailable";

    /// Batch orchestration.
    pub const BATCH_START: &str = "batch.start";
    pub const BATCH_ITEM_ERROR: &str = "batch.item_error";
    pub const BATCH_ITEM_PANIC: &str = "batch.item_panic";
    pub const BATCH_COMPLETE: &str = "batch.complete";

    /// Answer validation.
    pub const SCORE_COMPLETE: &str = "score.complete";

    /// Startup.
    pub const MODEL_MISSING: &str = "model.missing";
    pub const MODEL_LOADED: &str = "model.loaded";
    pub const MODEL_LOAD_FAILED: &str = "model.load_failed";
    pub const MODEL_DOWNLOAD_START: &str = "model.download.start";
    pub const MODEL_DOWNLOAD_PROGRESS: &str = "model.download.progress";
    pub const MODEL_DOWNLOAD_COMPLETE: &str = "model.download.complete";
    pub const MODEL_DOWNLOAD_FAILED: &str = "model.download.failed";
}
