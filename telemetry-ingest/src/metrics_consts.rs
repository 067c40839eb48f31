pub const RECORDS_PER_POLL: &str = "telemetry_ingest_records_per_poll";
pub const RECORDS_SKIPPED: &str = "telemetry_ingest_records_skipped";
pub const DEDUP_DROPPED: &str = "telemetry_ingest_dedup_dropped_records";
pub const BATCHES_DISPATCHED: &str = "telemetry_ingest_batches_dispatched";
pub const BATCHES_FAILED: &str = "telemetry_ingest_batches_failed";
pub const ACTIVE_WORKERS: &str = "telemetry_ingest_active_patch_workers";
pub const PATCH_DURATION_MS: &str = "telemetry_ingest_patch_duration_ms";
pub const PATCH_RETRIES: &str = "telemetry_ingest_patch_retries";
pub const PATCH_NON_RETRIABLE: &str = "telemetry_ingest_patch_non_retriable_errors";
pub const DEVICE_NOT_UPDATED: &str = "telemetry_ingest_device_not_updated";
pub const DEVICE_MULTIPLE_UPDATED: &str = "telemetry_ingest_device_multiple_updated";
pub const DEAD_LETTER_RECORDS: &str = "telemetry_ingest_dead_letter_records";
pub const DEAD_LETTER_SEND_FAILURES: &str = "telemetry_ingest_dead_letter_send_failures";
pub const OFFSET_COMMITS: &str = "telemetry_ingest_offset_commits";
pub const OFFSET_COMMIT_FAILURES: &str = "telemetry_ingest_offset_commit_failures";
pub const CONSUMER_ERRORS: &str = "telemetry_ingest_consumer_errors";
pub const CONSUMER_SESSIONS: &str = "telemetry_ingest_consumer_sessions";
pub const RULES_PUBLISHED: &str = "telemetry_ingest_rules_published";
pub const RULE_PUBLISH_FAILURES: &str = "telemetry_ingest_rule_publish_failures";
pub const RULE_BATCHES_PUBLISHED: &str = "telemetry_ingest_rule_batches_published";
pub const RULE_BATCHES_FAILED: &str = "telemetry_ingest_rule_batches_failed";
