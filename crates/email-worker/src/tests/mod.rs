//! Behavioral tests for the email worker.
//!
//! Test organization:
//!
//! - `harness.rs`          - Mock channel, scripted sender, delivery feed, log capture
//! - `filter.rs`           - Sender identity filtering
//! - `ack.rs`              - Acknowledgment on successful processing
//! - `reject.rs`           - Rejection of malformed payloads
//! - `transport_failure.rs`- Channel closed during processing or settlement
//! - `unclassified.rs`     - Conservative handling of unknown failures
//! - `backpressure.rs`     - One in-flight delivery, ordering, no read-ahead
//! - `shutdown.rs`         - Cancellation and shutdown of the delivery loop
//! - `lifecycle.rs`        - Worker startup logs and channel/connection teardown
