//! Metrics emitted through the `metrics` facade
//!
//! Nothing is recorded unless the application installs a recorder
//! (e.g. `metrics-exporter-prometheus`). All names are prefixed `ysql_`.

pub mod labels {
    //! Label keys and well-known values

    /// Authentication mechanism label key
    pub const MECHANISM: &str = "mechanism";
    /// SCRAM-SHA-256
    pub const MECHANISM_SCRAM: &str = "scram-sha-256";
    /// md5 password hash
    pub const MECHANISM_MD5: &str = "md5";
    /// Cleartext password
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// Server accepted the startup without a password
    pub const MECHANISM_TRUST: &str = "trust";

    /// Reason label key
    pub const REASON: &str = "reason";
    /// Outcome label key
    pub const OUTCOME: &str = "outcome";

    /// Statement succeeded
    pub const OUTCOME_OK: &str = "ok";
    /// Statement failed
    pub const OUTCOME_ERROR: &str = "error";
    /// Transaction committed
    pub const OUTCOME_COMMITTED: &str = "committed";
    /// Transaction rolled back, explicitly or by abandonment
    pub const OUTCOME_ROLLED_BACK: &str = "rolled_back";
    /// COMMIT failed
    pub const OUTCOME_COMMIT_FAILED: &str = "commit_failed";

    /// Connection exceeded its maximum lifetime
    pub const RETIRE_LIFETIME: &str = "lifetime";
    /// Connection sat idle too long
    pub const RETIRE_IDLE: &str = "idle";
    /// Connection failed a health probe or came back broken
    pub const RETIRE_BROKEN: &str = "broken";
    /// Pool shut down
    pub const RETIRE_SHUTDOWN: &str = "shutdown";
}

pub mod counters {
    //! Monotonic counters

    use super::labels;
    use metrics::counter;

    /// Authentication attempt started
    pub fn auth_attempted(mechanism: &'static str) {
        counter!("ysql_auth_attempted_total", labels::MECHANISM => mechanism).increment(1);
    }

    /// Authentication succeeded
    pub fn auth_successful(mechanism: &'static str) {
        counter!("ysql_auth_successful_total", labels::MECHANISM => mechanism).increment(1);
    }

    /// Authentication failed
    pub fn auth_failed(mechanism: &'static str, reason: &'static str) {
        counter!(
            "ysql_auth_failed_total",
            labels::MECHANISM => mechanism,
            labels::REASON => reason
        )
        .increment(1);
    }

    /// Physical connection opened by the pool
    pub fn connection_created() {
        counter!("ysql_pool_connections_created_total").increment(1);
    }

    /// Physical connection closed by the pool
    pub fn connection_retired(reason: &'static str) {
        counter!("ysql_pool_connections_retired_total", labels::REASON => reason).increment(1);
    }

    /// Acquire gave up before a connection became available
    pub fn acquire_timeout() {
        counter!("ysql_pool_acquire_timeouts_total").increment(1);
    }

    /// Statement finished, `outcome` is "ok" or "error"
    pub fn statement_completed(outcome: &'static str) {
        counter!("ysql_statements_total", labels::OUTCOME => outcome).increment(1);
    }

    /// Transaction reached a terminal state ("committed", "rolled_back", "commit_failed")
    pub fn transaction_finished(outcome: &'static str) {
        counter!("ysql_transactions_total", labels::OUTCOME => outcome).increment(1);
    }

    /// Server reported SQLSTATE 40001
    pub fn serialization_conflict() {
        counter!("ysql_serialization_conflicts_total").increment(1);
    }

    /// Transaction body re-run after a conflict
    pub fn transaction_retry() {
        counter!("ysql_transaction_retries_total").increment(1);
    }
}

pub mod histograms {
    //! Latency distributions, all in milliseconds

    use super::labels;
    use metrics::histogram;

    /// Authentication round trip
    pub fn auth_duration(mechanism: &'static str, duration_ms: u64) {
        histogram!("ysql_auth_duration_ms", labels::MECHANISM => mechanism)
            .record(duration_ms as f64);
    }

    /// Time spent waiting in `Pool::acquire`
    pub fn acquire_wait(duration_ms: u64) {
        histogram!("ysql_pool_acquire_wait_ms").record(duration_ms as f64);
    }

    /// Statement execution up to the first row or completion
    pub fn statement_duration(duration_ms: u64) {
        histogram!("ysql_statement_duration_ms").record(duration_ms as f64);
    }
}
