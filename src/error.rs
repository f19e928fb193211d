//! Error taxonomy for the fleet engine.
//!
//! Built with `error_chain!`: a generated `Error`, `ErrorKind`, `Result`
//! alias and `ResultExt` trait for `.chain_err(..)`.

error_chain! {
    errors {
        /// `RunConfig` failed its own validation. Returned before any I/O;
        /// no report is written.
        ConfigInvalid(msg: String) {
            description("run configuration is invalid")
            display("run configuration is invalid: {}", msg)
        }
        /// Provider rejected credentials. Fatal for the whole run.
        AuthFailed(msg: String) {
            description("authentication with the provider failed")
            display("authentication with the provider failed: {}", msg)
        }
        /// Instance or operation handle not found.
        NotFound(msg: String) {
            description("instance or operation not found")
            display("not found: {}", msg)
        }
        /// Provider refused a mutation because of current instance state.
        PreconditionViolated(msg: String) {
            description("precondition violated")
            display("precondition violated: {}", msg)
        }
        /// Provider signalled throttling.
        RateLimited(msg: String) {
            description("rate limited by provider")
            display("rate limited by provider: {}", msg)
        }
        /// Network / 5xx-class transport failure, presumed transient.
        Transient(msg: String) {
            description("transient transport error")
            display("transient transport error: {}", msg)
        }
        /// Wall-clock budget exhausted while waiting on the provider.
        Timeout(msg: String) {
            description("operation timed out")
            display("operation timed out: {}", msg)
        }
        /// Cooperative cancellation was observed.
        Cancelled {
            description("run was cancelled")
            display("run was cancelled")
        }
        /// Anything else, including schema surprises from the provider.
        Unexpected(msg: String) {
            description("unexpected error")
            display("unexpected error: {}", msg)
        }
    }
}

impl ErrorKind {
    /// Sanitised one-line message safe to embed in a report; strips any
    /// accidental multi-line stack-trace-shaped text.
    pub fn report_message(&self) -> String {
        let raw = self.to_string();
        raw.lines().next().unwrap_or("").to_string()
    }
}
