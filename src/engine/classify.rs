//! Failure classification for engine commands
//!
//! Structured signals win: daemon connectivity errors, gRPC status codes
//! relayed by the daemon, exit statuses and spawn errors. Only output that
//! carries none of those is matched against the transient patterns.

use super::{EngineError, FailureClass};
use regex::Regex;
use std::io;
use std::sync::OnceLock;

/// Substrings marking a failure as worth retrying
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "connection failure",
    "connection refused",
    "connection reset",
    "i/o timeout",
    "context deadline exceeded",
    "tls handshake timeout",
    "temporary failure",
    "try again",
    "removing network",
    "has active endpoints",
    "failed to remove network",
];

const DAEMON_UNREACHABLE: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
];

/// gRPC codes that indicate a retryable condition on the daemon side
const TRANSIENT_RPC_CODES: &[&str] = &[
    "Unavailable",
    "DeadlineExceeded",
    "ResourceExhausted",
    "Aborted",
];

/// Classifies failed engine invocations
#[derive(Debug, Clone)]
pub struct Classifier {
    patterns: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Classifier {
    /// Default patterns plus `extra`, matched case-insensitively
    pub fn new(extra: &[String]) -> Self {
        let patterns = DEFAULT_TRANSIENT_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().map(|p| p.to_lowercase()))
            .collect();
        Self { patterns }
    }

    /// Classify a command that ran and exited unsuccessfully
    pub fn classify_exit(&self, code: Option<i32>, stderr: &str) -> EngineError {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        if DAEMON_UNREACHABLE.iter().any(|p| lower.contains(p)) {
            return EngineError::unavailable(message);
        }
        if let Some(code) = rpc_code(&message) {
            return if TRANSIENT_RPC_CODES.contains(&code.as_str()) {
                EngineError::transient(message)
            } else {
                EngineError::fatal(message)
            };
        }
        if lower.contains("permission denied") {
            return EngineError::fatal(message);
        }
        match code {
            Some(126) => return EngineError::fatal(message),
            Some(127) => return EngineError::not_installed(message),
            _ => {}
        }
        if self.patterns.iter().any(|p| lower.contains(p.as_str())) {
            return EngineError::transient(message);
        }
        EngineError::fatal(message)
    }

    /// Classify a failure to start the engine binary at all
    pub fn classify_spawn(&self, program: &str, err: &io::Error) -> EngineError {
        match err.kind() {
            io::ErrorKind::NotFound => {
                EngineError::not_installed(format!("{} is not installed", program))
            }
            io::ErrorKind::PermissionDenied => {
                EngineError::fatal(format!("{} cannot be executed: {}", program, err))
            }
            _ => EngineError::new(
                FailureClass::Transient,
                format!("failed to run {}: {}", program, err),
            ),
        }
    }

    /// Classify a command that did not finish in time
    pub fn classify_timeout(&self, command: &str, secs: u64) -> EngineError {
        EngineError::transient(format!("{} timed out after {}s", command, secs))
    }
}

/// gRPC status code in a daemon error (`rpc error: code = Unavailable desc = ...`)
fn rpc_code(message: &str) -> Option<String> {
    static RPC: OnceLock<Regex> = OnceLock::new();
    let re = RPC.get_or_init(|| {
        Regex::new(r"rpc error: code = (\w+)").expect("rpc pattern is valid")
    });
    re.captures(message).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_unreachable() {
        let c = Classifier::default();
        let err = c.classify_exit(
            Some(1),
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert_eq!(err.class, FailureClass::Unavailable);
    }

    #[test]
    fn test_rpc_codes_win_over_patterns() {
        let c = Classifier::default();
        let transient = c.classify_exit(
            Some(1),
            "Error response from daemon: rpc error: code = Unavailable desc = connection error",
        );
        assert_eq!(transient.class, FailureClass::Transient);

        // "try again" would match a pattern, but the status code says otherwise
        let fatal = c.classify_exit(
            Some(1),
            "Error response from daemon: rpc error: code = InvalidArgument desc = bad spec, try again",
        );
        assert_eq!(fatal.class, FailureClass::Fatal);
    }

    #[test]
    fn test_exit_status() {
        let c = Classifier::default();
        assert_eq!(c.classify_exit(Some(126), "").class, FailureClass::Fatal);
        assert_eq!(
            c.classify_exit(Some(127), "docker: not found").class,
            FailureClass::NotInstalled
        );
    }

    #[test]
    fn test_transient_patterns() {
        let c = Classifier::default();
        assert_eq!(
            c.classify_exit(Some(1), "connection failure running service update").class,
            FailureClass::Transient
        );
        assert_eq!(
            c.classify_exit(Some(1), "Removing network web_default").class,
            FailureClass::Transient
        );
        assert_eq!(
            c.classify_exit(Some(1), "No such image: nope").class,
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_extra_patterns() {
        let c = Classifier::new(&["Too Many Requests".to_string()]);
        assert_eq!(
            c.classify_exit(Some(1), "toomanyrequests: too many requests").class,
            FailureClass::Transient
        );
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let c = Classifier::default();
        let err = c.classify_exit(
            Some(1),
            "permission denied while trying to connect, try again later",
        );
        assert_eq!(err.class, FailureClass::Fatal);
    }

    #[test]
    fn test_spawn_not_found() {
        let c = Classifier::default();
        let err = c.classify_spawn("docker", &io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.class, FailureClass::NotInstalled);
    }
}
