//! Error classification for the tunnel retry policy.
//!
//! `classify` maps a raw error string (from a failed SSH connect, a stream
//! exit, or a verifier probe) to one of six kinds. The supervisor uses the
//! kind, not the original string, to decide whether a failure is retryable.
//!
//! Matching is case-insensitive substring search against fixed phrase
//! groups. Order matters: the remote-closure phrases are checked before the
//! generic "permission denied" phrase, so a bounced SSH connection is never
//! misclassified as an authentication failure.

/// Phrases that indicate the remote endpoint's SSH server terminated the
/// connection. These always classify as `Network` and are always retryable
/// — they carry `remote_closure = true` for callers that need to apply the
/// retry-exhaustion override (spec §4.4).
const NETWORK_PHRASES: &[&str] = &[
    "closed by remote host",
    "connection reset by peer",
    "connection refused",
    "broken pipe",
    "no route to host",
    "network",
];

const AUTH_PHRASES: &[&str] = &[
    "authentication failed",
    "permission denied",
    "incorrect password",
];

const TIMEOUT_PHRASES: &[&str] = &["etimedout", "timeout", "timed out"];

const PORT_CONFLICT_PHRASES: &[&str] = &[
    "bind: address already in use",
    "failed for listen port",
    "port forwarding failed",
];

const PERMISSION_PHRASES: &[&str] = &["permission", "access denied"];

/// Classification of a tunnel-lifecycle error, used solely to decide
/// retryability. Never propagated as an error type in its own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Network,
    PortConflict,
    Permission,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Whether the supervisor's retry policy should act on a failure of
    /// this kind. `Auth`, `PortConflict`, and `Permission` are terminal;
    /// everything else gets retried (spec §4.1).
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Auth | ErrorKind::PortConflict | ErrorKind::Permission)
    }
}

/// Classify a raw error message into an [`ErrorKind`].
///
/// Total and idempotent: every input maps to exactly one kind, and
/// classifying the same string twice always produces the same result.
pub fn classify(msg: &str) -> ErrorKind {
    let lower = msg.to_lowercase();

    if NETWORK_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Network;
    }

    if AUTH_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Auth;
    }

    if TIMEOUT_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Timeout;
    }

    if PORT_CONFLICT_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::PortConflict;
    }

    if PERMISSION_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Permission;
    }

    ErrorKind::Unknown
}

/// Whether an error message matches one of the remote-closure phrases
/// (spec §4.1, §4.3, §4.4). Distinct from `classify` returning `Network`:
/// this is checked directly by callers (stream exit codes, verifier
/// results) that need the `remote_closure` flag rather than the kind.
pub fn is_remote_closure(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    NETWORK_PHRASES
        .iter()
        .take(5) // exclude the generic "network" catch-all from this narrower check
        .any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod network_phrases_classify_network {
        use super::*;

        #[test]
        fn closed_by_remote_host() {
            assert_eq!(classify("Connection closed by remote host"), ErrorKind::Network);
        }

        #[test]
        fn connection_reset_by_peer() {
            assert_eq!(classify("connection reset by peer"), ErrorKind::Network);
        }

        #[test]
        fn connection_refused() {
            assert_eq!(classify("Connection refused"), ErrorKind::Network);
        }

        #[test]
        fn broken_pipe() {
            assert_eq!(classify("write: broken pipe"), ErrorKind::Network);
        }

        #[test]
        fn no_route_to_host() {
            assert_eq!(classify("connect: No route to host"), ErrorKind::Network);
        }

        #[test]
        fn generic_network_word() {
            assert_eq!(classify("a network error occurred"), ErrorKind::Network);
        }
    }

    mod auth_phrases_classify_auth {
        use super::*;

        #[test]
        fn authentication_failed() {
            assert_eq!(classify("Authentication failed"), ErrorKind::Auth);
        }

        #[test]
        fn permission_denied() {
            assert_eq!(classify("Permission denied (publickey,password)"), ErrorKind::Auth);
        }

        #[test]
        fn incorrect_password() {
            assert_eq!(classify("incorrect password for user"), ErrorKind::Auth);
        }
    }

    mod remote_closure_never_misclassified_as_auth {
        use super::*;

        #[test]
        fn closed_by_remote_host_beats_permission_denied() {
            // Some SSH servers report both in one line; remote-closure must win.
            let msg = "Connection closed by remote host: permission denied for the session";
            assert_eq!(classify(msg), ErrorKind::Network);
            assert!(is_remote_closure(msg));
        }
    }

    mod timeout_phrases_classify_timeout {
        use super::*;

        #[test]
        fn etimedout() {
            assert_eq!(classify("connect ETIMEDOUT 10.0.0.1:22"), ErrorKind::Timeout);
        }

        #[test]
        fn timeout_word() {
            assert_eq!(classify("Verification timeout"), ErrorKind::Timeout);
        }

        #[test]
        fn timed_out_phrase() {
            assert_eq!(classify("operation timed out"), ErrorKind::Timeout);
        }
    }

    mod port_conflict_phrases_classify_port_conflict {
        use super::*;

        #[test]
        fn bind_address_in_use() {
            assert_eq!(
                classify("bind: Address already in use"),
                ErrorKind::PortConflict
            );
        }

        #[test]
        fn failed_for_listen_port() {
            assert_eq!(
                classify("Warning: remote port forwarding failed for listen port 8080"),
                ErrorKind::PortConflict
            );
        }

        #[test]
        fn port_forwarding_failed() {
            assert_eq!(classify("port forwarding failed"), ErrorKind::PortConflict);
        }
    }

    mod permission_only_reached_after_auth_miss {
        use super::*;

        #[test]
        fn bare_permission_word() {
            assert_eq!(classify("permission to use this resource is restricted"), ErrorKind::Permission);
        }

        #[test]
        fn access_denied() {
            assert_eq!(classify("access denied"), ErrorKind::Permission);
        }
    }

    mod unknown_is_the_fallback {
        use super::*;

        #[test]
        fn unrecognized_message() {
            assert_eq!(classify("something unexpected happened"), ErrorKind::Unknown);
        }
    }

    mod retryability {
        use super::*;

        #[test]
        fn non_retryable_kinds() {
            assert!(!ErrorKind::Auth.is_retryable());
            assert!(!ErrorKind::PortConflict.is_retryable());
            assert!(!ErrorKind::Permission.is_retryable());
        }

        #[test]
        fn retryable_kinds() {
            assert!(ErrorKind::Network.is_retryable());
            assert!(ErrorKind::Timeout.is_retryable());
            assert!(ErrorKind::Unknown.is_retryable());
        }
    }

    #[test]
    fn classify_is_idempotent() {
        let samples = [
            "Connection refused",
            "Permission denied",
            "ETIMEDOUT",
            "bind: Address already in use",
            "access denied",
            "nonsense",
        ];
        for s in samples {
            assert_eq!(classify(s), classify(s));
        }
    }
}
