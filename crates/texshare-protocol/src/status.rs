//! Result codes written back for every command.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single command, as seen on the wire.
///
/// Exactly one status is produced per command. Client-side timeouts and
/// stale-lock recovery never appear here: the former is detected by the
/// client, the latter is logged by the daemon and healed internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    /// Name or id absent
    NotFound,
    /// Definition mismatch on join, or rename collision
    Conflict,
    /// Rename by a process that never joined the image
    PermissionDenied,
    /// Liveness set or registry is full
    CapacityExceeded,
    /// Unknown command kind or corrupt payload
    MalformedRequest,
    /// Request major version differs from the daemon's
    VersionMismatch,
    /// The GPU backend could not allocate the image
    AllocationFailed,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Stable numeric code, used as the client CLI exit status.
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::NotFound => 1,
            Self::Conflict => 2,
            Self::PermissionDenied => 3,
            Self::CapacityExceeded => 4,
            Self::MalformedRequest => 5,
            Self::VersionMismatch => 6,
            Self::AllocationFailed => 7,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::PermissionDenied => "permission denied",
            Self::CapacityExceeded => "capacity exceeded",
            Self::MalformedRequest => "malformed request",
            Self::VersionMismatch => "protocol version mismatch",
            Self::AllocationFailed => "allocation failed",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&Status::NotFound).unwrap(), "\"not_found\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"permission_denied\"").unwrap(),
            Status::PermissionDenied
        );
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let all = [
            Status::Ok,
            Status::NotFound,
            Status::Conflict,
            Status::PermissionDenied,
            Status::CapacityExceeded,
            Status::MalformedRequest,
            Status::VersionMismatch,
            Status::AllocationFailed,
        ];
        let mut codes: Vec<u8> = all.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(Status::Ok.is_ok());
        assert!(!Status::Conflict.is_ok());
    }
}
