/// Status code type alias; codes are small unsigned integers grouped by
/// subsystem family.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const CONFIG_INVALID_VALUE: status_code_t = 16;
    pub const CONFIG_UPDATE_FAILED: status_code_t = 17;
    pub const CONFIG_VALIDATE_FAILED: status_code_t = 18;
    pub const CONFIG_KEY_NOT_FOUND: status_code_t = 20;
    pub const AUTHENTICATION_FAIL: status_code_t = 25;
    pub const INTERRUPTED: status_code_t = 27;
    pub const READ_ONLY_MODE: status_code_t = 34;
    pub const CONFIG_PARSE_ERROR: status_code_t = 71;
    pub const OS_ERROR: status_code_t = 72;
    pub const TIMEOUT: status_code_t = 80;
    pub const SHUTTING_DOWN: status_code_t = 81;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Metadata daemon status codes (3xxx).
pub mod MdsCode {
    use super::status_code_t;

    pub const NOT_FOUND: status_code_t = 3000;
    pub const NOT_ACTIVE: status_code_t = 3001;
    pub const NO_PERMISSION: status_code_t = 3002;
    pub const BAD_RANK_TARGET: status_code_t = 3003;
    pub const BAD_FRAG: status_code_t = 3004;
    pub const PATH_NOT_IN_CACHE: status_code_t = 3005;
    pub const DIR_NOT_AUTH: status_code_t = 3006;
    pub const SESSION_NOT_FOUND: status_code_t = 3007;
    pub const STALE_EPOCH: status_code_t = 3008;
    pub const INCOMPATIBLE_FEATURES: status_code_t = 3009;
    pub const INVALID_STATE_TRANSITION: status_code_t = 3010;
    pub const UNRECOGNIZED_COMMAND: status_code_t = 3011;
}

/// Journal status codes (4xxx).
pub mod JournalCode {
    use super::status_code_t;

    pub const FLUSH_FAILED: status_code_t = 4000;
    pub const TRIM_FAILED: status_code_t = 4001;
    pub const WRITE_HEAD_FAILED: status_code_t = 4002;
    pub const BACKEND_ERROR: status_code_t = 4003;
}

/// Coarse family classification of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodeType {
    Common,
    Mds,
    Journal,
    Invalid,
}

/// Classify a code into its family by numeric range.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        3000..=3999 => StatusCodeType::Mds,
        4000..=4999 => StatusCodeType::Journal,
        _ => StatusCodeType::Invalid,
    }
}

/// Human-readable name for a status code, e.g. `"Mds::NotActive"`.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        c if c == StatusCode::OK => "OK",
        c if c == StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        c if c == StatusCode::INVALID_ARG => "InvalidArg",
        c if c == StatusCode::INVALID_CONFIG => "InvalidConfig",
        c if c == StatusCode::CONFIG_INVALID_VALUE => "ConfigInvalidValue",
        c if c == StatusCode::CONFIG_UPDATE_FAILED => "ConfigUpdateFailed",
        c if c == StatusCode::CONFIG_VALIDATE_FAILED => "ConfigValidateFailed",
        c if c == StatusCode::CONFIG_KEY_NOT_FOUND => "ConfigKeyNotFound",
        c if c == StatusCode::AUTHENTICATION_FAIL => "AuthenticationFail",
        c if c == StatusCode::INTERRUPTED => "Interrupted",
        c if c == StatusCode::READ_ONLY_MODE => "ReadOnlyMode",
        c if c == StatusCode::CONFIG_PARSE_ERROR => "ConfigParseError",
        c if c == StatusCode::OS_ERROR => "OsError",
        c if c == StatusCode::TIMEOUT => "Timeout",
        c if c == StatusCode::SHUTTING_DOWN => "ShuttingDown",
        c if c == StatusCode::FOUND_BUG => "FoundBug",
        c if c == StatusCode::UNKNOWN => "Unknown",

        c if c == MdsCode::NOT_FOUND => "Mds::NotFound",
        c if c == MdsCode::NOT_ACTIVE => "Mds::NotActive",
        c if c == MdsCode::NO_PERMISSION => "Mds::NoPermission",
        c if c == MdsCode::BAD_RANK_TARGET => "Mds::BadRankTarget",
        c if c == MdsCode::BAD_FRAG => "Mds::BadFrag",
        c if c == MdsCode::PATH_NOT_IN_CACHE => "Mds::PathNotInCache",
        c if c == MdsCode::DIR_NOT_AUTH => "Mds::DirNotAuth",
        c if c == MdsCode::SESSION_NOT_FOUND => "Mds::SessionNotFound",
        c if c == MdsCode::STALE_EPOCH => "Mds::StaleEpoch",
        c if c == MdsCode::INCOMPATIBLE_FEATURES => "Mds::IncompatibleFeatures",
        c if c == MdsCode::INVALID_STATE_TRANSITION => "Mds::InvalidStateTransition",
        c if c == MdsCode::UNRECOGNIZED_COMMAND => "Mds::UnrecognizedCommand",

        c if c == JournalCode::FLUSH_FAILED => "Journal::FlushFailed",
        c if c == JournalCode::TRIM_FAILED => "Journal::TrimFailed",
        c if c == JournalCode::WRITE_HEAD_FAILED => "Journal::WriteHeadFailed",
        c if c == JournalCode::BACKEND_ERROR => "Journal::BackendError",

        _ => "UnknownStatusCode",
    }
}

/// Map a status code onto the closest POSIX errno, for command replies
/// that report an errno-style `return_code`.
pub fn to_errno(code: status_code_t) -> i32 {
    match code {
        c if c == StatusCode::INVALID_ARG => libc::EINVAL,
        c if c == StatusCode::NOT_IMPLEMENTED => libc::ENOSYS,
        c if c == StatusCode::READ_ONLY_MODE => libc::EROFS,
        c if c == StatusCode::TIMEOUT => libc::ETIMEDOUT,
        c if c == StatusCode::AUTHENTICATION_FAIL => libc::EACCES,
        c if c == StatusCode::INTERRUPTED => libc::EINTR,

        c if c == MdsCode::NOT_FOUND => libc::ENOENT,
        c if c == MdsCode::NO_PERMISSION => libc::EPERM,
        c if c == MdsCode::BAD_RANK_TARGET => libc::ENOENT,
        c if c == MdsCode::BAD_FRAG => libc::EINVAL,
        c if c == MdsCode::PATH_NOT_IN_CACHE => libc::ENOENT,
        c if c == MdsCode::DIR_NOT_AUTH => libc::EINVAL,
        c if c == MdsCode::SESSION_NOT_FOUND => libc::ENOENT,
        c if c == MdsCode::UNRECOGNIZED_COMMAND => libc::EINVAL,

        c if c == JournalCode::FLUSH_FAILED => libc::EIO,
        c if c == JournalCode::TRIM_FAILED => libc::EIO,
        c if c == JournalCode::WRITE_HEAD_FAILED => libc::EIO,

        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::OK, 0);
        assert_eq!(StatusCode::UNKNOWN, 999);
        assert_eq!(MdsCode::NOT_FOUND, 3000);
        assert_eq!(JournalCode::FLUSH_FAILED, 4000);
    }

    #[test]
    fn test_type_of() {
        assert_eq!(type_of(StatusCode::OK), StatusCodeType::Common);
        assert_eq!(type_of(MdsCode::NOT_ACTIVE), StatusCodeType::Mds);
        assert_eq!(type_of(JournalCode::WRITE_HEAD_FAILED), StatusCodeType::Journal);
        assert_eq!(type_of(9000), StatusCodeType::Invalid);
        assert_eq!(type_of(65535), StatusCodeType::Invalid);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(StatusCode::READ_ONLY_MODE), "ReadOnlyMode");
        assert_eq!(to_string(MdsCode::NO_PERMISSION), "Mds::NoPermission");
        assert_eq!(to_string(JournalCode::BACKEND_ERROR), "Journal::BackendError");
        assert_eq!(to_string(12345), "UnknownStatusCode");
    }

    #[test]
    fn test_to_errno() {
        assert_eq!(to_errno(StatusCode::READ_ONLY_MODE), libc::EROFS);
        assert_eq!(to_errno(MdsCode::NO_PERMISSION), libc::EPERM);
        assert_eq!(to_errno(MdsCode::NOT_FOUND), libc::ENOENT);
        assert_eq!(to_errno(MdsCode::BAD_RANK_TARGET), libc::ENOENT);
        assert_eq!(to_errno(StatusCode::UNKNOWN), libc::EIO);
    }
}
