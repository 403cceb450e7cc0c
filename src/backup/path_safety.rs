//! Validation of user-controlled storage path fragments.

use std::fmt;

/// Reason a path fragment was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    /// Contains a `..` sequence
    Traversal,
    /// Contains a backslash separator
    Backslash,
    /// Starts with `/` or a drive letter such as `C:/`
    Absolute,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            PathRejection::Traversal => "path must not contain '..'",
            PathRejection::Backslash => "path must not contain backslashes",
            PathRejection::Absolute => "path must be relative",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for PathRejection {}

/// Validate a relative path fragment such as a storage prefix or filename.
///
/// A missing or empty fragment is always accepted. Checks run in order
/// (traversal, backslash, absolute) and the first failure is reported.
pub fn validate_path(path: Option<&str>, allow_absolute: bool) -> Result<(), PathRejection> {
    let path = match path {
        Some(path) if !path.is_empty() => path,
        _ => return Ok(()),
    };

    if path.contains("..") {
        return Err(PathRejection::Traversal);
    }

    if path.contains('\\') {
        return Err(PathRejection::Backslash);
    }

    if !allow_absolute && (path.starts_with('/') || has_drive_prefix(path)) {
        return Err(PathRejection::Absolute);
    }

    Ok(())
}

/// Convenience wrapper for relative-only fragments
pub fn validate_relative(path: &str) -> Result<(), PathRejection> {
    validate_path(Some(path), false)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_traversal() {
        for path in ["../etc/passwd", "foo/../bar", "..\\windows\\system32"] {
            assert_eq!(validate_path(Some(path), false), Err(PathRejection::Traversal), "{path}");
            assert_eq!(validate_path(Some(path), true), Err(PathRejection::Traversal), "{path}");
        }
    }

    #[test]
    fn test_rejects_backslashes() {
        assert_eq!(validate_path(Some("foo\\bar"), false), Err(PathRejection::Backslash));
        assert_eq!(validate_path(Some("C:\\Users\\test"), false), Err(PathRejection::Backslash));
        assert_eq!(validate_path(Some("C:\\Users\\test"), true), Err(PathRejection::Backslash));
    }

    #[test]
    fn test_absolute_paths_depend_on_flag() {
        for path in ["/etc/passwd", "C:/", "d:/backups"] {
            assert_eq!(validate_path(Some(path), false), Err(PathRejection::Absolute), "{path}");
            assert_eq!(validate_path(Some(path), true), Ok(()), "{path}");
        }
    }

    #[test]
    fn test_accepts_safe_fragments() {
        assert_eq!(validate_path(None, false), Ok(()));
        assert_eq!(validate_path(Some(""), false), Ok(()));
        assert_eq!(validate_path(Some("backups"), false), Ok(()));
        assert_eq!(validate_path(Some("mysql/production"), false), Ok(()));
        assert_eq!(validate_relative("server/db/file.sql.gz"), Ok(()));
    }

    #[test]
    fn test_drive_letter_needs_forward_slash() {
        // "C:" alone or "1:/" are not drive-absolute
        assert_eq!(validate_path(Some("C:"), false), Ok(()));
        assert_eq!(validate_path(Some("1:/x"), false), Ok(()));
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(PathRejection::Traversal.to_string(), "path must not contain '..'");
        assert_eq!(PathRejection::Absolute.to_string(), "path must be relative");
    }
}
