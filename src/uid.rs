//! Generation of unique DICOM identifiers.
//!
//! UIDs are derived from random UUIDs under the `2.25` root, which
//! needs no registered organization prefix (PS3.5 B.2).

use uuid::Uuid;

/// UID root for UUID-derived identifiers.
pub const UUID_ROOT: &str = "2.25";

/// Create a new globally unique DICOM UID.
pub fn new_uid() -> String {
    format!("{}.{}", UUID_ROOT, Uuid::new_v4().as_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uid_is_valid() {
        let uid = new_uid();
        assert!(uid.starts_with("2.25."));
        // DICOM UIDs are limited to 64 characters of digits and dots
        assert!(uid.len() <= 64);
        assert!(uid.bytes().all(|b| b.is_ascii_digit() || b == b'.'));
    }

    #[test]
    fn test_new_uid_is_unique() {
        assert_ne!(new_uid(), new_uid());
    }
}
