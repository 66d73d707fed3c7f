//! DIMSE constants and the service-level error type shared by all
//! registered SOP class handlers.

use snafu::Snafu;

use crate::store::StoreError;

/// DIMSE command field values.
pub mod command {
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
    pub const N_CREATE_RQ: u16 = 0x0140;
    pub const N_CREATE_RSP: u16 = 0x8140;
    pub const N_SET_RQ: u16 = 0x0120;
    pub const N_SET_RSP: u16 = 0x8120;

    /// Command Data Set Type value meaning "no data set present".
    pub const NO_DATA_SET: u16 = 0x0101;
}

/// DIMSE status codes (PS3.7 annex C).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
    pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

/// Error ID reported when an N-SET targets a finalized procedure step.
pub const ERROR_ID_NO_LONGER_UPDATABLE: u16 = 0xA710;

/// Failure of a dispatched DIMSE operation.
///
/// Every variant maps onto the DIMSE status word returned to the peer;
/// business-rule rejections additionally carry an error ID or comment.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    /// SOP instance {uid} already exists
    DuplicateInstance { uid: String },

    /// no such SOP instance {uid}
    NoSuchInstance { uid: String },

    /// performed procedure step {uid} may no longer be updated
    NoLongerUpdatable { uid: String },

    /// SOP class {uid} not supported
    SopClassNotSupported { uid: String },

    /// could not persist record {uid}
    Persist { uid: String, source: StoreError },
}

impl ServiceError {
    /// The DIMSE status word reported to the peer.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::DuplicateInstance { .. } => status::DUPLICATE_SOP_INSTANCE,
            ServiceError::NoSuchInstance { .. } => status::NO_SUCH_OBJECT_INSTANCE,
            ServiceError::NoLongerUpdatable { .. } => status::PROCESSING_FAILURE,
            ServiceError::SopClassNotSupported { .. } => status::SOP_CLASS_NOT_SUPPORTED,
            ServiceError::Persist { .. } => status::PROCESSING_FAILURE,
        }
    }

    /// Error ID attribute for the response, when one applies.
    pub fn error_id(&self) -> Option<u16> {
        match self {
            ServiceError::NoLongerUpdatable { .. } => Some(ERROR_ID_NO_LONGER_UPDATABLE),
            _ => None,
        }
    }

    /// Error Comment attribute for the response, when one applies.
    pub fn error_comment(&self) -> Option<&'static str> {
        match self {
            ServiceError::NoLongerUpdatable { .. } => {
                Some("Performed Procedure Step Object may no longer be updated")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = ServiceError::DuplicateInstance { uid: "1.2.3".into() };
        assert_eq!(err.status(), 0x0111);
        assert_eq!(err.error_id(), None);

        let err = ServiceError::NoSuchInstance { uid: "1.2.3".into() };
        assert_eq!(err.status(), 0x0112);

        let err = ServiceError::NoLongerUpdatable { uid: "1.2.3".into() };
        assert_eq!(err.status(), 0x0110);
        assert_eq!(err.error_id(), Some(0xA710));
        assert!(err.error_comment().unwrap().contains("no longer be updated"));

        let err = ServiceError::SopClassNotSupported { uid: "1.2.3".into() };
        assert_eq!(err.status(), 0x0122);
    }
}
