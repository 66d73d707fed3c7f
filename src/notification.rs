//! Study content notification SCPs.
//!
//! Instance Availability Notification and Basic Study Content
//! Notification are create-only services: the incoming notification is
//! stamped with its identity and persisted, never updated afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::info;

use crate::dimse::{DuplicateInstanceSnafu, ServiceError, SopClassNotSupportedSnafu};
use crate::dispatch::{DimseHandler, DimseOp, OperationRequest};
use crate::store::{RecordStore, StoreError};

/// SOP Class UID of the Instance Availability Notification service.
pub const INSTANCE_AVAILABILITY_NOTIFICATION: &str = "1.2.840.10008.5.1.4.33";

/// SOP Class UID of the Basic Study Content Notification service.
pub const BASIC_STUDY_CONTENT_NOTIFICATION: &str = "1.2.840.10008.1.9";

/// Create-only handler persisting notification objects for one SOP class.
pub struct NotificationService {
    sop_class_uid: &'static str,
    store: Arc<RecordStore>,
}

impl NotificationService {
    pub fn new(sop_class_uid: &'static str, store: Arc<RecordStore>) -> Self {
        NotificationService {
            sop_class_uid,
            store,
        }
    }

    async fn n_create(
        &self,
        uid: &str,
        mut dataset: InMemDicomObject,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        let _guard = self.store.lock_key(uid).await;
        if self.store.exists(uid) {
            return DuplicateInstanceSnafu { uid }.fail();
        }

        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, self.sop_class_uid),
        ));
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));

        match self.store.create(uid, &dataset) {
            Ok(()) => {
                info!(uid, sop_class = self.sop_class_uid, "stored notification");
                Ok(None)
            }
            Err(StoreError::AlreadyExists { .. }) => DuplicateInstanceSnafu { uid }.fail(),
            Err(source) => Err(ServiceError::Persist {
                uid: uid.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl DimseHandler for NotificationService {
    async fn handle(
        &self,
        op: DimseOp,
        req: OperationRequest,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        match op {
            DimseOp::NCreate => self.n_create(&req.instance_uid, req.dataset).await,
            // notifications are never updated
            DimseOp::NSet => SopClassNotSupportedSnafu {
                uid: req.sop_class_uid,
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DicomCodec;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> NotificationService {
        let store = RecordStore::new(dir.path(), Arc::new(DicomCodec)).unwrap();
        NotificationService::new(INSTANCE_AVAILABILITY_NOTIFICATION, Arc::new(store))
    }

    fn request(op_dataset: InMemDicomObject) -> OperationRequest {
        OperationRequest {
            sop_class_uid: INSTANCE_AVAILABILITY_NOTIFICATION.to_string(),
            instance_uid: "1.2.3".to_string(),
            dataset: op_dataset,
        }
    }

    #[tokio::test]
    async fn test_notification_is_persisted_with_identity() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.1.1"),
        ));
        svc.handle(DimseOp::NCreate, request(dataset)).await.unwrap();

        let record = svc.store.read("1.2.3").unwrap();
        assert_eq!(
            record
                .element(tags::SOP_CLASS_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            INSTANCE_AVAILABILITY_NOTIFICATION
        );
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.handle(DimseOp::NCreate, request(InMemDicomObject::new_empty()))
            .await
            .unwrap();
        let err = svc
            .handle(DimseOp::NCreate, request(InMemDicomObject::new_empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateInstance { .. }));
    }

    #[tokio::test]
    async fn test_set_is_not_supported() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc
            .handle(DimseOp::NSet, request(InMemDicomObject::new_empty()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SopClassNotSupported { .. }));
    }
}
