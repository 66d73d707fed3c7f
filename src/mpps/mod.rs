//! Modality Performed Procedure Step SCP.
//!
//! Implements the MPPS lifecycle: N-CREATE establishes a procedure step
//! record in `IN PROGRESS`, N-SET merges partial updates into it, and a
//! transition to `COMPLETED` or `DISCONTINUED` finalizes the record
//! permanently. Records are persisted through a [`RecordStore`] so the
//! lifecycle survives restarts.

use std::sync::Arc;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dimse::{DuplicateInstanceSnafu, NoLongerUpdatableSnafu, NoSuchInstanceSnafu, ServiceError};
use crate::dispatch::{DimseHandler, DimseOp, OperationRequest};
use crate::notify::StatusEvent;
use crate::store::{RecordStore, StoreError};

/// SOP Class UID of the Modality Performed Procedure Step service.
pub const MODALITY_PERFORMED_PROCEDURE_STEP: &str = "1.2.840.10008.3.1.2.3.3";

/// Lifecycle state of a performed procedure step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpsStatus {
    InProgress,
    Completed,
    Discontinued,
}

impl PpsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PpsStatus::InProgress => "IN PROGRESS",
            PpsStatus::Completed => "COMPLETED",
            PpsStatus::Discontinued => "DISCONTINUED",
        }
    }

    /// Read the status attribute out of a record, if present and known.
    pub fn from_dicom(record: &InMemDicomObject) -> Option<PpsStatus> {
        let value = record
            .element(tags::PERFORMED_PROCEDURE_STEP_STATUS)
            .ok()?
            .to_str()
            .ok()?;
        match value.trim_end_matches(['\0', ' ']) {
            "IN PROGRESS" => Some(PpsStatus::InProgress),
            "COMPLETED" => Some(PpsStatus::Completed),
            "DISCONTINUED" => Some(PpsStatus::Discontinued),
            _ => None,
        }
    }

    /// Whether further N-SETs are rejected in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, PpsStatus::Completed | PpsStatus::Discontinued)
    }
}

impl std::fmt::Display for PpsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler for the MPPS SOP class.
pub struct MppsService {
    store: Arc<RecordStore>,
    status_events: Option<mpsc::Sender<StatusEvent>>,
}

impl MppsService {
    pub fn new(store: Arc<RecordStore>) -> Self {
        MppsService {
            store,
            status_events: None,
        }
    }

    /// Publish status transitions of managed procedure steps to `tx`.
    pub fn with_status_events(mut self, tx: mpsc::Sender<StatusEvent>) -> Self {
        self.status_events = Some(tx);
        self
    }

    /// Handle N-CREATE: persist a new procedure step in `IN PROGRESS`.
    async fn n_create(
        &self,
        uid: &str,
        mut dataset: InMemDicomObject,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        let _guard = self.store.lock_key(uid).await;
        if self.store.exists(uid) {
            return DuplicateInstanceSnafu { uid }.fail();
        }

        // stamp the identity and initial status before persisting
        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, MODALITY_PERFORMED_PROCEDURE_STEP),
        ));
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
        dataset.put(DataElement::new(
            tags::PERFORMED_PROCEDURE_STEP_STATUS,
            VR::CS,
            dicom_value!(Str, PpsStatus::InProgress.as_str()),
        ));

        match self.store.create(uid, &dataset) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return DuplicateInstanceSnafu { uid }.fail()
            }
            Err(source) => {
                return Err(ServiceError::Persist {
                    uid: uid.to_string(),
                    source,
                })
            }
        }

        info!(uid, "created performed procedure step");
        self.emit_status(uid, PpsStatus::InProgress).await;
        Ok(None)
    }

    /// Handle N-SET: merge an update into an in-progress procedure step.
    async fn n_set(
        &self,
        uid: &str,
        delta: InMemDicomObject,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        let _guard = self.store.lock_key(uid).await;
        if !self.store.exists(uid) {
            return NoSuchInstanceSnafu { uid }.fail();
        }
        let mut record = self.store.read(uid).map_err(|source| ServiceError::Persist {
            uid: uid.to_string(),
            source,
        })?;

        match PpsStatus::from_dicom(&record) {
            Some(PpsStatus::InProgress) => {}
            Some(status) => {
                info!(uid, %status, "rejecting update of finalized procedure step");
                return NoLongerUpdatableSnafu { uid }.fail();
            }
            None => {
                warn!(uid, "stored procedure step has unrecognized status, refusing update");
                return NoLongerUpdatableSnafu { uid }.fail();
            }
        }

        // top-level attribute merge: incoming elements replace stored ones
        for elem in &delta {
            record.put(elem.clone());
        }

        self.store
            .overwrite(uid, &record)
            .map_err(|source| ServiceError::Persist {
                uid: uid.to_string(),
                source,
            })?;

        let new_status = PpsStatus::from_dicom(&record).unwrap_or(PpsStatus::InProgress);
        info!(uid, status = %new_status, "updated performed procedure step");
        self.emit_status(uid, new_status).await;
        Ok(None)
    }

    async fn emit_status(&self, uid: &str, status: PpsStatus) {
        if let Some(tx) = &self.status_events {
            let event = StatusEvent {
                sop_instance_uid: uid.to_string(),
                status,
            };
            if tx.try_send(event).is_err() {
                warn!(uid, "status listener is lagging, dropping notification");
            }
        }
    }
}

#[async_trait]
impl DimseHandler for MppsService {
    async fn handle(
        &self,
        op: DimseOp,
        req: OperationRequest,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        match op {
            DimseOp::NCreate => self.n_create(&req.instance_uid, req.dataset).await,
            DimseOp::NSet => self.n_set(&req.instance_uid, req.dataset).await,
        }
    }
}
