//! Dispatch of DIMSE operations to registered SOP class handlers.
//!
//! The association layer decodes command sets and hands each operation
//! to the [`ServiceRegistry`], which routes it by (SOP Class UID,
//! operation) to whichever handler was registered at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use tracing::debug;

use crate::dimse::{ServiceError, SopClassNotSupportedSnafu};

/// The DIMSE operations the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimseOp {
    NCreate,
    NSet,
}

/// A decoded DIMSE request ready for a handler.
#[derive(Debug)]
pub struct OperationRequest {
    /// SOP Class UID named in the command set.
    pub sop_class_uid: String,
    /// Affected/Requested SOP Instance UID.
    pub instance_uid: String,
    /// The accompanying data set (empty when none was sent).
    pub dataset: InMemDicomObject,
}

/// Handler for the operations of one SOP class.
#[async_trait]
pub trait DimseHandler: Send + Sync {
    /// Execute the operation, returning an optional response data set.
    async fn handle(
        &self,
        op: DimseOp,
        req: OperationRequest,
    ) -> Result<Option<InMemDicomObject>, ServiceError>;
}

/// Routing table from (SOP Class UID, operation) to handler.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: HashMap<(String, DimseOp), Arc<dyn DimseHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one operation of a SOP class.
    ///
    /// Registering twice for the same key replaces the earlier handler;
    /// the replaced handler is returned.
    pub fn register(
        &mut self,
        sop_class_uid: impl Into<String>,
        op: DimseOp,
        handler: Arc<dyn DimseHandler>,
    ) -> Option<Arc<dyn DimseHandler>> {
        let sop_class_uid = sop_class_uid.into();
        debug!(sop_class_uid, ?op, "registered service handler");
        self.handlers.insert((sop_class_uid, op), handler)
    }

    /// SOP Class UIDs with at least one registered handler.
    pub fn sop_classes(&self) -> Vec<&str> {
        let mut uids: Vec<&str> = self.handlers.keys().map(|(uid, _)| uid.as_str()).collect();
        uids.sort_unstable();
        uids.dedup();
        uids
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route a decoded request to its handler.
    pub async fn dispatch(
        &self,
        op: DimseOp,
        req: OperationRequest,
    ) -> Result<Option<InMemDicomObject>, ServiceError> {
        match self.handlers.get(&(req.sop_class_uid.clone(), op)) {
            Some(handler) => handler.handle(op, req).await,
            None => SopClassNotSupportedSnafu {
                uid: req.sop_class_uid,
            }
            .fail(),
        }
    }
}
