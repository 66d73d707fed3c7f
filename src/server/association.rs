//! Per-association DIMSE loop.
//!
//! Each accepted TCP connection is negotiated into an association and
//! served here until the peer releases, aborts, or the link drops.
//! Commands arrive as P-DATA PDUs in implicit VR little endian; data
//! sets follow in the transfer syntax negotiated for their presentation
//! context.

use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    association::AsyncServerAssociation,
    pdu::{PDataValue, PDataValueType, PresentationContextResultReason},
    Pdu,
};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dimse::{command, status};
use crate::dispatch::{DimseOp, OperationRequest, ServiceRegistry};
use crate::uid;

/// SOP Class UID of the Verification service (C-ECHO).
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// An N-CREATE or N-SET whose command set has arrived but whose data
/// set has not.
struct PendingOperation {
    op: DimseOp,
    message_id: u16,
    sop_class_uid: String,
    instance_uid: String,
    presentation_context_id: u8,
}

/// A fully reassembled P-DATA message.
enum PdvMessage {
    Command(Vec<u8>),
    Dataset(Vec<u8>),
}

/// Reassembles fragmented PDV streams into whole command and data sets.
///
/// Both command sets and data sets may arrive split over several PDVs;
/// fragments of each kind accumulate independently until the PDV marked
/// as last completes the message.
#[derive(Default)]
struct PdvAssembler {
    command: Vec<u8>,
    dataset: Vec<u8>,
}

impl PdvAssembler {
    fn push(&mut self, pdv: &mut PDataValue) -> Option<PdvMessage> {
        let is_command = pdv.value_type == PDataValueType::Command;
        let buffer = if is_command {
            &mut self.command
        } else {
            &mut self.dataset
        };
        buffer.append(&mut pdv.data);
        if !pdv.is_last {
            return None;
        }
        let bytes = std::mem::take(buffer);
        Some(if is_command {
            PdvMessage::Command(bytes)
        } else {
            PdvMessage::Dataset(bytes)
        })
    }

    /// Drop buffered data set fragments, e.g. when a new command set
    /// supersedes the operation they belonged to.
    fn discard_dataset(&mut self) {
        self.dataset.clear();
    }
}

/// Serve one association until the peer releases or the link drops.
pub(crate) async fn serve(
    stream: tokio::net::TcpStream,
    config: Arc<ServerConfig>,
    registry: Arc<ServiceRegistry>,
) -> Result<(), Whatever> {
    let mut options = dicom_ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(&config.ae_title)
        .strict(config.strict)
        .max_pdu_length(config.max_pdu_length)
        .with_abstract_syntax(VERIFICATION);

    for uid in registry.sop_classes() {
        options = options.with_abstract_syntax(uid.to_owned());
    }
    for ts in config.transfer_syntaxes.uids() {
        options = options.with_transfer_syntax(*ts);
    }

    let peer_addr = stream.peer_addr().ok();
    let association = options
        .establish_async(stream)
        .await
        .whatever_context("could not establish association")?;

    info!("New association from {}", association.client_ae_title());
    debug!(
        "#accepted_presentation_contexts={}, acceptor_max_pdu_length={}, requestor_max_pdu_length={}",
        association.presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .count(),
        association.acceptor_max_pdu_length(),
        association.requestor_max_pdu_length(),
    );

    let peer_title = association.client_ae_title().to_string();
    handle_loop(association, &registry).await?;

    if let Some(peer_addr) = peer_addr {
        info!("Dropping connection with {} ({})", peer_title, peer_addr);
    } else {
        info!("Dropping connection with {}", peer_title);
    }

    Ok(())
}

async fn handle_loop(
    mut association: AsyncServerAssociation<tokio::net::TcpStream>,
    registry: &ServiceRegistry,
) -> Result<(), Whatever> {
    let mut assembler = PdvAssembler::default();
    let mut pending: Option<PendingOperation> = None;

    loop {
        match association.receive().await {
            Ok(mut pdu) => {
                debug!("scu ----> scp: {}", pdu.short_description());
                match pdu {
                    Pdu::PData { ref mut data } => {
                        if data.is_empty() {
                            debug!("Ignoring empty PData PDU");
                            continue;
                        }

                        for data_value in data {
                            let context_id = data_value.presentation_context_id;
                            let Some(message) = assembler.push(data_value) else {
                                continue;
                            };
                            match message {
                                PdvMessage::Command(bytes) => {
                                    let response = handle_command(
                                        &bytes,
                                        context_id,
                                        registry,
                                        &mut pending,
                                    )
                                    .await?;
                                    assembler.discard_dataset();
                                    if let Some(response) = response {
                                        send_command(&mut association, context_id, &response)
                                            .await?;
                                    }
                                }
                                PdvMessage::Dataset(bytes) => {
                                    let Some(operation) = pending.take() else {
                                        warn!("Discarding data set with no pending operation");
                                        continue;
                                    };

                                    let presentation_context = association
                                        .presentation_contexts()
                                        .iter()
                                        .find(|pc| pc.id == context_id)
                                        .whatever_context("missing presentation context")?;
                                    let ts = &presentation_context.transfer_syntax;

                                    let dataset = InMemDicomObject::read_dataset_with_ts(
                                        bytes.as_slice(),
                                        TransferSyntaxRegistry
                                            .get(ts)
                                            .whatever_context("unsupported transfer syntax")?,
                                    )
                                    .whatever_context("failed to read incoming data set")?;

                                    // respond on the context the command came in on
                                    let response_context_id = operation.presentation_context_id;
                                    let response = execute(registry, operation, dataset).await;
                                    send_command(&mut association, response_context_id, &response)
                                        .await?;
                                }
                            }
                        }
                    }
                    Pdu::ReleaseRQ => {
                        association.send(&Pdu::ReleaseRP).await.unwrap_or_else(|e| {
                            warn!(
                                "Failed to send association release message to SCU: {}",
                                snafu::Report::from_error(e)
                            );
                        });
                        info!("Released association with {}", association.client_ae_title());
                        break;
                    }
                    Pdu::AbortRQ { source } => {
                        warn!("Aborted connection from: {:?}", source);
                        break;
                    }
                    _ => {}
                }
            }
            Err(err @ dicom_ul::association::Error::ReceivePdu { .. }) => {
                info!("{}", Report::from_error(err));
                break;
            }
            Err(err) => {
                warn!("Unexpected error: {}", Report::from_error(err));
                break;
            }
        }
    }

    Ok(())
}

/// Decode a command set and either answer it immediately or remember it
/// until its data set arrives.
async fn handle_command(
    bytes: &[u8],
    presentation_context_id: u8,
    registry: &ServiceRegistry,
    pending: &mut Option<PendingOperation>,
) -> Result<Option<InMemDicomObject>, Whatever> {
    // commands are always in implicit VR LE
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(bytes, &ts)
        .whatever_context("failed to read incoming DICOM command")?;

    let command_field = obj
        .element(tags::COMMAND_FIELD)
        .whatever_context("Missing Command Field")?
        .uint16()
        .whatever_context("Command Field is not an integer")?;

    if command_field == command::C_ECHO_RQ {
        let message_id = read_message_id(&obj)?;
        return Ok(Some(echo_response(message_id)));
    }

    let (op, class_tag, instance_tag) = match command_field {
        command::N_CREATE_RQ => (
            DimseOp::NCreate,
            tags::AFFECTED_SOP_CLASS_UID,
            tags::AFFECTED_SOP_INSTANCE_UID,
        ),
        command::N_SET_RQ => (
            DimseOp::NSet,
            tags::REQUESTED_SOP_CLASS_UID,
            tags::REQUESTED_SOP_INSTANCE_UID,
        ),
        other => {
            warn!("Unrecognized command field {:#06x}", other);
            let message_id = read_message_id(&obj).unwrap_or(0);
            return Ok(Some(unrecognized_response(message_id)));
        }
    };

    let message_id = read_message_id(&obj)?;
    let sop_class_uid = read_uid(&obj, class_tag)
        .whatever_context("missing SOP Class UID in command set")?;
    // the SCU may leave instance assignment to us on N-CREATE
    let instance_uid = match read_uid(&obj, instance_tag) {
        Some(uid) => uid,
        None if op == DimseOp::NCreate => uid::new_uid(),
        None => snafu::whatever!("missing Requested SOP Instance UID in command set"),
    };

    let has_dataset = obj
        .element(tags::COMMAND_DATA_SET_TYPE)
        .ok()
        .and_then(|e| e.uint16().ok())
        .is_some_and(|v| v != command::NO_DATA_SET);

    let operation = PendingOperation {
        op,
        message_id,
        sop_class_uid,
        instance_uid,
        presentation_context_id,
    };

    if has_dataset {
        *pending = Some(operation);
        Ok(None)
    } else {
        // operations without a data set are executed right away
        Ok(Some(execute(registry, operation, InMemDicomObject::new_empty()).await))
    }
}

/// Run the pending operation through the registry and build its
/// response command set.
async fn execute(
    registry: &ServiceRegistry,
    operation: PendingOperation,
    dataset: InMemDicomObject,
) -> InMemDicomObject {
    let PendingOperation {
        op,
        message_id,
        sop_class_uid,
        instance_uid,
        presentation_context_id: _,
    } = operation;

    let request = OperationRequest {
        sop_class_uid: sop_class_uid.clone(),
        instance_uid: instance_uid.clone(),
        dataset,
    };

    match registry.dispatch(op, request).await {
        Ok(_) => operation_response(
            op,
            message_id,
            &sop_class_uid,
            &instance_uid,
            status::SUCCESS,
            None,
            None,
        ),
        Err(err) => {
            warn!(%sop_class_uid, %instance_uid, "operation failed: {}", err);
            operation_response(
                op,
                message_id,
                &sop_class_uid,
                &instance_uid,
                err.status(),
                err.error_id(),
                err.error_comment(),
            )
        }
    }
}

async fn send_command(
    association: &mut AsyncServerAssociation<tokio::net::TcpStream>,
    presentation_context_id: u8,
    response: &InMemDicomObject,
) -> Result<(), Whatever> {
    // commands are always in implicit VR LE
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut response_data = Vec::new();
    response
        .write_dataset_with_ts(&mut response_data, &ts)
        .whatever_context("could not write response object")?;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: response_data,
            }],
        })
        .await
        .whatever_context("failed to send response object to SCU")?;
    Ok(())
}

fn read_message_id(obj: &InMemDicomObject) -> Result<u16, Whatever> {
    obj.element(tags::MESSAGE_ID)
        .whatever_context("Missing Message ID")?
        .uint16()
        .whatever_context("Message ID is not an integer")
}

fn read_uid(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches('\0').to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn echo_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command::C_ECHO_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [command::NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
    ])
}

fn unrecognized_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8000])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [command::NO_DATA_SET]),
        ),
        DataElement::new(
            tags::STATUS,
            VR::US,
            dicom_value!(U16, [status::UNRECOGNIZED_OPERATION]),
        ),
    ])
}

fn operation_response(
    op: DimseOp,
    message_id: u16,
    sop_class_uid: &str,
    instance_uid: &str,
    status: u16,
    error_id: Option<u16>,
    error_comment: Option<&str>,
) -> InMemDicomObject<StandardDataDictionary> {
    let command_field = match op {
        DimseOp::NCreate => command::N_CREATE_RSP,
        DimseOp::NSet => command::N_SET_RSP,
    };
    let mut obj = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [command::NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, instance_uid),
        ),
    ]);
    if let Some(error_id) = error_id {
        obj.put(DataElement::new(
            tags::ERROR_ID,
            VR::US,
            dicom_value!(U16, [error_id]),
        ));
    }
    if let Some(comment) = error_comment {
        obj.put(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            dicom_value!(Str, comment),
        ));
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::ERROR_ID_NO_LONGER_UPDATABLE;

    fn pdv(value_type: PDataValueType, is_last: bool, data: Vec<u8>) -> PDataValue {
        PDataValue {
            presentation_context_id: 1,
            value_type,
            is_last,
            data,
        }
    }

    #[test]
    fn test_fragmented_command_is_reassembled() {
        let mut assembler = PdvAssembler::default();
        assert!(assembler
            .push(&mut pdv(PDataValueType::Command, false, vec![1, 2]))
            .is_none());
        match assembler.push(&mut pdv(PDataValueType::Command, true, vec![3])) {
            Some(PdvMessage::Command(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected a completed command set"),
        }
    }

    #[test]
    fn test_command_and_dataset_fragments_accumulate_independently() {
        let mut assembler = PdvAssembler::default();
        assert!(assembler
            .push(&mut pdv(PDataValueType::Data, false, vec![9]))
            .is_none());
        assert!(assembler
            .push(&mut pdv(PDataValueType::Command, false, vec![1]))
            .is_none());
        match assembler.push(&mut pdv(PDataValueType::Data, true, vec![8])) {
            Some(PdvMessage::Dataset(bytes)) => assert_eq!(bytes, vec![9, 8]),
            _ => panic!("expected a completed data set"),
        }
        match assembler.push(&mut pdv(PDataValueType::Command, true, vec![2])) {
            Some(PdvMessage::Command(bytes)) => assert_eq!(bytes, vec![1, 2]),
            _ => panic!("expected a completed command set"),
        }
    }

    #[test]
    fn test_discarded_dataset_fragments_do_not_leak() {
        let mut assembler = PdvAssembler::default();
        assert!(assembler
            .push(&mut pdv(PDataValueType::Data, false, vec![7, 7]))
            .is_none());
        assembler.discard_dataset();
        match assembler.push(&mut pdv(PDataValueType::Data, true, vec![1])) {
            Some(PdvMessage::Dataset(bytes)) => assert_eq!(bytes, vec![1]),
            _ => panic!("expected a completed data set"),
        }
    }

    #[test]
    fn test_echo_response_shape() {
        let rsp = echo_response(7);
        assert_eq!(
            rsp.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x8030
        );
        assert_eq!(
            rsp.element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
                .unwrap()
                .uint16()
                .unwrap(),
            7
        );
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), 0x0000);
    }

    #[test]
    fn test_success_response_has_no_error_fields() {
        let rsp = operation_response(
            DimseOp::NCreate,
            1,
            "1.2.840.10008.3.1.2.3.3",
            "1.2.3",
            status::SUCCESS,
            None,
            None,
        );
        assert_eq!(
            rsp.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x8140
        );
        assert_eq!(
            rsp.element(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            "1.2.3"
        );
        assert!(rsp.element(tags::ERROR_ID).is_err());
        assert!(rsp.element(tags::ERROR_COMMENT).is_err());
    }

    #[test]
    fn test_rejection_response_carries_error_fields() {
        let rsp = operation_response(
            DimseOp::NSet,
            2,
            "1.2.840.10008.3.1.2.3.3",
            "1.2.3",
            status::PROCESSING_FAILURE,
            Some(ERROR_ID_NO_LONGER_UPDATABLE),
            Some("Performed Procedure Step Object may no longer be updated"),
        );
        assert_eq!(
            rsp.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x8120
        );
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), 0x0110);
        assert_eq!(
            rsp.element(tags::ERROR_ID).unwrap().uint16().unwrap(),
            0xA710
        );
        assert!(rsp
            .element(tags::ERROR_COMMENT)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("no longer be updated"));
    }
}
