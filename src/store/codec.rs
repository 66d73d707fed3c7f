//! On-disk encodings for procedure step records.
//!
//! Two representations are supported side by side: the standard DICOM
//! file format and DICOM JSON (PS3.18 annex F). The codec is chosen per
//! registered service at startup, not per record.

use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject, OpenFileOptions};
use dicom_transfer_syntax_registry::entries;
use snafu::{ResultExt, Snafu};

/// Like [`snafu::Whatever`], but `Send + Sync` so codec errors can
/// cross task boundaries.
#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct Whatever {
    #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: String,
}

/// Serialization strategy for one record directory.
pub trait RecordCodec: Send + Sync {
    /// File name suffix appended to the storage key, e.g. `".json"`.
    fn suffix(&self) -> &'static str;

    /// Serialize a record to its durable byte form.
    fn encode(&self, record: &InMemDicomObject) -> Result<Vec<u8>, Whatever>;

    /// Deserialize a record from its durable byte form.
    fn decode(&self, bytes: &[u8]) -> Result<InMemDicomObject, Whatever>;
}

/// Standard DICOM file encoding (preamble, file meta group, Explicit VR
/// Little Endian data set).
#[derive(Debug, Default)]
pub struct DicomCodec;

impl RecordCodec for DicomCodec {
    fn suffix(&self) -> &'static str {
        ""
    }

    fn encode(&self, record: &InMemDicomObject) -> Result<Vec<u8>, Whatever> {
        let sop_class_uid = record
            .element(tags::SOP_CLASS_UID)
            .whatever_context("record is missing SOP Class UID")?
            .to_str()
            .whatever_context("could not retrieve SOP Class UID")?
            .trim_end_matches('\0')
            .to_string();
        let sop_instance_uid = record
            .element(tags::SOP_INSTANCE_UID)
            .whatever_context("record is missing SOP Instance UID")?
            .to_str()
            .whatever_context("could not retrieve SOP Instance UID")?
            .trim_end_matches('\0')
            .to_string();

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(&sop_class_uid)
            .media_storage_sop_instance_uid(&sop_instance_uid)
            .transfer_syntax(entries::EXPLICIT_VR_LITTLE_ENDIAN.uid())
            .build()
            .whatever_context("failed to build DICOM file meta information")?;

        let mut out = Vec::with_capacity(1024);
        record
            .clone()
            .with_exact_meta(meta)
            .write_all(&mut out)
            .whatever_context("could not serialize DICOM record")?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<InMemDicomObject, Whatever> {
        let obj = OpenFileOptions::new()
            .read_preamble(ReadPreamble::Auto)
            .from_reader(bytes)
            .whatever_context("could not parse DICOM record")?;
        Ok((*obj).clone())
    }
}

/// DICOM JSON encoding, stored with a `.json` suffix.
#[derive(Debug)]
pub struct JsonCodec {
    indent: bool,
}

impl JsonCodec {
    pub fn new(indent: bool) -> Self {
        JsonCodec { indent }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        JsonCodec { indent: true }
    }
}

impl RecordCodec for JsonCodec {
    fn suffix(&self) -> &'static str {
        ".json"
    }

    fn encode(&self, record: &InMemDicomObject) -> Result<Vec<u8>, Whatever> {
        let text = if self.indent {
            dicom_json::to_string_pretty(record)
        } else {
            dicom_json::to_string(record)
        }
        .whatever_context("could not serialize record to DICOM JSON")?;
        Ok(text.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<InMemDicomObject, Whatever> {
        let text =
            std::str::from_utf8(bytes).whatever_context("record is not valid UTF-8 JSON")?;
        dicom_json::from_str::<InMemDicomObject>(text)
            .whatever_context("could not parse DICOM JSON record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn sample_record(uid: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.3.1.2.3.3"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P-0001"),
        ));
        obj
    }

    #[test]
    fn test_dicom_roundtrip() {
        let codec = DicomCodec;
        let record = sample_record("1.2.3.4");
        let bytes = codec.encode(&record).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(
            back.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P-0001"
        );
        assert_eq!(
            back.element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            "1.2.3.4"
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec::default();
        let record = sample_record("1.2.3.5");
        let bytes = codec.encode(&record).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(
            back.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P-0001"
        );
    }

    #[test]
    fn test_json_suffix() {
        assert_eq!(JsonCodec::default().suffix(), ".json");
        assert_eq!(DicomCodec.suffix(), "");
    }

    #[test]
    fn test_dicom_encode_requires_identity() {
        let codec = DicomCodec;
        let mut record = InMemDicomObject::new_empty();
        record.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P-0001"),
        ));
        assert!(codec.encode(&record).is_err());
    }
}
