//! Durable key/record storage, one file per record.
//!
//! Records are keyed by their SOP Instance UID and written to a single
//! configured directory. Writes are crash-consistent: the record is
//! serialized fully in memory, written to a temporary file in the same
//! directory and then linked or renamed into place, so a reader never
//! observes a partially written record.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_object::InMemDicomObject;
use snafu::{ensure, ResultExt, Snafu};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

mod codec;

pub use codec::{DicomCodec, JsonCodec, RecordCodec};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// record {uid} already exists
    AlreadyExists { uid: String },

    /// no record for {uid}
    NotFound { uid: String },

    /// {uid} is not a valid DICOM UID
    InvalidUid { uid: String },

    #[snafu(display("could not create record directory {}", path.display()))]
    CreateDir { path: PathBuf, source: io::Error },

    /// I/O error writing record {uid}
    WriteRecord { uid: String, source: io::Error },

    /// I/O error reading record {uid}
    ReadRecord { uid: String, source: io::Error },

    /// could not encode record {uid}
    EncodeRecord {
        uid: String,
        source: codec::Whatever,
    },

    /// could not decode record {uid}
    DecodeRecord {
        uid: String,
        source: codec::Whatever,
    },
}

/// File-backed record storage for one registered service.
pub struct RecordStore {
    dir: PathBuf,
    codec: Arc<dyn RecordCodec>,
    locks: Vec<Mutex<()>>,
}

impl RecordStore {
    /// Open a store rooted at `dir`, creating the directory if absent.
    pub fn new(dir: impl Into<PathBuf>, codec: Arc<dyn RecordCodec>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context(CreateDirSnafu { path: dir.clone() })?;
        Ok(RecordStore {
            dir,
            codec,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Acquire the exclusion guard for `key`.
    ///
    /// Callers hold this across check-then-act sequences (existence
    /// check before create, status check before overwrite) so that two
    /// operations racing on the same key are serialized. Operations on
    /// different keys proceed in parallel, up to stripe collisions.
    pub async fn lock_key(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.locks[(hasher.finish() as usize) % LOCK_STRIPES]
            .lock()
            .await
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_ok_and(|p| p.exists())
    }

    /// Persist a new record. Fails with [`StoreError::AlreadyExists`] if
    /// a record with this key is already on disk; the existing record is
    /// left untouched.
    pub fn create(&self, key: &str, record: &InMemDicomObject) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let bytes = self
            .codec
            .encode(record)
            .context(EncodeRecordSnafu { uid: key })?;
        let tmp = self.temp_path(key);
        self.write_temp(&tmp, &bytes, key)?;
        // hard_link fails atomically when the target exists, which makes
        // the duplicate check race-free even against external writers
        let linked = std::fs::hard_link(&tmp, &path);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                self.sync_dir(key)?;
                debug!("M-WRITE {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => AlreadyExistsSnafu { uid: key }.fail(),
            Err(e) => Err(e).context(WriteRecordSnafu { uid: key }),
        }
    }

    /// Replace an existing record. The previous file remains intact if
    /// serialization or the write fails.
    pub fn overwrite(&self, key: &str, record: &InMemDicomObject) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        ensure!(path.exists(), NotFoundSnafu { uid: key });
        let bytes = self
            .codec
            .encode(record)
            .context(EncodeRecordSnafu { uid: key })?;
        let tmp = self.temp_path(key);
        self.write_temp(&tmp, &bytes, key)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).context(WriteRecordSnafu { uid: key });
        }
        self.sync_dir(key)?;
        debug!("M-WRITE {}", path.display());
        Ok(())
    }

    /// Write and fsync the temporary file; success must not be reported
    /// before the record is on stable storage.
    fn write_temp(&self, tmp: &Path, bytes: &[u8], key: &str) -> Result<(), StoreError> {
        fn write_synced(tmp: &Path, bytes: &[u8]) -> io::Result<()> {
            let mut file = File::create(tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        }
        if let Err(e) = write_synced(tmp, bytes) {
            let _ = std::fs::remove_file(tmp);
            return Err(e).context(WriteRecordSnafu { uid: key });
        }
        Ok(())
    }

    /// Flush the directory entry of a freshly linked or renamed record.
    fn sync_dir(&self, key: &str) -> Result<(), StoreError> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .context(WriteRecordSnafu { uid: key })
    }

    pub fn read(&self, key: &str) -> Result<InMemDicomObject, StoreError> {
        let path = self.path_for(key)?;
        debug!("M-READ {}", path.display());
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return NotFoundSnafu { uid: key }.fail()
            }
            Err(e) => return Err(e).context(ReadRecordSnafu { uid: key }),
        };
        self.codec
            .decode(&bytes)
            .context(DecodeRecordSnafu { uid: key })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        // keys become file names; only UID characters are acceptable
        ensure!(
            !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit() || b == b'.'),
            InvalidUidSnafu { uid: key }
        );
        Ok(self.dir.join(format!("{}{}", key, self.codec.suffix())))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!(".{}{}.tmp", key, self.codec.suffix()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use tempfile::TempDir;

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
        obj
    }

    fn new_store(dir: &TempDir) -> RecordStore {
        RecordStore::new(dir.path(), Arc::new(DicomCodec)).unwrap()
    }

    #[test]
    fn test_create_and_read() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store.create("1.2.3", &sample_record("1.2.3")).unwrap();
        assert!(store.exists("1.2.3"));
        let back = store.read("1.2.3").unwrap();
        assert_eq!(
            back.element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            "1.2.3"
        );
    }

    #[test]
    fn test_create_duplicate_leaves_record_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store.create("1.2.3", &sample_record("1.2.3")).unwrap();
        let before = std::fs::read(dir.path().join("1.2.3")).unwrap();

        let mut other = sample_record("1.2.3");
        other.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "INTRUDER"),
        ));
        let err = store.create("1.2.3", &other).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let after = std::fs::read(dir.path().join("1.2.3")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_overwrite_requires_existing() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let err = store.overwrite("9.9.9", &sample_record("9.9.9")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!store.exists("9.9.9"));
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store.create("1.2.3", &sample_record("1.2.3")).unwrap();

        let mut updated = sample_record("1.2.3");
        updated.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P-0002"),
        ));
        store.overwrite("1.2.3", &updated).unwrap();

        let back = store.read("1.2.3").unwrap();
        assert_eq!(
            back.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P-0002"
        );
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        assert!(matches!(
            store.read("4.5.6").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn test_rejects_non_uid_keys() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        for key in ["", "../escape", "a.b.c", "1.2.3/4"] {
            assert!(matches!(
                store.read(key).unwrap_err(),
                StoreError::InvalidUid { .. }
            ));
        }
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store.create("1.2.3", &sample_record("1.2.3")).unwrap();
        let _ = store.create("1.2.3", &sample_record("1.2.3")).unwrap_err();
        store.overwrite("1.2.3", &sample_record("1.2.3")).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec![std::ffi::OsString::from("1.2.3")]);
    }

    #[test]
    fn test_json_store_uses_suffix() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path(), Arc::new(JsonCodec::default())).unwrap();
        store.create("1.2.3", &sample_record("1.2.3")).unwrap();
        assert!(dir.path().join("1.2.3.json").exists());
        assert!(store.exists("1.2.3"));
    }
}
