use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{estimate_byte_size, FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// Placeholder for a key whose state is not known.
    Invalid,
    FoundDocument,
    NoDocument,
    /// Committed by this client, but the resulting contents are not known.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document together with its lifecycle metadata.
///
/// Documents are never removed from memory while referenced; transitions
/// replace their contents in place through the `convert_to_*` methods.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_found_document(version, data);
        doc
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_no_document(version);
        doc
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid_document(key);
        doc.convert_to_unknown_document(version);
        doc
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Local mutations reset the version: the document no longer reflects any
    /// server snapshot.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    /// Approximate cached size: key plus payload.
    pub fn estimate_byte_size(&self) -> usize {
        let key_size: usize = self.key.path().segments().iter().map(String::len).sum();
        key_size + self.data.fields().iter().map(|(k, v)| k.len() * 2 + estimate_byte_size(v)).sum::<usize>()
    }
}
