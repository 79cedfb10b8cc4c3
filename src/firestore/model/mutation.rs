use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Condition the stored document must satisfy for a write to apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
            Precondition::UpdateTime(version) => doc.is_found_document() && doc.version() == *version,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Optimistic result computed before the server has seen the write.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_kind(ValueKind::Array(coerce_array(previous).union_with(elements)))
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_kind(ValueKind::Array(coerce_array(previous).remove_all(elements)))
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                increment(&base, operand)
            }
        }
    }

    /// Final value once the server acknowledged the write. Array transforms are
    /// replayed locally since the server does not echo their result.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::default())
            }
            _ => server_result,
        }
    }

    /// Value the transform reads from, when it must be pinned for idempotent
    /// replays. Only increments need one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerce_array(previous: Option<&FirestoreValue>) -> ArrayValue {
    previous
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.as_integer(), operand.as_integer()) {
        (Some(left), Some(right)) => FirestoreValue::from_integer(left.saturating_add(right)),
        _ => FirestoreValue::from_double(
            base.as_f64().unwrap_or_default() + operand.as_f64().unwrap_or_default(),
        ),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the fields in `mask`; masked fields absent from `value` are deleted.
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing. Only used by transactions.
    Verify,
}

/// A single write to one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Server outcome for a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl Mutation {
    pub fn new(
        key: DocumentKey,
        kind: MutationKind,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    ) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms,
        }
    }

    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None, Vec::new())
    }

    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self::new(
            key,
            MutationKind::Patch { value, mask },
            Precondition::Exists(true),
            Vec::new(),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None, Vec::new())
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition, Vec::new())
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Field mask of a patch, `None` for other kinds.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask),
            _ => None,
        }
    }

    /// Applies the acknowledged mutation, taking server transform results.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        hard_assert(doc.key() == &self.key, || {
            format!("Can only apply a mutation for {} to the same document, not {}", self.key, doc.key())
        })?;

        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.server_transform_results(doc, &result.transform_results)?;
                let mut data = value.clone();
                data.set_all(transforms);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(doc) {
                    // The server applied a patch we cannot replay locally.
                    doc.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let transforms = self.server_transform_results(doc, &result.transform_results)?;
                let mut data = doc.data().clone();
                data.set_all(patch_values(value, mask));
                data.set_all(transforms);
                doc.convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                doc.convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {
                hard_assert(false, || "Verify mutations are only used in transactions".to_string())?;
            }
        }
        Ok(())
    }

    /// Applies the mutation optimistically and returns the accumulated set of
    /// changed fields, where `None` means the whole document changed.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        debug_assert_eq!(doc.key(), &self.key);

        if !self.precondition.is_valid_for(doc) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = value.clone();
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found_document(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transforms = self.local_transform_results(doc, local_write_time);
                let mut data = doc.data().clone();
                data.set_all(patch_values(value, mask));
                data.set_all(transforms);
                let version = doc.version();
                doc.convert_to_found_document(version, data).set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.iter().cloned())
                        .union_with(self.field_transforms.iter().map(|t| t.field().clone()))
                })
            }
            MutationKind::Delete => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Patch pinning the current values read by non-idempotent transforms, so a
    /// replay after a restart produces the same local result.
    pub fn extract_transform_base_value(&self, doc: &MutableDocument) -> Option<Mutation> {
        let mut base: Option<MapValue> = None;
        for transform in &self.field_transforms {
            let existing = doc.field(transform.field());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field(), value);
            }
        }
        base.map(|value| {
            let mask = value.field_mask();
            Mutation::new(
                self.key.clone(),
                MutationKind::Patch { value, mask },
                Precondition::Exists(true),
                Vec::new(),
            )
        })
    }

    fn local_transform_results(
        &self,
        doc: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = doc.field(transform.field());
                let value = transform.operation().apply_to_local_view(previous, local_write_time);
                (transform.field().clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        doc: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> FirestoreResult<BTreeMap<FieldPath, Option<FirestoreValue>>> {
        hard_assert(self.field_transforms.len() == server_results.len(), || {
            format!(
                "server transform result count ({}) should match field transform count ({})",
                server_results.len(),
                self.field_transforms.len()
            )
        })?;
        Ok(self
            .field_transforms
            .iter()
            .zip(server_results)
            .map(|(transform, result)| {
                let previous = doc.field(transform.field());
                let value = transform
                    .operation()
                    .apply_to_remote_document(previous, result.clone());
                (transform.field().clone(), Some(value))
            })
            .collect())
    }
}

fn patch_values(value: &MapValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.iter()
        .map(|path| (path.clone(), value.field(path).cloned()))
        .collect()
}

/// Mutation that turns the remote version of `doc` into its current local
/// state, restricted to `mask` (`None` meaning every field). Returns `None` when
/// the document has no local changes.
pub fn calculate_overlay_mutation(doc: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !doc.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if doc.is_no_document() {
            Mutation::delete(doc.key().clone())
        } else {
            Mutation::set(doc.key().clone(), doc.data().clone())
        });
    };

    let mut patch = MapValue::empty();
    let mut fields = BTreeSet::new();
    for path in mask.iter() {
        if fields.contains(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = doc.field(&path);
        // A nested field that vanished means its parent was replaced.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = doc.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        fields.insert(path);
    }

    Some(Mutation::new(
        doc.key().clone(),
        MutationKind::Patch {
            value: patch,
            mask: FieldMask::new(fields),
        },
        Precondition::None,
        Vec::new(),
    ))
}
