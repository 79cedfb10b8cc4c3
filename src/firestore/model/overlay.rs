use crate::firestore::model::{DocumentKey, Mutation};

/// Net effect of all pending batches on one document, tagged with the highest
/// batch id it summarizes.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
