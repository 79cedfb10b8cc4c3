use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == value)
    }

    /// Appends every element not already present.
    pub fn union_with(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|existing| existing == element) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|existing| !elements.iter().any(|element| element == *existing))
            .cloned()
            .collect();
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_skips_existing_elements() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1)]);
        let merged = array.union_with(&[
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_integer(2),
        ]);
        assert_eq!(
            merged.values(),
            &[FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]
        );
    }

    #[test]
    fn remove_drops_all_occurrences() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
            FirestoreValue::from_string("a"),
        ]);
        let trimmed = array.remove_all(&[FirestoreValue::from_string("a")]);
        assert_eq!(trimmed.values(), &[FirestoreValue::from_string("b")]);
    }
}
