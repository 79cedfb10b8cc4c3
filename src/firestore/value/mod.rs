mod array_value;
mod bytes_value;
mod map_value;
pub mod order;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use order::{canonical_id, compare_values, estimate_byte_size, type_order, values_equal};
pub use value::{FirestoreValue, ValueKind};
