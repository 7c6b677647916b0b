//! Table schema.

use serde::{Deserialize, Serialize};

use crate::ids::StorageId;

/// `array_limit == 1` ⇒ scalar, `> 1` ⇒ bounded array of that many elements,
/// `0` ⇒ unbounded array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: u32,
    pub array_limit: u32,
}

/// An immutable field list identified by a storage UUID. Created once per
/// table and shared behind `Arc` from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub uuid: StorageId,
    pub fields: Vec<Field>,
}

impl Table {
    pub fn new(uuid: StorageId, fields: Vec<Field>) -> Self {
        Table { uuid, fields }
    }

    /// A new `Table` over the same uuid containing only the fields selected
    /// by `field_mask`, preserving field order. `field_mask.len()` must not
    /// exceed `self.fields.len()`.
    pub fn slice(&self, field_mask: &[bool]) -> Table {
        let fields = self
            .fields
            .iter()
            .zip(field_mask.iter().chain(std::iter::repeat(&false)))
            .filter(|(_, keep)| **keep)
            .map(|(f, _)| f.clone())
            .collect();
        Table { uuid: self.uuid, fields }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(
            StorageId::generate(),
            vec![
                Field { name: "id".into(), field_type: 1, array_limit: 1 },
                Field { name: "name".into(), field_type: 2, array_limit: 1 },
                Field { name: "tags".into(), field_type: 2, array_limit: 0 },
            ],
        )
    }

    #[test]
    fn slice_preserves_order_and_drops_unselected() {
        let t = table();
        let sliced = t.slice(&[true, false, true]);
        assert_eq!(sliced.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["id", "tags"]);
    }

    #[test]
    fn slice_keeps_the_same_uuid() {
        let t = table();
        let sliced = t.slice(&[true, true, true]);
        assert_eq!(sliced.uuid, t.uuid);
    }
}
