//! A single row: one length-carrying byte buffer per field, in schema order.

/// Owned row storage. Each cell is the field's encoded bytes; interpreting
/// them is the caller's job — the predicate VM reads them as opaque
/// operands, comparing on type-tagged byte order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    pub cells: Vec<Vec<u8>>,
}

impl Row {
    pub fn new(cells: Vec<Vec<u8>>) -> Self {
        Row { cells }
    }

    pub fn cell(&self, index: usize) -> Option<&[u8]> {
        self.cells.get(index).map(|v| v.as_slice())
    }
}
