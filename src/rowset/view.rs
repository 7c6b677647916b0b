//! Lazy, server-side query materialisation.

use std::sync::{Arc, Mutex};

use super::predicate::Program;
use super::row::Row;
use super::rowset::RowSet;
use super::table::Table;

/// A lazily-fetched query result: a source rowset, a projected table, a
/// field mask, and an optional filter predicate. Held behind `Arc`, so
/// there's no separate refcount field — `Arc::strong_count` is it.
pub struct View {
    source: Arc<RowSet>,
    projected: Table,
    field_mask: Vec<bool>,
    filter: Option<Program>,
    cursor: Mutex<usize>,
}

impl View {
    pub fn new(source: Arc<RowSet>, field_mask: Vec<bool>, filter: Option<Program>) -> Self {
        let projected = source.table().slice(&field_mask);
        View { source, projected, field_mask, filter, cursor: Mutex::new(0) }
    }

    pub fn desc(&self) -> &Table {
        &self.projected
    }

    /// The next `RowSet` of at most `count` rows, advancing the cursor. An
    /// empty return (an empty but non-error `RowSet`) signals end-of-view.
    pub fn fetch(&self, count: usize) -> crate::error::MdvResult<RowSet> {
        let mut out = RowSet::new(Arc::new(self.projected.clone()));
        let mut cursor = self.cursor.lock().unwrap();
        let rows = self.source.rows();

        while out.len() < count && *cursor < rows.len() {
            let row = &rows[*cursor];
            *cursor += 1;
            if let Some(filter) = &self.filter {
                if !filter.eval(row)? {
                    continue;
                }
            }
            out.emplace(project(row, &self.field_mask));
        }

        Ok(out)
    }
}

fn project(row: &Row, mask: &[bool]) -> Row {
    let cells = row
        .cells
        .iter()
        .zip(mask.iter().chain(std::iter::repeat(&false)))
        .filter(|(_, keep)| **keep)
        .map(|(c, _)| c.clone())
        .collect();
    Row::new(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StorageId;
    use crate::rowset::predicate::{compile, Program};
    use crate::rowset::table::Field;

    fn fixture() -> Arc<RowSet> {
        let table = Arc::new(Table::new(
            StorageId::generate(),
            vec![
                Field { name: "id".into(), field_type: 1, array_limit: 1 },
                Field { name: "name".into(), field_type: 2, array_limit: 1 },
            ],
        ));
        let mut rs = RowSet::new(table);
        rs.append(&[
            Row::new(vec![b"1".to_vec(), b"alice".to_vec()]),
            Row::new(vec![b"2".to_vec(), b"bob".to_vec()]),
            Row::new(vec![b"3".to_vec(), b"carol".to_vec()]),
        ]);
        Arc::new(rs)
    }

    #[test]
    fn fetch_paginates_and_signals_end() {
        let source = fixture();
        let view = View::new(source, vec![true, true], None);
        let page1 = view.fetch(2).unwrap();
        assert_eq!(page1.len(), 2);
        let page2 = view.fetch(2).unwrap();
        assert_eq!(page2.len(), 1);
        let page3 = view.fetch(2).unwrap();
        assert!(page3.is_empty());
    }

    #[test]
    fn projection_drops_unselected_fields() {
        let source = fixture();
        let view = View::new(source, vec![false, true], None);
        assert_eq!(view.desc().fields.len(), 1);
        let page = view.fetch(10).unwrap();
        assert_eq!(page.rows()[0].cells.len(), 1);
    }

    #[test]
    fn post_scan_filter_skips_non_matching_rows() {
        let source = fixture();
        let table = source.table().clone();
        let filter: Program = compile("name = 'bob'", &table).unwrap();
        let view = View::new(source, vec![true, true], Some(filter));
        let page = view.fetch(10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.rows()[0].cells[1], b"bob".to_vec());
    }
}
