//! Read-only virtual table over rows produced by a closure.
//!
//! ```text
//! let host = ModuleHost::new(api, "fruit", EnumerableModule::new(
//!     vec!["name".into(), "qty".into()],
//!     || vec![vec!["apple".into(), 3i64.into()]],
//! ));
//! conn.create_module(&Arc::new(host))?;
//! conn.execute("CREATE VIRTUAL TABLE f USING fruit")?;
//! ```

use core::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, ErrorCode, Result};
use crate::provider::Sqlite3Api;
use crate::value::{SqlValue, Value};
use crate::vtab::{
    escape_double_quote, IndexConstraintOp, IndexInfo, Module, ModuleArgs, TableDeclaration,
    VirtualTable, VirtualTableCursor,
};

type RowSource = dyn Fn() -> Vec<Vec<Value>> + Send + Sync;

/// Column that identifies the row ordinal in index strings.
const ROWID_COLUMN: i32 = -1;

/// Serves a fixed column list; `rowid` is the 1-based row ordinal.
pub struct EnumerableModule {
    columns: Vec<String>,
    rows: Box<RowSource>,
    sorted_by: Option<(usize, bool)>,
}

impl EnumerableModule {
    pub fn new(
        columns: Vec<String>,
        rows: impl Fn() -> Vec<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            columns,
            rows: Box::new(rows),
            sorted_by: None,
        }
    }

    /// Serve rows ordered by `column` so the planner can skip its own sort.
    pub fn sorted_by(mut self, column: usize, desc: bool) -> Self {
        self.sorted_by = Some((column, desc));
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `CREATE TABLE` statement handed to the declaration service.
    pub fn schema(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", escape_double_quote(c)))
            .collect();
        format!("CREATE TABLE x({})", columns.join(", "))
    }

    fn load(&self) -> Result<EnumerableTable> {
        let mut rows = (self.rows)();
        if let Some(bad) = rows.iter().position(|r| r.len() != self.columns.len()) {
            return Err(Error::with_message(
                ErrorCode::Mismatch,
                format!(
                    "row {} has {} values, expected {}",
                    bad,
                    rows[bad].len(),
                    self.columns.len()
                ),
            ));
        }
        if let Some((column, desc)) = self.sorted_by {
            rows.sort_by(|a, b| {
                let ord = compare(&a[column], &b[column]);
                if desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        Ok(EnumerableTable {
            rows: Arc::new(rows),
        })
    }
}

/// Snapshot of the source rows taken when the table was attached.
pub struct EnumerableTable {
    rows: Arc<Vec<Vec<Value>>>,
}

impl EnumerableTable {
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }
}

/// Position within the rows matching the last filter.
#[derive(Default)]
pub struct EnumerableCursor {
    matches: Vec<usize>,
    pos: usize,
    filtered: bool,
}

impl EnumerableCursor {
    fn current(&self) -> Result<usize> {
        match self.matches.get(self.pos) {
            Some(row) if self.filtered => Ok(*row),
            _ => Err(Error::misuse("cursor is not positioned on a row")),
        }
    }
}

/// SQLite's cross-type ordering: NULL, numbers, text, blobs.
fn compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => a
            .to_f64()
            .partial_cmp(&b.to_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Only `BINARY` matches what `compare` does; other collations stay with the engine.
fn compares_binary(index: &IndexInfo, constraint: usize) -> bool {
    index
        .collation(constraint)
        .is_some_and(|name| name.eq_ignore_ascii_case("BINARY"))
}

fn encode_columns(columns: &[i32]) -> String {
    columns
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_columns(idx_str: Option<&str>) -> Result<Vec<i32>> {
    match idx_str {
        None | Some("") => Ok(Vec::new()),
        Some(s) => s
            .split(',')
            .map(|c| {
                c.parse()
                    .map_err(|_| Error::internal(format!("malformed index string {:?}", s)))
            })
            .collect(),
    }
}

impl<P: Sqlite3Api> Module<P> for EnumerableModule {
    type Table = EnumerableTable;
    type Cursor = EnumerableCursor;

    fn create(&self, decl: &TableDeclaration<'_, P>, args: &ModuleArgs) -> Result<EnumerableTable> {
        decl.declare(&self.schema())?;
        let table = self.load()?;
        debug!(
            target: "sqlite_vtab",
            table = %args.table_name,
            rows = table.rows.len(),
            "enumerable table loaded"
        );
        Ok(table)
    }

    fn best_index(&self, table: &VirtualTable<EnumerableTable>, index: &mut IndexInfo) -> Result<()> {
        let n_columns = self.columns.len() as i32;
        let mut used = Vec::new();
        let mut next_arg = 0;
        let usable: Vec<(usize, i32)> = index
            .constraints()
            .iter()
            .enumerate()
            .filter(|(i, c)| {
                c.usable
                    && c.op == IndexConstraintOp::Eq
                    && (c.column == ROWID_COLUMN
                        || ((0..n_columns).contains(&c.column) && compares_binary(index, *i)))
            })
            .map(|(i, c)| (i, c.column))
            .collect();
        for (i, column) in usable {
            let usage = &mut index.constraint_usages_mut()[i];
            usage.argv_index = Some(next_arg);
            usage.omit = true;
            next_arg += 1;
            used.push(column);
        }

        let total = table.rows.len().max(1) as f64;
        if used.is_empty() {
            index.idx_num = 0;
            index.set_estimated_cost(total);
            index.estimated_rows = Some(table.rows.len() as i64);
        } else {
            index.idx_num = used.len() as i32;
            index.idx_str = Some(encode_columns(&used));
            index.set_estimated_cost((total / 10.0).max(1.0));
            index.estimated_rows = Some(1);
            index.unique_scan = used.contains(&ROWID_COLUMN);
        }

        let presorted = match (self.sorted_by, index.order_bys()) {
            (Some((column, desc)), [order]) => order.column == column as i32 && order.desc == desc,
            _ => false,
        };
        index.order_by_consumed = presorted;
        Ok(())
    }

    fn open(&self, _table: &VirtualTable<EnumerableTable>) -> Result<EnumerableCursor> {
        Ok(EnumerableCursor::default())
    }

    fn filter(
        &self,
        cursor: &mut VirtualTableCursor<EnumerableTable, EnumerableCursor>,
        _idx_num: i32,
        idx_str: Option<&str>,
        args: &[SqlValue<'_, P>],
    ) -> Result<()> {
        let columns = decode_columns(idx_str)?;
        if columns.len() != args.len() {
            return Err(Error::internal(format!(
                "filter expected {} arguments, got {}",
                columns.len(),
                args.len()
            )));
        }
        let wanted: Vec<(i32, Value)> = columns
            .into_iter()
            .zip(args.iter().map(SqlValue::persist))
            .collect();
        let rows = Arc::clone(&cursor.table().rows);
        let matches = rows
            .iter()
            .enumerate()
            .filter(|(ordinal, row)| {
                wanted.iter().all(|(column, value)| {
                    let cell = if *column == ROWID_COLUMN {
                        Value::Integer(*ordinal as i64 + 1)
                    } else {
                        row[*column as usize].clone()
                    };
                    !matches!(value, Value::Null) && compare(&cell, value) == Ordering::Equal
                })
            })
            .map(|(ordinal, _)| ordinal)
            .collect();
        let state = cursor.state_mut();
        state.matches = matches;
        state.pos = 0;
        state.filtered = true;
        Ok(())
    }

    fn next(&self, cursor: &mut VirtualTableCursor<EnumerableTable, EnumerableCursor>) -> Result<()> {
        let state = cursor.state_mut();
        if state.pos < state.matches.len() {
            state.pos += 1;
        }
        Ok(())
    }

    fn eof(&self, cursor: &VirtualTableCursor<EnumerableTable, EnumerableCursor>) -> bool {
        cursor.filtered && cursor.pos >= cursor.matches.len()
    }

    fn column(
        &self,
        cursor: &VirtualTableCursor<EnumerableTable, EnumerableCursor>,
        ctx: &Context<'_, P>,
        col: i32,
    ) -> Result<()> {
        let row = cursor.current()?;
        let value = usize::try_from(col)
            .ok()
            .and_then(|c| cursor.table().rows[row].get(c))
            .ok_or_else(|| Error::with_message(ErrorCode::Range, format!("no column {}", col)))?;
        ctx.set_value(value)
    }

    fn rowid(&self, cursor: &VirtualTableCursor<EnumerableTable, EnumerableCursor>) -> Result<i64> {
        Ok(cursor.current()? as i64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use core::cmp::Ordering;

    use super::{compare, decode_columns, encode_columns, EnumerableModule};
    use crate::value::Value;

    #[test]
    fn schema_quotes_column_names() {
        let module = EnumerableModule::new(vec!["a".into(), "we\"ird".into()], Vec::new);
        assert_eq!(module.schema(), "CREATE TABLE x(\"a\", \"we\"\"ird\")");
    }

    #[test]
    fn index_string_round_trip() {
        assert_eq!(decode_columns(Some(&encode_columns(&[0, -1, 2]))).unwrap(), vec![0, -1, 2]);
        assert!(decode_columns(None).unwrap().is_empty());
        assert!(decode_columns(Some("x")).is_err());
    }

    #[test]
    fn cross_type_ordering() {
        assert_eq!(compare(&Value::Null, &Value::Integer(0)), Ordering::Less);
        assert_eq!(compare(&Value::Integer(2), &Value::Float(2.0)), Ordering::Equal);
        assert_eq!(compare(&Value::Float(9.5), &Value::Text("a".into())), Ordering::Less);
        assert_eq!(
            compare(&Value::Text("b".into()), &Value::Text("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let module = EnumerableModule::new(vec!["a".into(), "b".into()], || {
            vec![vec![Value::Integer(1)]]
        });
        assert!(module.load().is_err());
    }

    #[test]
    fn declared_sort_orders_snapshot() {
        let module = EnumerableModule::new(vec!["n".into()], || {
            vec![
                vec![Value::Integer(2)],
                vec![Value::Integer(3)],
                vec![Value::Integer(1)],
            ]
        })
        .sorted_by(0, true);
        let table = module.load().unwrap();
        let values: Vec<i64> = table.rows().iter().map(|r| r[0].to_i64()).collect();
        assert_eq!(values, vec![3, 2, 1]);
    }
}
