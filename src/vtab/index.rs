//! xBestIndex negotiation.
//!
//! The engine passes one buffer holding both the planner's inputs and the
//! slots for the table's answer. Every input is copied out before the module
//! runs, and outputs are written only after it returns.

use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::provider::Sqlite3Api;
use crate::vtab::ffi::{self, element, sqlite3_index_info};

/// Cost reported when the module leaves it unset or gives a nonsensical one.
pub const DEFAULT_ESTIMATED_COST: f64 = f64::MAX;

/// Comparison operator of a planner constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    Limit,
    Offset,
    /// Overloaded function operator (`SQLITE_INDEX_CONSTRAINT_FUNCTION` and up).
    Function(u8),
    Unknown(u8),
}

impl From<u8> for IndexConstraintOp {
    fn from(code: u8) -> Self {
        match code {
            ffi::SQLITE_INDEX_CONSTRAINT_EQ => IndexConstraintOp::Eq,
            ffi::SQLITE_INDEX_CONSTRAINT_GT => IndexConstraintOp::Gt,
            ffi::SQLITE_INDEX_CONSTRAINT_LE => IndexConstraintOp::Le,
            ffi::SQLITE_INDEX_CONSTRAINT_LT => IndexConstraintOp::Lt,
            ffi::SQLITE_INDEX_CONSTRAINT_GE => IndexConstraintOp::Ge,
            ffi::SQLITE_INDEX_CONSTRAINT_MATCH => IndexConstraintOp::Match,
            ffi::SQLITE_INDEX_CONSTRAINT_LIKE => IndexConstraintOp::Like,
            ffi::SQLITE_INDEX_CONSTRAINT_GLOB => IndexConstraintOp::Glob,
            ffi::SQLITE_INDEX_CONSTRAINT_REGEXP => IndexConstraintOp::Regexp,
            ffi::SQLITE_INDEX_CONSTRAINT_NE => IndexConstraintOp::Ne,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNOT => IndexConstraintOp::IsNot,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNOTNULL => IndexConstraintOp::IsNotNull,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNULL => IndexConstraintOp::IsNull,
            ffi::SQLITE_INDEX_CONSTRAINT_IS => IndexConstraintOp::Is,
            ffi::SQLITE_INDEX_CONSTRAINT_LIMIT => IndexConstraintOp::Limit,
            ffi::SQLITE_INDEX_CONSTRAINT_OFFSET => IndexConstraintOp::Offset,
            c if c >= ffi::SQLITE_INDEX_CONSTRAINT_FUNCTION => IndexConstraintOp::Function(c),
            c => IndexConstraintOp::Unknown(c),
        }
    }
}

/// One WHERE term offered by the planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Column index; -1 is the rowid.
    pub column: i32,
    pub op: IndexConstraintOp,
    pub usable: bool,
}

/// One ORDER BY term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOrderBy {
    pub column: i32,
    pub desc: bool,
}

/// What the table does with one constraint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConstraintUsage {
    /// 0-based slot in xFilter's argument list, or `None` to leave the value out.
    pub argv_index: Option<usize>,
    /// The engine may skip re-checking the constraint.
    pub omit: bool,
}

/// Inputs and outputs of one xBestIndex call.
///
/// Outputs start zeroed: no constraint used, `idx_num` 0, no cost.
#[derive(Clone, Debug)]
pub struct IndexInfo {
    constraints: Vec<IndexConstraint>,
    order_bys: Vec<IndexOrderBy>,
    col_used: Option<u64>,
    collations: Vec<Option<String>>,
    usages: Vec<ConstraintUsage>,
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: Option<f64>,
    /// Left to the engine's default when `None`.
    pub estimated_rows: Option<i64>,
    /// Promise that at most one row matches.
    pub unique_scan: bool,
}

impl IndexInfo {
    pub fn new(constraints: Vec<IndexConstraint>, order_bys: Vec<IndexOrderBy>) -> Self {
        let usages = vec![ConstraintUsage::default(); constraints.len()];
        let collations = vec![None; constraints.len()];
        Self {
            constraints,
            order_bys,
            col_used: None,
            collations,
            usages,
            idx_num: 0,
            idx_str: None,
            order_by_consumed: false,
            estimated_cost: None,
            estimated_rows: None,
            unique_scan: false,
        }
    }

    pub fn constraints(&self) -> &[IndexConstraint] {
        &self.constraints
    }

    pub fn order_bys(&self) -> &[IndexOrderBy] {
        &self.order_bys
    }

    /// Bitmask of columns the statement reads; `None` on engines older than 3.10.0.
    pub fn col_used(&self) -> Option<u64> {
        self.col_used
    }

    /// Collation the engine compares constraint `i` under, e.g. `BINARY` or
    /// `NOCASE`. `None` when the engine is older than 3.22.0 or the backend
    /// cannot report it.
    pub fn collation(&self, i: usize) -> Option<&str> {
        self.collations.get(i)?.as_deref()
    }

    pub fn constraint_usages(&self) -> &[ConstraintUsage] {
        &self.usages
    }

    /// One usage slot per constraint, in constraint order.
    pub fn constraint_usages_mut(&mut self) -> &mut [ConstraintUsage] {
        &mut self.usages
    }

    pub fn set_estimated_cost(&mut self, cost: f64) {
        self.estimated_cost = Some(cost);
    }

    /// The cost that will reach the engine.
    pub fn effective_cost(&self) -> f64 {
        match self.estimated_cost {
            Some(cost) if cost.is_finite() && cost >= 0.0 => cost,
            _ => DEFAULT_ESTIMATED_COST,
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for (i, usage) in self.usages.iter().enumerate() {
            let Some(slot) = usage.argv_index else {
                continue;
            };
            if !self.constraints[i].usable {
                return Err(Error::misuse(format!(
                    "constraint {} is not usable but was assigned argument {}",
                    i, slot
                )));
            }
            if seen.contains(&slot) {
                return Err(Error::misuse(format!(
                    "argument {} assigned to more than one constraint",
                    slot
                )));
            }
            seen.push(slot);
        }
        Ok(())
    }
}

/// Copy every planner input out of the envelope.
///
/// # Safety
/// `info` must be the envelope the engine passed to xBestIndex, laid out for
/// the engine version `api` reports.
pub(crate) unsafe fn read_index_info<P: Sqlite3Api>(
    api: &P,
    info: *mut sqlite3_index_info,
) -> IndexInfo {
    let version = api.api_version();
    let n_constraint = unsafe { (*info).n_constraint }.max(0) as usize;
    let a_constraint = unsafe { (*info).a_constraint };
    let mut constraints = Vec::with_capacity(n_constraint);
    if n_constraint > 0 && !a_constraint.is_null() {
        for i in 0..n_constraint {
            let raw = unsafe { *element(a_constraint, i) };
            constraints.push(IndexConstraint {
                column: raw.i_column,
                op: IndexConstraintOp::from(raw.op),
                usable: raw.usable != 0,
            });
        }
    }

    let n_order_by = unsafe { (*info).n_order_by }.max(0) as usize;
    let a_order_by = unsafe { (*info).a_order_by };
    let mut order_bys = Vec::with_capacity(n_order_by);
    if n_order_by > 0 && !a_order_by.is_null() {
        for i in 0..n_order_by {
            let raw = unsafe { *element(a_order_by, i) };
            order_bys.push(IndexOrderBy {
                column: raw.i_column,
                desc: raw.desc != 0,
            });
        }
    }

    let mut index = IndexInfo::new(constraints, order_bys);
    if version.at_least(3, 10, 0) {
        index.col_used = Some(unsafe { (*info).col_used });
    }
    if version.at_least(3, 22, 0) {
        if let Some(envelope) = NonNull::new(info) {
            for (i, slot) in index.collations.iter_mut().enumerate() {
                *slot = unsafe { api.vtab_collation(envelope, i) };
            }
        }
    }
    index
}

/// Write the module's answer back into the envelope.
///
/// # Safety
/// Same contract as [`read_index_info`]; must run after it.
pub(crate) unsafe fn write_index_info<P: Sqlite3Api>(
    api: &P,
    info: *mut sqlite3_index_info,
    index: &IndexInfo,
) -> Result<()> {
    index.validate()?;
    let version = api.api_version();

    let n_constraint = unsafe { (*info).n_constraint }.max(0) as usize;
    let a_usage = unsafe { (*info).a_constraint_usage };
    if n_constraint > 0 && !a_usage.is_null() {
        for (i, usage) in index.usages.iter().take(n_constraint).enumerate() {
            let slot = unsafe { &mut *element(a_usage, i) };
            slot.argv_index = match usage.argv_index {
                Some(pos) => i32::try_from(pos + 1)
                    .map_err(|_| Error::misuse(format!("argument index {} out of range", pos)))?,
                None => 0,
            };
            slot.omit = u8::from(usage.omit);
        }
    }

    unsafe {
        (*info).idx_num = index.idx_num;
        (*info).order_by_consumed = i32::from(index.order_by_consumed);
        (*info).estimated_cost = index.effective_cost();
    }

    if let Some(idx_str) = index.idx_str.as_deref() {
        let raw = unsafe { copy_to_engine(api, idx_str) }?;
        unsafe {
            (*info).idx_str = raw;
            (*info).need_to_free_idx_str = 1;
        }
    }

    if version.at_least(3, 8, 2) {
        if let Some(rows) = index.estimated_rows {
            unsafe { (*info).estimated_rows = rows };
        }
    }
    if version.at_least(3, 9, 0) && index.unique_scan {
        unsafe { (*info).idx_flags |= ffi::SQLITE_INDEX_SCAN_UNIQUE };
    }
    Ok(())
}

/// NUL-terminated copy of `text` in engine-owned memory.
pub(crate) unsafe fn copy_to_engine<P: Sqlite3Api>(api: &P, text: &str) -> Result<*mut c_char> {
    let bytes = text.as_bytes();
    let raw = unsafe { api.malloc(bytes.len() + 1) } as *mut u8;
    if raw.is_null() {
        return Err(Error::no_memory());
    }
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), raw, bytes.len());
        *raw.add(bytes.len()) = 0;
    }
    Ok(raw as *mut c_char)
}

/// Free an engine-owned string slot and store `text` in its place.
pub(crate) unsafe fn replace_engine_string<P: Sqlite3Api>(
    api: &P,
    slot: *mut *mut c_char,
    text: &str,
) {
    unsafe {
        if !(*slot).is_null() {
            api.free(*slot as *mut c_void);
        }
        *slot = copy_to_engine(api, text).unwrap_or(core::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use core::ffi::CStr;

    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorCode;
    use crate::provider::ApiVersion;
    use crate::vtab::ffi::{
        sqlite3_index_constraint, sqlite3_index_constraint_usage, sqlite3_index_orderby,
    };
    use crate::vtab::mock::MockEngine;

    struct Envelope {
        constraints: Vec<sqlite3_index_constraint>,
        order_bys: Vec<sqlite3_index_orderby>,
        usages: Vec<sqlite3_index_constraint_usage>,
        info: Box<sqlite3_index_info>,
    }

    impl Envelope {
        fn new(constraints: &[(i32, u8, bool)], order_bys: &[(i32, bool)]) -> Self {
            let mut constraints: Vec<_> = constraints
                .iter()
                .map(|&(col, op, usable)| sqlite3_index_constraint {
                    i_column: col,
                    op,
                    usable: u8::from(usable),
                    i_term_offset: 0,
                })
                .collect();
            let mut order_bys: Vec<_> = order_bys
                .iter()
                .map(|&(col, desc)| sqlite3_index_orderby {
                    i_column: col,
                    desc: u8::from(desc),
                })
                .collect();
            let mut usages = vec![
                sqlite3_index_constraint_usage {
                    argv_index: 0,
                    omit: 0
                };
                constraints.len()
            ];
            let info = Box::new(sqlite3_index_info {
                n_constraint: constraints.len() as i32,
                a_constraint: constraints.as_mut_ptr(),
                n_order_by: order_bys.len() as i32,
                a_order_by: order_bys.as_mut_ptr(),
                a_constraint_usage: usages.as_mut_ptr(),
                idx_num: 0,
                idx_str: core::ptr::null_mut(),
                need_to_free_idx_str: 0,
                order_by_consumed: 0,
                estimated_cost: 0.0,
                estimated_rows: 25,
                idx_flags: 0,
                col_used: 0b101,
            });
            Self {
                constraints,
                order_bys,
                usages,
                info,
            }
        }

        fn ptr(&mut self) -> *mut sqlite3_index_info {
            &mut *self.info
        }
    }

    #[test]
    fn reads_constraints_and_order_bys() {
        let mut env = Envelope::new(
            &[(0, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true), (1, 151, false)],
            &[(1, true)],
        );
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let index = unsafe { read_index_info(api, env.ptr()) };
        assert_eq!(
            index.constraints(),
            &[
                IndexConstraint {
                    column: 0,
                    op: IndexConstraintOp::Eq,
                    usable: true
                },
                IndexConstraint {
                    column: 1,
                    op: IndexConstraintOp::Function(151),
                    usable: false
                },
            ]
        );
        assert_eq!(
            index.order_bys(),
            &[IndexOrderBy {
                column: 1,
                desc: true
            }]
        );
        assert_eq!(index.col_used(), Some(0b101));
        assert_eq!(index.collation(0), Some("BINARY"));
        assert_eq!(index.collation(2), None);
        assert_eq!(index.constraint_usages().len(), 2);
        assert_eq!(env.constraints.len(), 2);
        assert_eq!(env.order_bys.len(), 1);
    }

    #[test]
    fn collations_follow_constraint_order() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        api.set_collation(1, "NOCASE");
        let mut env = Envelope::new(
            &[
                (0, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true),
                (1, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true),
            ],
            &[],
        );
        let index = unsafe { read_index_info(api, env.ptr()) };
        assert_eq!(index.collation(0), Some("BINARY"));
        assert_eq!(index.collation(1), Some("NOCASE"));

        let old = MockEngine::leak(ApiVersion::new(3, 21, 0));
        let index = unsafe { read_index_info(old, env.ptr()) };
        assert_eq!(index.collation(0), None);
    }

    #[test]
    fn empty_arrays_are_not_dereferenced() {
        let mut env = Envelope::new(&[], &[]);
        env.info.a_constraint = 0x10 as *mut _;
        env.info.a_order_by = 0x10 as *mut _;
        env.info.a_constraint_usage = 0x10 as *mut _;
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let index = unsafe { read_index_info(api, env.ptr()) };
        assert!(index.constraints().is_empty());
        assert!(index.order_bys().is_empty());
        unsafe { write_index_info(api, env.ptr(), &index) }.unwrap();
    }

    #[test]
    fn writes_usage_as_one_based_argv_index() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut env = Envelope::new(
            &[
                (0, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true),
                (1, ffi::SQLITE_INDEX_CONSTRAINT_GT, true),
            ],
            &[],
        );
        let mut index = unsafe { read_index_info(api, env.ptr()) };
        index.constraint_usages_mut()[1] = ConstraintUsage {
            argv_index: Some(0),
            omit: true,
        };
        index.idx_num = 9;
        index.order_by_consumed = true;
        index.set_estimated_cost(12.5);
        index.estimated_rows = Some(3);
        index.unique_scan = true;
        unsafe { write_index_info(api, env.ptr(), &index) }.unwrap();

        assert_eq!(env.usages[0].argv_index, 0);
        assert_eq!(env.usages[0].omit, 0);
        assert_eq!(env.usages[1].argv_index, 1);
        assert_eq!(env.usages[1].omit, 1);
        assert_eq!(env.info.idx_num, 9);
        assert_eq!(env.info.order_by_consumed, 1);
        assert_eq!(env.info.estimated_cost, 12.5);
        assert_eq!(env.info.estimated_rows, 3);
        assert_eq!(env.info.idx_flags, ffi::SQLITE_INDEX_SCAN_UNIQUE);
        assert!(env.info.idx_str.is_null());
    }

    #[test]
    fn idx_str_is_copied_into_engine_memory() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut env = Envelope::new(&[], &[]);
        let mut index = unsafe { read_index_info(api, env.ptr()) };
        index.idx_str = Some("by-name".to_owned());
        unsafe { write_index_info(api, env.ptr(), &index) }.unwrap();
        assert_eq!(env.info.need_to_free_idx_str, 1);
        let text = unsafe { CStr::from_ptr(env.info.idx_str) };
        assert_eq!(text.to_str().unwrap(), "by-name");
        assert_eq!(api.live_allocations(), 1);
        unsafe { api.free(env.info.idx_str as *mut c_void) };
        assert_eq!(api.live_allocations(), 0);
    }

    #[test]
    fn unset_cost_becomes_maximum() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut env = Envelope::new(&[], &[]);
        let index = unsafe { read_index_info(api, env.ptr()) };
        unsafe { write_index_info(api, env.ptr(), &index) }.unwrap();
        assert_eq!(env.info.estimated_cost, f64::MAX);
        // Unset estimated rows keep the engine's value.
        assert_eq!(env.info.estimated_rows, 25);
    }

    #[test]
    fn old_engine_fields_are_left_alone() {
        let api = MockEngine::leak(ApiVersion::new(3, 8, 0));
        // 72 bytes of envelope followed by words an old engine never allocated.
        let mut words = [u64::MAX; 12];
        let info = words.as_mut_ptr() as *mut sqlite3_index_info;
        unsafe {
            (*info).n_constraint = 0;
            (*info).a_constraint = core::ptr::null_mut();
            (*info).n_order_by = 0;
            (*info).a_order_by = core::ptr::null_mut();
            (*info).a_constraint_usage = core::ptr::null_mut();
            (*info).idx_str = core::ptr::null_mut();
        }
        let mut index = unsafe { read_index_info(api, info) };
        assert_eq!(index.col_used(), None);
        index.estimated_rows = Some(1);
        index.unique_scan = true;
        unsafe { write_index_info(api, info, &index) }.unwrap();
        assert_eq!(&words[9..], &[u64::MAX; 3]);
    }

    #[test]
    fn usage_on_unusable_constraint_is_rejected() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut env = Envelope::new(&[(0, ffi::SQLITE_INDEX_CONSTRAINT_EQ, false)], &[]);
        let mut index = unsafe { read_index_info(api, env.ptr()) };
        index.constraint_usages_mut()[0].argv_index = Some(0);
        let err = unsafe { write_index_info(api, env.ptr(), &index) }.unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
        assert_eq!(env.usages[0].argv_index, 0);
    }

    #[test]
    fn duplicate_argument_slot_is_rejected() {
        let api = MockEngine::leak(ApiVersion::new(3, 45, 0));
        let mut env = Envelope::new(
            &[
                (0, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true),
                (1, ffi::SQLITE_INDEX_CONSTRAINT_EQ, true),
            ],
            &[],
        );
        let mut index = unsafe { read_index_info(api, env.ptr()) };
        index.constraint_usages_mut()[0].argv_index = Some(0);
        index.constraint_usages_mut()[1].argv_index = Some(0);
        let err = unsafe { write_index_info(api, env.ptr(), &index) }.unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
    }

    #[test]
    fn operator_codes() {
        assert_eq!(IndexConstraintOp::from(2), IndexConstraintOp::Eq);
        assert_eq!(IndexConstraintOp::from(72), IndexConstraintOp::Is);
        assert_eq!(IndexConstraintOp::from(74), IndexConstraintOp::Offset);
        assert_eq!(IndexConstraintOp::from(3), IndexConstraintOp::Unknown(3));
        assert_eq!(IndexConstraintOp::from(150), IndexConstraintOp::Function(150));
    }

    proptest! {
        #[test]
        fn reported_cost_is_finite_and_non_negative(cost in proptest::option::of(any::<f64>())) {
            let mut index = IndexInfo::new(Vec::new(), Vec::new());
            index.estimated_cost = cost;
            let reported = index.effective_cost();
            prop_assert!(reported.is_finite());
            prop_assert!(reported >= 0.0);
            if let Some(c) = cost {
                if c.is_finite() && c >= 0.0 {
                    prop_assert_eq!(reported, c);
                }
            }
        }
    }
}
