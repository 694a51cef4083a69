//! Typed comparators and conjunctions of them.

use super::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

/// A typed binary predicate over `(leftTuple + lOffset, rightTuple +
/// rOffset)`, comparing `size` bytes interpreted per `col_type`.
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    l_offset: usize,
    r_offset: usize,
    col_type: ColumnType,
    op: CompareOp,
}

macro_rules! read_at {
    ($ty:ty, $ptr:expr, $off:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        std::ptr::copy_nonoverlapping($ptr.add($off), buf.as_mut_ptr(), buf.len());
        <$ty>::from_ne_bytes(buf)
    }};
}

impl Comparator {
    pub fn new(l_offset: usize, r_offset: usize, col_type: ColumnType, op: CompareOp) -> Self {
        Self { l_offset, r_offset, col_type, op }
    }

    /// # Safety
    /// `left`/`right` must be valid tuples with this comparator's column
    /// present at the configured offsets.
    pub unsafe fn eval(&self, left: *const u8, right: *const u8) -> bool {
        let ord = match self.col_type {
            ColumnType::Integer => {
                let l: i32 = read_at!(i32, left, self.l_offset);
                let r: i32 = read_at!(i32, right, self.r_offset);
                l.partial_cmp(&r)
            }
            ColumnType::Long | ColumnType::Date => {
                let l: i64 = read_at!(i64, left, self.l_offset);
                let r: i64 = read_at!(i64, right, self.r_offset);
                l.partial_cmp(&r)
            }
            ColumnType::Decimal => {
                let l: f64 = read_at!(f64, left, self.l_offset);
                let r: f64 = read_at!(f64, right, self.r_offset);
                l.partial_cmp(&r)
            }
            ColumnType::Pointer => {
                let l: usize = read_at!(usize, left, self.l_offset);
                let r: usize = read_at!(usize, right, self.r_offset);
                l.partial_cmp(&r)
            }
            ColumnType::Char(n) => {
                let n = n as usize;
                let l = std::slice::from_raw_parts(left.add(self.l_offset), n);
                let r = std::slice::from_raw_parts(right.add(self.r_offset), n);
                return match self.op {
                    CompareOp::Eq => l == r,
                    CompareOp::Ne => l != r,
                    CompareOp::Lt => l < r,
                    CompareOp::Le => l <= r,
                    CompareOp::Ge => l >= r,
                    CompareOp::Gt => l > r,
                };
            }
        };
        let Some(ord) = ord else { return false };
        match self.op {
            CompareOp::Lt => ord.is_lt(),
            CompareOp::Le => ord.is_le(),
            CompareOp::Eq => ord.is_eq(),
            CompareOp::Ne => ord.is_ne(),
            CompareOp::Ge => ord.is_ge(),
            CompareOp::Gt => ord.is_gt(),
        }
    }
}

/// A vector of comparators over corresponding column pairs, evaluated
/// conjunctively with short-circuit on the first false. An empty
/// conjunction is true by definition -- required for aggregation with no
/// GROUP BY key.
#[derive(Debug, Clone, Default)]
pub struct ConjunctionEvaluator {
    comparators: Vec<Comparator>,
}

impl ConjunctionEvaluator {
    pub fn new(comparators: Vec<Comparator>) -> Self {
        Self { comparators }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// # Safety
    /// `left`/`right` must be valid tuples for every comparator's offsets.
    pub unsafe fn eval(&self, left: *const u8, right: *const u8) -> bool {
        self.comparators.iter().all(|c| c.eval(left, right))
    }
}

/// A `ConjunctionEvaluator` specialized so every comparator is equality;
/// used to match group keys in `GenericAggregate`.
#[derive(Debug, Clone, Default)]
pub struct ConjunctionEqualsEvaluator {
    inner: ConjunctionEvaluator,
}

impl ConjunctionEqualsEvaluator {
    pub fn new(pairs: Vec<(usize, usize, ColumnType)>) -> Self {
        let comparators = pairs
            .into_iter()
            .map(|(l, r, t)| Comparator::new(l, r, t, CompareOp::Eq))
            .collect();
        Self { inner: ConjunctionEvaluator::new(comparators) }
    }

    /// # Safety
    /// See [`ConjunctionEvaluator::eval`].
    pub unsafe fn eval(&self, left: *const u8, right: *const u8) -> bool {
        self.inner.eval(left, right)
    }
}
