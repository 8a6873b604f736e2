//! Predicate tree nodes consumed by the evaluator. The parser/planner that
//! builds these lives outside this crate; here they are plain data.

use std::fmt;

/// Comparison operator. `None` leaves the corresponding side unbounded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    None,
}

impl Op {
    /// Evaluates `a op b` in the double domain.
    pub fn holds(self, a: f64, b: f64) -> bool {
        match self {
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
            Op::Eq => a == b,
            Op::None => true,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
            Op::None => "",
        };
        write!(f, "{}", s)
    }
}

/// One side of a normalized interval in the double domain.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Bound {
    Unbounded,
    Incl(f64),
    Excl(f64),
}

impl Bound {
    fn tighter_lo(self, other: Bound) -> Bound {
        match (self, other) {
            (Bound::Unbounded, b) => b,
            (a, Bound::Unbounded) => a,
            (a, b) => {
                let (av, bv) = (a.value(), b.value());
                if av > bv {
                    a
                } else if bv > av {
                    b
                } else if matches!(a, Bound::Excl(_)) {
                    a
                } else {
                    b
                }
            }
        }
    }

    fn tighter_hi(self, other: Bound) -> Bound {
        match (self, other) {
            (Bound::Unbounded, b) => b,
            (a, Bound::Unbounded) => a,
            (a, b) => {
                let (av, bv) = (a.value(), b.value());
                if av < bv {
                    a
                } else if bv < av {
                    b
                } else if matches!(a, Bound::Excl(_)) {
                    a
                } else {
                    b
                }
            }
        }
    }

    fn value(self) -> f64 {
        match self {
            Bound::Incl(v) | Bound::Excl(v) => v,
            Bound::Unbounded => f64::NAN,
        }
    }
}

/// Continuous range over one column: `left left_op column` and
/// `column right_op right`.
#[derive(Clone, PartialEq, Debug)]
pub struct RangePred {
    pub column: String,
    pub left: f64,
    pub left_op: Op,
    pub right_op: Op,
    pub right: f64,
}

impl RangePred {
    pub fn new(column: &str, left: f64, left_op: Op, right_op: Op, right: f64) -> RangePred {
        RangePred {
            column: column.to_string(),
            left,
            left_op,
            right_op,
            right,
        }
    }

    /// `lo <= column <= hi`
    pub fn between(column: &str, lo: f64, hi: f64) -> RangePred {
        RangePred::new(column, lo, Op::Le, Op::Le, hi)
    }

    /// `lo <= column < hi`
    pub fn half_open(column: &str, lo: f64, hi: f64) -> RangePred {
        RangePred::new(column, lo, Op::Le, Op::Lt, hi)
    }

    /// `column == v`
    pub fn equals(column: &str, v: f64) -> RangePred {
        RangePred::new(column, 0.0, Op::None, Op::Eq, v)
    }

    /// `column > lo`
    pub fn greater_than(column: &str, lo: f64) -> RangePred {
        RangePred::new(column, lo, Op::Lt, Op::None, 0.0)
    }

    /// Normalized double-domain interval `(lo, hi)` equivalent to the
    /// conjunction of both sides.
    pub fn interval(&self) -> (Bound, Bound) {
        let mut lo = Bound::Unbounded;
        let mut hi = Bound::Unbounded;
        // left side: left op column
        match self.left_op {
            Op::Lt => lo = lo.tighter_lo(Bound::Excl(self.left)),
            Op::Le => lo = lo.tighter_lo(Bound::Incl(self.left)),
            Op::Gt => hi = hi.tighter_hi(Bound::Excl(self.left)),
            Op::Ge => hi = hi.tighter_hi(Bound::Incl(self.left)),
            Op::Eq => {
                lo = lo.tighter_lo(Bound::Incl(self.left));
                hi = hi.tighter_hi(Bound::Incl(self.left));
            }
            Op::None => {}
        }
        // right side: column op right
        match self.right_op {
            Op::Lt => hi = hi.tighter_hi(Bound::Excl(self.right)),
            Op::Le => hi = hi.tighter_hi(Bound::Incl(self.right)),
            Op::Gt => lo = lo.tighter_lo(Bound::Excl(self.right)),
            Op::Ge => lo = lo.tighter_lo(Bound::Incl(self.right)),
            Op::Eq => {
                lo = lo.tighter_lo(Bound::Incl(self.right));
                hi = hi.tighter_hi(Bound::Incl(self.right));
            }
            Op::None => {}
        }
        (lo, hi)
    }

    /// True when the interval excludes every value, independent of type.
    pub fn is_contradiction(&self) -> bool {
        match self.interval() {
            (Bound::Incl(a), Bound::Incl(b)) => a > b || a.is_nan() || b.is_nan(),
            (Bound::Incl(a) | Bound::Excl(a), Bound::Incl(b) | Bound::Excl(b)) => {
                a >= b || a.is_nan() || b.is_nan()
            }
            _ => false,
        }
    }

    /// True when the interval contains every value of `[min, max]`.
    pub fn covers(&self, min: f64, max: f64) -> bool {
        let (lo, hi) = self.interval();
        let lo_ok = match lo {
            Bound::Unbounded => true,
            Bound::Incl(b) => b <= min,
            Bound::Excl(b) => b < min,
        };
        let hi_ok = match hi {
            Bound::Unbounded => true,
            Bound::Incl(b) => b >= max,
            Bound::Excl(b) => b > max,
        };
        lo_ok && hi_ok
    }

    /// True when the interval is disjoint from `[min, max]`.
    pub fn disjoint_from(&self, min: f64, max: f64) -> bool {
        let (lo, hi) = self.interval();
        let above = match lo {
            Bound::Incl(b) => b > max,
            Bound::Excl(b) => b >= max,
            Bound::Unbounded => false,
        };
        let below = match hi {
            Bound::Incl(b) => b < min,
            Bound::Excl(b) => b <= min,
            Bound::Unbounded => false,
        };
        above || below
    }
}

impl fmt::Display for RangePred {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.left_op != Op::None {
            write!(f, "{} {} ", self.left, self.left_op)?;
        }
        write!(f, "{}", self.column)?;
        if self.right_op != Op::None {
            write!(f, " {} {}", self.right_op, self.right)?;
        }
        Ok(())
    }
}

/// Membership in an explicit value set.
#[derive(Clone, PartialEq, Debug)]
pub struct DiscretePred {
    pub column: String,
    pub values: Vec<f64>,
}

impl DiscretePred {
    pub fn new(column: &str, mut values: Vec<f64>) -> DiscretePred {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        DiscretePred {
            column: column.to_string(),
            values,
        }
    }
}

/// String equality; one literal names a column, the other the value.
#[derive(Clone, PartialEq, Debug)]
pub struct StringPred {
    pub left: String,
    pub right: String,
}

impl StringPred {
    pub fn new(left: &str, right: &str) -> StringPred {
        StringPred {
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

/// Matches rows where any column whose name starts with `prefix`
/// (case-insensitive) takes any of `values`.
#[derive(Clone, PartialEq, Debug)]
pub struct AnyAnyPred {
    pub prefix: String,
    pub values: Vec<f64>,
}

impl AnyAnyPred {
    pub fn new(prefix: &str, values: Vec<f64>) -> AnyAnyPred {
        AnyAnyPred {
            prefix: prefix.to_string(),
            values,
        }
    }
}

/// Named bag of per-row variables feeding a multi-column arithmetic
/// predicate one row at a time.
#[derive(Clone, Debug, Default)]
pub struct Barrel {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Barrel {
    pub fn new(names: Vec<String>) -> Barrel {
        let values = vec![0.0; names.len()];
        Barrel { names, values }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn set(&mut self, slot: usize, value: f64) {
        self.values[slot] = value;
    }

    pub fn get(&self, name: &str) -> f64 {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|i| self.values[i])
            .unwrap_or(f64::NAN)
    }
}

/// Arithmetic term over column variables.
#[derive(Clone, PartialEq, Debug)]
pub enum Expr {
    Col(String),
    Const(f64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, barrel: &Barrel) -> f64 {
        match self {
            Expr::Col(name) => barrel.get(name),
            Expr::Const(v) => *v,
            Expr::Add(a, b) => a.eval(barrel) + b.eval(barrel),
            Expr::Sub(a, b) => a.eval(barrel) - b.eval(barrel),
            Expr::Mul(a, b) => a.eval(barrel) * b.eval(barrel),
            Expr::Div(a, b) => a.eval(barrel) / b.eval(barrel),
        }
    }

    pub fn columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Col(name) => {
                if !out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    out.push(name.clone());
                }
            }
            Expr::Const(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.columns(out);
                b.columns(out);
            }
        }
    }
}

/// Arithmetic range predicate: `left left_op expr` and `expr right_op right`.
#[derive(Clone, PartialEq, Debug)]
pub struct ArithPred {
    pub expr: Expr,
    pub left: f64,
    pub left_op: Op,
    pub right_op: Op,
    pub right: f64,
}

impl ArithPred {
    pub fn new(expr: Expr, left: f64, left_op: Op, right_op: Op, right: f64) -> ArithPred {
        ArithPred {
            expr,
            left,
            left_op,
            right_op,
            right,
        }
    }

    pub fn in_range(&self, barrel: &Barrel) -> bool {
        let v = self.expr.eval(barrel);
        self.left_op.holds(self.left, v) && self.right_op.holds(v, self.right)
    }

    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.expr.columns(&mut out);
        out
    }
}

/// Predicate tree. Leaves are consumed by the evaluator; interior nodes are
/// combined with bitmap algebra.
#[derive(Clone, PartialEq, Debug)]
pub enum PredNode {
    Range(RangePred),
    Discrete(DiscretePred),
    StringEq(StringPred),
    AnyAny(AnyAnyPred),
    Arith(ArithPred),
    And(Box<PredNode>, Box<PredNode>),
    Or(Box<PredNode>, Box<PredNode>),
    Not(Box<PredNode>),
}

impl PredNode {
    pub fn and(self, other: PredNode) -> PredNode {
        PredNode::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: PredNode) -> PredNode {
        PredNode::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> PredNode {
        PredNode::Not(Box::new(self))
    }
}

impl From<RangePred> for PredNode {
    fn from(r: RangePred) -> PredNode {
        PredNode::Range(r)
    }
}
