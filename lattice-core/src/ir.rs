//! The lattice intermediate representation.
//!
//! Expressions and statements are persistent trees: `Expr` and `Stmt` are
//! cheap-to-clone handles over `Rc`-shared immutable nodes. Passes never
//! mutate a tree; rewriters build new nodes and return the original handle
//! when nothing underneath changed, so unchanged subtrees stay shared.
//!
//! Equality is structural, with a pointer-equality fast path.

use std::fmt;
use std::rc::Rc;

use crate::storage::Storage;
use crate::types::{IndexDomain, IndexSet, ScalarKind, TensorType, Type};

/// A typed variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
    pub ty: Type,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Var { name: name.into(), ty }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Var::new(name, Type::int())
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Reduction operator carried by maps and reduction index variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOp {
    Sum,
}

impl ReductionOp {
    /// The neutral element, as a literal of the given component kind.
    pub fn neutral(&self, component: ScalarKind) -> Literal {
        match (self, component) {
            (ReductionOp::Sum, ScalarKind::Float) => Literal::Float(0.0),
            (ReductionOp::Sum, _) => Literal::Int(0),
        }
    }
}

impl fmt::Display for ReductionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionOp::Sum => write!(f, "+"),
        }
    }
}

/// Whether an index variable is free or reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexVarKind {
    Free,
    Sum,
}

/// An index variable: a name bound to a domain, with a reduction operator.
///
/// Two occurrences denote the same variable iff their names and domains
/// match; the kind does not participate in identity.
#[derive(Debug, Clone, Eq)]
pub struct IndexVar {
    pub name: String,
    pub domain: IndexDomain,
    pub kind: IndexVarKind,
}

impl IndexVar {
    pub fn free(name: impl Into<String>, domain: IndexDomain) -> Self {
        IndexVar { name: name.into(), domain, kind: IndexVarKind::Free }
    }

    pub fn sum(name: impl Into<String>, domain: IndexDomain) -> Self {
        IndexVar { name: name.into(), domain, kind: IndexVarKind::Sum }
    }

    pub fn is_free(&self) -> bool {
        self.kind == IndexVarKind::Free
    }

    pub fn is_reduction(&self) -> bool {
        self.kind != IndexVarKind::Free
    }

    pub fn reduction_op(&self) -> Option<ReductionOp> {
        match self.kind {
            IndexVarKind::Free => None,
            IndexVarKind::Sum => Some(ReductionOp::Sum),
        }
    }
}

impl PartialEq for IndexVar {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.domain == other.domain
    }
}

impl std::hash::Hash for IndexVar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.domain.hash(state);
    }
}

impl fmt::Display for IndexVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IndexVarKind::Free => write!(f, "{}", self.name),
            IndexVarKind::Sum => write!(f, "+{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Literal {
    pub fn scalar_kind(&self) -> ScalarKind {
        match self {
            Literal::Int(_) => ScalarKind::Int,
            Literal::Float(_) => ScalarKind::Float,
            Literal::Bool(_) => ScalarKind::Bool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        };
        write!(f, "{}", s)
    }
}

/// Which connectivity array of a set an `IndexRead` denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexReadKind {
    /// Edge endpoint array, `arity` entries per edge.
    Endpoints,
    /// CSR row-start array of the set's neighbour structure.
    NeighborStarts,
    /// CSR column array of the set's neighbour structure.
    Neighbors,
}

impl fmt::Display for IndexReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexReadKind::Endpoints => write!(f, "endpoints"),
            IndexReadKind::NeighborStarts => write!(f, "neighbors.start"),
            IndexReadKind::Neighbors => write!(f, "neighbors"),
        }
    }
}

/// GPU shard dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardDimension {
    X,
    Y,
    Z,
}

impl fmt::Display for ShardDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardDimension::X => write!(f, "x"),
            ShardDimension::Y => write!(f, "y"),
            ShardDimension::Z => write!(f, "z"),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    VarRead(Var),
    FieldRead { target: Expr, field: String },
    TensorRead { tensor: Expr, indices: Vec<Expr> },
    TupleRead { tuple: Expr, index: Expr },
    IndexRead { set: Expr, kind: IndexReadKind },
    Length(IndexSet),
    IndexedTensor { tensor: Expr, index_vars: Vec<IndexVar> },
    IndexExpr { result_vars: Vec<IndexVar>, rhs: Expr },
    Unary { op: UnaryOp, a: Expr },
    Binary { op: BinOp, a: Expr, b: Expr },
    Call { func: Func, args: Vec<Expr> },
    Load { buffer: Expr, index: Expr },
    ThreadIdx(ShardDimension),
}

#[derive(Debug, PartialEq)]
struct ExprData {
    ty: Type,
    kind: ExprKind,
}

/// A typed expression handle.
#[derive(Debug, Clone)]
pub struct Expr(Rc<ExprData>);

impl Expr {
    pub fn new(ty: Type, kind: ExprKind) -> Self {
        Expr(Rc::new(ExprData { ty, kind }))
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    /// Whether two handles refer to the same node.
    pub fn ptr_eq(a: &Expr, b: &Expr) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn int(value: i64) -> Self {
        Expr::new(Type::int(), ExprKind::Literal(Literal::Int(value)))
    }

    pub fn float(value: f64) -> Self {
        Expr::new(Type::float(), ExprKind::Literal(Literal::Float(value)))
    }

    pub fn boolean(value: bool) -> Self {
        Expr::new(Type::boolean(), ExprKind::Literal(Literal::Bool(value)))
    }

    pub fn literal(lit: Literal) -> Self {
        let ty = Type::scalar(lit.scalar_kind());
        Expr::new(ty, ExprKind::Literal(lit))
    }

    pub fn var(var: Var) -> Self {
        let ty = var.ty.clone();
        Expr::new(ty, ExprKind::VarRead(var))
    }

    /// Read `target.field`, typing the result from the target.
    ///
    /// A field read on a set yields the whole per-element array: the field's
    /// tensor type with the set's domain prepended.
    pub fn field_read(target: Expr, field: impl Into<String>) -> Self {
        let field = field.into();
        let ty = match target.ty() {
            Type::Element(elem) => elem
                .field(&field)
                .map(|t| Type::Tensor(t.clone()))
                .unwrap_or_else(Type::float),
            Type::Set(set) => {
                let set_domain = match target.kind() {
                    ExprKind::VarRead(v) => IndexDomain::set(v.name.clone()),
                    _ => IndexDomain::set(set.element.name.clone()),
                };
                let field_ty = set.element.field(&field).cloned().unwrap_or_else(|| {
                    TensorType::scalar(ScalarKind::Float)
                });
                let mut dims = vec![set_domain];
                dims.extend(field_ty.dims.iter().cloned());
                Type::Tensor(TensorType::new(field_ty.component, dims))
            }
            _ => Type::float(),
        };
        Expr::new(ty, ExprKind::FieldRead { target, field })
    }

    /// Fully-indexed tensor read; the result is the component scalar.
    pub fn tensor_read(tensor: Expr, indices: Vec<Expr>) -> Self {
        let component = tensor
            .ty()
            .to_tensor()
            .map(|t| t.component)
            .unwrap_or(ScalarKind::Float);
        Expr::new(Type::scalar(component), ExprKind::TensorRead { tensor, indices })
    }

    pub fn tuple_read(tuple: Expr, index: Expr) -> Self {
        let ty = match tuple.ty() {
            Type::Tuple(t) => Type::Element(t.element.clone()),
            other => other.clone(),
        };
        Expr::new(ty, ExprKind::TupleRead { tuple, index })
    }

    pub fn index_read(set: Expr, kind: IndexReadKind) -> Self {
        let domain = match set.kind() {
            ExprKind::VarRead(v) => IndexDomain::set(v.name.clone()),
            _ => IndexDomain::range(0),
        };
        let ty = Type::Tensor(TensorType::new(ScalarKind::Int, vec![domain]));
        Expr::new(ty, ExprKind::IndexRead { set, kind })
    }

    pub fn length(set: IndexSet) -> Self {
        Expr::new(Type::int(), ExprKind::Length(set))
    }

    pub fn indexed_tensor(tensor: Expr, index_vars: Vec<IndexVar>) -> Self {
        let component = tensor
            .ty()
            .to_tensor()
            .map(|t| t.component)
            .unwrap_or(ScalarKind::Float);
        Expr::new(Type::scalar(component), ExprKind::IndexedTensor { tensor, index_vars })
    }

    /// An index expression `(result_vars) rhs`, typed from its free variables.
    pub fn index_expr(result_vars: Vec<IndexVar>, rhs: Expr) -> Self {
        let component = rhs
            .ty()
            .to_tensor()
            .map(|t| t.component)
            .unwrap_or(ScalarKind::Float);
        let dims: Vec<IndexDomain> = result_vars.iter().map(|iv| iv.domain.clone()).collect();
        let ty = Type::Tensor(TensorType::new(component, dims));
        Expr::new(ty, ExprKind::IndexExpr { result_vars, rhs })
    }

    pub fn neg(a: Expr) -> Self {
        let ty = a.ty().clone();
        Expr::new(ty, ExprKind::Unary { op: UnaryOp::Neg, a })
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Self {
        let ty = if op.is_comparison() || op.is_logical() {
            Type::boolean()
        } else {
            a.ty().clone()
        };
        Expr::new(ty, ExprKind::Binary { op, a, b })
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Add, a, b)
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Sub, a, b)
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Mul, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Lt, a, b)
    }

    pub fn le(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::Le, a, b)
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::binary(BinOp::And, a, b)
    }

    pub fn call(func: Func, args: Vec<Expr>) -> Self {
        let ty = func
            .results()
            .first()
            .map(|r| r.ty.clone())
            .unwrap_or_else(Type::float);
        Expr::new(ty, ExprKind::Call { func, args })
    }

    pub fn load(buffer: Expr, index: Expr) -> Self {
        let component = buffer
            .ty()
            .to_tensor()
            .map(|t| t.component)
            .unwrap_or(ScalarKind::Float);
        Expr::new(Type::scalar(component), ExprKind::Load { buffer, index })
    }

    pub fn thread_idx(dimension: ShardDimension) -> Self {
        Expr::new(Type::int(), ExprKind::ThreadIdx(dimension))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Expr::ptr_eq(self, other) || self.0 == other.0
    }
}

#[derive(Debug, PartialEq)]
pub enum StmtKind {
    Assign { var: Var, value: Expr },
    FieldWrite { target: Expr, field: String, value: Expr },
    TensorWrite { tensor: Expr, indices: Vec<Expr>, value: Expr },
    Store { buffer: Expr, index: Expr, value: Expr },
    VarDecl { var: Var },
    Block(Vec<Stmt>),
    For { var: Var, domain: IndexSet, body: Stmt },
    While { cond: Expr, body: Stmt },
    IfThenElse { cond: Expr, then_body: Stmt, else_body: Option<Stmt> },
    Comment { text: String, body: Stmt },
    Map(MapStmt),
    GPUFor { var: Var, domain: IndexSet, dimension: ShardDimension, body: Stmt },
    Barrier,
    Pass,
}

/// `vars = map function to target with neighbors reduce op`.
#[derive(Debug, PartialEq)]
pub struct MapStmt {
    pub vars: Vec<Var>,
    pub function: Func,
    pub target: Expr,
    pub neighbors: Option<Expr>,
    pub reduction: Option<ReductionOp>,
}

/// A statement handle.
#[derive(Debug, Clone)]
pub struct Stmt(Rc<StmtKind>);

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Stmt(Rc::new(kind))
    }

    pub fn kind(&self) -> &StmtKind {
        &self.0
    }

    pub fn ptr_eq(a: &Stmt, b: &Stmt) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn assign(var: Var, value: Expr) -> Self {
        Stmt::new(StmtKind::Assign { var, value })
    }

    pub fn field_write(target: Expr, field: impl Into<String>, value: Expr) -> Self {
        Stmt::new(StmtKind::FieldWrite { target, field: field.into(), value })
    }

    pub fn tensor_write(tensor: Expr, indices: Vec<Expr>, value: Expr) -> Self {
        Stmt::new(StmtKind::TensorWrite { tensor, indices, value })
    }

    pub fn store(buffer: Expr, index: Expr, value: Expr) -> Self {
        Stmt::new(StmtKind::Store { buffer, index, value })
    }

    pub fn var_decl(var: Var) -> Self {
        Stmt::new(StmtKind::VarDecl { var })
    }

    /// A sequence; a single statement is returned as itself.
    pub fn block(stmts: Vec<Stmt>) -> Self {
        let mut stmts = stmts;
        if stmts.len() == 1 {
            stmts.pop().unwrap()
        } else {
            Stmt::new(StmtKind::Block(stmts))
        }
    }

    pub fn for_loop(var: Var, domain: IndexSet, body: Stmt) -> Self {
        Stmt::new(StmtKind::For { var, domain, body })
    }

    pub fn while_loop(cond: Expr, body: Stmt) -> Self {
        Stmt::new(StmtKind::While { cond, body })
    }

    pub fn if_then(cond: Expr, then_body: Stmt) -> Self {
        Stmt::new(StmtKind::IfThenElse { cond, then_body, else_body: None })
    }

    pub fn if_then_else(cond: Expr, then_body: Stmt, else_body: Stmt) -> Self {
        Stmt::new(StmtKind::IfThenElse { cond, then_body, else_body: Some(else_body) })
    }

    pub fn comment(text: impl Into<String>, body: Stmt) -> Self {
        Stmt::new(StmtKind::Comment { text: text.into(), body })
    }

    pub fn map(map: MapStmt) -> Self {
        Stmt::new(StmtKind::Map(map))
    }

    pub fn gpu_for(var: Var, domain: IndexSet, dimension: ShardDimension, body: Stmt) -> Self {
        Stmt::new(StmtKind::GPUFor { var, domain, dimension, body })
    }

    pub fn barrier() -> Self {
        Stmt::new(StmtKind::Barrier)
    }

    pub fn pass() -> Self {
        Stmt::new(StmtKind::Pass)
    }
}

impl PartialEq for Stmt {
    fn eq(&self, other: &Self) -> bool {
        Stmt::ptr_eq(self, other) || self.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKind {
    Internal,
    External,
    Intrinsic,
}

/// Global environment of a function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Environment {
    pub globals: Vec<Var>,
}

impl Environment {
    pub fn new(globals: Vec<Var>) -> Self {
        Environment { globals }
    }
}

#[derive(Debug)]
struct FuncData {
    name: String,
    args: Vec<Var>,
    results: Vec<Var>,
    body: Option<Stmt>,
    kind: FuncKind,
    env: Environment,
    storage: Storage,
}

/// A function handle. `External` and `Intrinsic` functions have no body and
/// are opaque to rewriting.
#[derive(Debug, Clone)]
pub struct Func(Rc<FuncData>);

impl Func {
    pub fn internal(
        name: impl Into<String>,
        args: Vec<Var>,
        results: Vec<Var>,
        body: Stmt,
    ) -> Self {
        Func(Rc::new(FuncData {
            name: name.into(),
            args,
            results,
            body: Some(body),
            kind: FuncKind::Internal,
            env: Environment::default(),
            storage: Storage::new(),
        }))
    }

    pub fn external(name: impl Into<String>, args: Vec<Var>, results: Vec<Var>) -> Self {
        Func(Rc::new(FuncData {
            name: name.into(),
            args,
            results,
            body: None,
            kind: FuncKind::External,
            env: Environment::default(),
            storage: Storage::new(),
        }))
    }

    pub fn intrinsic(name: impl Into<String>, args: Vec<Var>, results: Vec<Var>) -> Self {
        Func(Rc::new(FuncData {
            name: name.into(),
            args,
            results,
            body: None,
            kind: FuncKind::Intrinsic,
            env: Environment::default(),
            storage: Storage::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn args(&self) -> &[Var] {
        &self.0.args
    }

    pub fn results(&self) -> &[Var] {
        &self.0.results
    }

    pub fn body(&self) -> Option<&Stmt> {
        self.0.body.as_ref()
    }

    pub fn kind(&self) -> FuncKind {
        self.0.kind
    }

    pub fn env(&self) -> &Environment {
        &self.0.env
    }

    pub fn storage(&self) -> &Storage {
        &self.0.storage
    }

    /// A new function with the same signature and a replaced body.
    pub fn with_body(&self, body: Stmt) -> Self {
        Func(Rc::new(FuncData {
            name: self.0.name.clone(),
            args: self.0.args.clone(),
            results: self.0.results.clone(),
            body: Some(body),
            kind: self.0.kind,
            env: self.0.env.clone(),
            storage: self.0.storage.clone(),
        }))
    }

    pub fn with_storage(&self, storage: Storage) -> Self {
        Func(Rc::new(FuncData {
            name: self.0.name.clone(),
            args: self.0.args.clone(),
            results: self.0.results.clone(),
            body: self.0.body.clone(),
            kind: self.0.kind,
            env: self.0.env.clone(),
            storage,
        }))
    }

    pub fn with_env(&self, env: Environment) -> Self {
        Func(Rc::new(FuncData {
            name: self.0.name.clone(),
            args: self.0.args.clone(),
            results: self.0.results.clone(),
            body: self.0.body.clone(),
            kind: self.0.kind,
            env,
            storage: self.0.storage.clone(),
        }))
    }

    pub fn ptr_eq(a: &Func, b: &Func) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        Func::ptr_eq(self, other)
            || (self.0.name == other.0.name && self.0.kind == other.0.kind)
    }
}

/// Monotone fresh-name generator, scoped to one pipeline run.
///
/// Owned by the driver and threaded into passes explicitly.
#[derive(Debug, Default)]
pub struct NameGenerator {
    counter: usize,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.counter);
        self.counter += 1;
        name
    }
}

/// The fixed intrinsic set.
pub mod intrinsics {
    use super::{Func, Var};
    use crate::types::Type;

    fn unary(name: &str) -> Func {
        Func::intrinsic(
            name,
            vec![Var::new("x", Type::float())],
            vec![Var::new("r", Type::float())],
        )
    }

    fn binary(name: &str) -> Func {
        Func::intrinsic(
            name,
            vec![Var::new("x", Type::float()), Var::new("y", Type::float())],
            vec![Var::new("r", Type::float())],
        )
    }

    pub fn by_name(name: &str) -> Option<Func> {
        match name {
            "sin" | "cos" | "tan" | "asin" | "acos" | "sqrt" | "log" | "exp" => {
                Some(unary(name))
            }
            "atan2" | "pow" => Some(binary(name)),
            _ => None,
        }
    }

    pub fn sin() -> Func {
        unary("sin")
    }

    pub fn cos() -> Func {
        unary("cos")
    }

    pub fn sqrt() -> Func {
        unary("sqrt")
    }

    pub fn pow() -> Func {
        binary("pow")
    }
}
