//! Tensor storage descriptors and storage inference.
//!
//! Every tensor variable in a function is assigned a [`TensorStorage`]
//! describing its physical layout: dense row-major for element tensors and
//! vectors, and system storage for tensors assembled over graph connectivity.

use std::fmt;
use std::ops::ControlFlow;

use indexmap::IndexMap;
use log::trace;

use crate::error::{CompilerError, Result};
use crate::ir::{Expr, ExprKind, MapStmt, Stmt, Var};
use crate::visitor::{walk_expr, Visitor};
use crate::{internal_error, temporary_error, user_error};

/// Physical layout of a tensor variable.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorageKind {
    /// Sentinel; must never survive storage inference for a non-scalar.
    Undefined,
    /// Contiguous layout following domain order.
    DenseRowMajor,
    /// Assembled but not yet materialised.
    SystemNone,
    /// Assembled over graph connectivity: nonzeros follow the neighbour
    /// structure of `target` through `storage`.
    SystemReduced { target: Expr, storage: Expr },
    /// Nonzeros only where all indices coincide.
    SystemDiagonal { target: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorStorage {
    kind: TensorStorageKind,
    needs_init: bool,
}

impl TensorStorage {
    pub fn undefined() -> Self {
        TensorStorage { kind: TensorStorageKind::Undefined, needs_init: false }
    }

    pub fn dense_row_major(needs_init: bool) -> Self {
        TensorStorage { kind: TensorStorageKind::DenseRowMajor, needs_init }
    }

    pub fn system_none() -> Self {
        TensorStorage { kind: TensorStorageKind::SystemNone, needs_init: true }
    }

    pub fn system_reduced(target: Expr, storage: Expr) -> Self {
        TensorStorage {
            kind: TensorStorageKind::SystemReduced { target, storage },
            needs_init: true,
        }
    }

    pub fn system_diagonal(target: Expr) -> Self {
        TensorStorage { kind: TensorStorageKind::SystemDiagonal { target }, needs_init: true }
    }

    pub fn kind(&self) -> &TensorStorageKind {
        &self.kind
    }

    pub fn is_system(&self) -> bool {
        matches!(
            self.kind,
            TensorStorageKind::SystemNone
                | TensorStorageKind::SystemReduced { .. }
                | TensorStorageKind::SystemDiagonal { .. }
        )
    }

    pub fn is_undefined(&self) -> bool {
        self.kind == TensorStorageKind::Undefined
    }

    /// Whether the runtime must zero or allocate the buffer before first use.
    pub fn needs_initialization(&self) -> bool {
        self.needs_init
    }
}

impl fmt::Display for TensorStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TensorStorageKind::Undefined => write!(f, "Undefined"),
            TensorStorageKind::DenseRowMajor => write!(f, "Dense Row Major"),
            TensorStorageKind::SystemNone => write!(f, "System None"),
            TensorStorageKind::SystemReduced { .. } => write!(f, "System Reduced"),
            TensorStorageKind::SystemDiagonal { .. } => write!(f, "System Diagonal"),
        }
    }
}

/// Per-function map from tensor variable names to storage descriptors.
///
/// Iteration follows insertion order so pass output is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Storage {
    descriptors: IndexMap<String, TensorStorage>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, var: &Var, storage: TensorStorage) {
        self.descriptors.insert(var.name.clone(), storage);
    }

    pub fn has_storage(&self, var: &Var) -> bool {
        self.descriptors.contains_key(&var.name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorStorage> {
        self.descriptors.get(name)
    }

    pub fn expect(&self, name: &str) -> Result<&TensorStorage> {
        self.get(name)
            .ok_or_else(|| internal_error!("no storage specified for tensor '{}'", name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorStorage)> {
        self.descriptors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, storage) in &self.descriptors {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{} : {}", name, storage)?;
            first = false;
        }
        Ok(())
    }
}

/// Infer a storage descriptor for every tensor variable of `func`.
///
/// The map is rebuilt from scratch; descriptors the function already carries
/// for its interface variables (assembled arguments in particular) are kept,
/// while local descriptors are re-derived, so inference is idempotent.
pub fn infer_storage(func: &crate::ir::Func) -> Result<Storage> {
    let mut storage = Storage::new();
    let previous = func.storage();
    let origin = func.name().to_string();

    let interface = func
        .env()
        .globals
        .iter()
        .chain(func.args())
        .chain(func.results());
    for var in interface {
        if let Some(descriptor) = previous.get(&var.name) {
            storage.add(var, descriptor.clone());
        } else if var.ty.is_tensor() {
            determine_storage(&mut storage, var, false)?;
        }
    }

    let mut inferer = StorageInferer { storage, origin };
    if let Some(body) = func.body() {
        if let ControlFlow::Break(err) = inferer.visit_stmt(body) {
            return Err(err);
        }
    }

    // Undefined storage must not survive inference.
    for (name, descriptor) in inferer.storage.iter() {
        if descriptor.is_undefined() {
            return Err(internal_error!(
                "undefined storage for tensor '{}' survived inference",
                name
            ));
        }
        trace!("storage {} : {}", name, descriptor);
    }

    Ok(inferer.storage)
}

fn is_storable_tensor(var: &Var) -> bool {
    var.ty.is_tensor() && !var.ty.is_scalar()
}

/// Element tensors and vectors are dense; other shapes are not decidable here.
fn determine_storage(storage: &mut Storage, var: &Var, initialize: bool) -> Result<()> {
    if var.ty.is_scalar() || storage.has_storage(var) {
        return Ok(());
    }
    let tensor = var
        .ty
        .to_tensor()
        .ok_or_else(|| internal_error!("variable '{}' is not a tensor", var.name))?;

    if tensor.is_element_tensor() || tensor.order() == 1 {
        storage.add(var, TensorStorage::dense_row_major(initialize));
        Ok(())
    } else {
        Err(temporary_error!(
            "cannot infer storage for assembled tensor '{}' outside a map or assembly",
            var.name
        ))
    }
}

/// Propagate system storage from the leaf variables of a defining rhs.
///
/// A variable this pass cannot resolve fails loudly; leaving it out of the
/// map would let later passes treat it as dense.
fn determine_storage_from_rhs(storage: &mut Storage, var: &Var, rhs: &Expr) -> Result<()> {
    struct LeafVars {
        vars: Vec<Var>,
    }
    impl Visitor for LeafVars {
        type Break = std::convert::Infallible;
        fn visit_var_read(&mut self, _e: &Expr, var: &Var) -> ControlFlow<Self::Break> {
            if !self.vars.contains(var) {
                self.vars.push(var.clone());
            }
            ControlFlow::Continue(())
        }
    }

    let mut leaves = LeafVars { vars: Vec::new() };
    let _ = walk_expr(&mut leaves, rhs);

    for leaf in &leaves.vars {
        if let Some(leaf_storage) = storage.get(&leaf.name) {
            if let TensorStorageKind::SystemReduced { target, storage: st } = leaf_storage.kind() {
                let descriptor = TensorStorage::system_reduced(target.clone(), st.clone());
                storage.add(var, descriptor);
                return Ok(());
            }
        }
    }
    Err(temporary_error!(
        "cannot infer storage for assembled tensor '{}' outside a map or assembly",
        var.name
    ))
}

struct StorageInferer {
    storage: Storage,
    origin: String,
}

impl StorageInferer {
    fn fail(&mut self, err: CompilerError) -> ControlFlow<CompilerError> {
        ControlFlow::Break(err)
    }
}

impl Visitor for StorageInferer {
    type Break = CompilerError;

    fn visit_var_decl(&mut self, _s: &Stmt, var: &Var) -> ControlFlow<Self::Break> {
        if self.storage.has_storage(var) {
            return self.fail(user_error!(
                self.origin,
                "Redeclaration of variable '{}'",
                var.name
            ));
        }
        if is_storable_tensor(var) {
            if let Err(err) = determine_storage(&mut self.storage, var, true) {
                return self.fail(err);
            }
        }
        ControlFlow::Continue(())
    }

    fn visit_assign(&mut self, _s: &Stmt, var: &Var, value: &Expr) -> ControlFlow<Self::Break> {
        if is_storable_tensor(var) && !self.storage.has_storage(var) {
            let tensor = var.ty.to_tensor().expect("storable tensor");
            let bound_to_literal = matches!(value.kind(), ExprKind::Literal(_));
            let determined = if !tensor.is_element_tensor() && tensor.order() > 1 {
                determine_storage_from_rhs(&mut self.storage, var, value)
            } else {
                determine_storage(&mut self.storage, var, !bound_to_literal)
            };
            if let Err(err) = determined {
                return self.fail(err);
            }
        }
        self.visit_expr(value)
    }

    fn visit_tensor_write(
        &mut self,
        _s: &Stmt,
        tensor: &Expr,
        indices: &[Expr],
        value: &Expr,
    ) -> ControlFlow<Self::Break> {
        if let ExprKind::VarRead(var) = tensor.kind() {
            if is_storable_tensor(var) && !self.storage.has_storage(var) {
                if let Err(err) = determine_storage(&mut self.storage, var, true) {
                    return self.fail(err);
                }
            }
        }
        self.visit_expr(tensor)?;
        for index in indices {
            self.visit_expr(index)?;
        }
        self.visit_expr(value)
    }

    fn visit_map(&mut self, _s: &Stmt, map: &MapStmt) -> ControlFlow<Self::Break> {
        for var in &map.vars {
            if !is_storable_tensor(var) || self.storage.has_storage(var) {
                continue;
            }
            let tensor = var.ty.to_tensor().expect("storable tensor");
            // Assembled vectors are dense; matrices follow the map's
            // connectivity.
            let descriptor = if tensor.order() == 1 {
                TensorStorage::dense_row_major(true)
            } else if tensor.order() == 2 {
                match &map.neighbors {
                    Some(neighbors) => {
                        TensorStorage::system_reduced(map.target.clone(), neighbors.clone())
                    }
                    None => TensorStorage::system_diagonal(map.target.clone()),
                }
            } else {
                return self.fail(temporary_error!(
                    "assembled tensors of order {} are not supported (variable '{}')",
                    tensor.order(),
                    var.name
                ));
            };
            debug_assert!(!descriptor.is_undefined());
            self.storage.add(var, descriptor);
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Func, ReductionOp};
    use crate::types::{ElementType, IndexDomain, ScalarKind, SetType, TensorType, Type};

    fn point_set_var(name: &str) -> Var {
        let elem = ElementType::new("Point", vec![
            ("x".into(), TensorType::scalar(ScalarKind::Float)),
        ]);
        Var::new(name, Type::Set(SetType::new(elem)))
    }

    fn system_matrix(name: &str, set: &str) -> Var {
        Var::new(
            name,
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set(set), IndexDomain::set(set)],
            )),
        )
    }

    fn dense_vector(name: &str, set: &str) -> Var {
        Var::new(
            name,
            Type::Tensor(TensorType::new(ScalarKind::Float, vec![IndexDomain::set(set)])),
        )
    }

    fn assemble_fn(name: &str) -> Func {
        Func::internal(
            name,
            vec![Var::new("p", Type::Element(ElementType::new("Point", vec![])))],
            vec![Var::new("r", Type::float())],
            Stmt::assign(Var::new("r", Type::float()), Expr::float(1.0)),
        )
    }

    #[test]
    fn redeclaration_is_a_user_error() {
        let x = dense_vector("x", "V");
        let body = Stmt::block(vec![
            Stmt::var_decl(x.clone()),
            Stmt::var_decl(x.clone()),
        ]);
        let func = Func::internal("main", vec![], vec![], body);

        let err = infer_storage(&func).unwrap_err();
        match err {
            CompilerError::User { message, .. } => {
                assert!(message.contains("Redeclaration of variable"), "{}", message);
            }
            other => panic!("expected user error, got {:?}", other),
        }
    }

    #[test]
    fn vectors_and_element_tensors_are_dense() {
        let x = dense_vector("x", "V");
        let m = Var::new(
            "m",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::range(3), IndexDomain::range(3)],
            )),
        );
        let body = Stmt::block(vec![
            Stmt::var_decl(x.clone()),
            Stmt::var_decl(m.clone()),
        ]);
        let func = Func::internal("main", vec![], vec![], body);

        let storage = infer_storage(&func).unwrap();
        assert_eq!(*storage.get("x").unwrap().kind(), TensorStorageKind::DenseRowMajor);
        assert_eq!(*storage.get("m").unwrap().kind(), TensorStorageKind::DenseRowMajor);
    }

    #[test]
    fn literal_binding_skips_initialization() {
        let s = Var::new("s", Type::float());
        let v = dense_vector("v", "V");
        let body = Stmt::block(vec![
            Stmt::assign(s, Expr::float(0.0)),
            Stmt::assign(v.clone(), Expr::float(0.0)),
            Stmt::assign(v.clone(), Expr::var(v.clone())),
        ]);
        let func = Func::internal("main", vec![], vec![], body);

        let storage = infer_storage(&func).unwrap();
        // Scalars get no storage; the vector is bound to a literal first.
        assert!(storage.get("s").is_none());
        assert!(!storage.get("v").unwrap().needs_initialization());
    }

    #[test]
    fn map_results_follow_connectivity() {
        let verts = point_set_var("V");
        let edges = point_set_var("E");
        let a = system_matrix("A", "V");
        let d = system_matrix("D", "V");
        let y = dense_vector("y", "V");

        let body = Stmt::block(vec![
            Stmt::map(MapStmt {
                vars: vec![a.clone(), y.clone()],
                function: assemble_fn("asm"),
                target: Expr::var(verts.clone()),
                neighbors: Some(Expr::var(edges.clone())),
                reduction: Some(ReductionOp::Sum),
            }),
            Stmt::map(MapStmt {
                vars: vec![d.clone()],
                function: assemble_fn("diag"),
                target: Expr::var(verts.clone()),
                neighbors: None,
                reduction: Some(ReductionOp::Sum),
            }),
        ]);
        let func = Func::internal("main", vec![verts, edges], vec![], body);

        let storage = infer_storage(&func).unwrap();
        assert!(matches!(
            storage.get("A").unwrap().kind(),
            TensorStorageKind::SystemReduced { .. }
        ));
        assert!(matches!(
            storage.get("D").unwrap().kind(),
            TensorStorageKind::SystemDiagonal { .. }
        ));
        assert_eq!(*storage.get("y").unwrap().kind(), TensorStorageKind::DenseRowMajor);
    }

    #[test]
    fn order_three_assembly_is_temporary() {
        let verts = point_set_var("V");
        let t3 = Var::new(
            "T",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::set("V"), IndexDomain::set("V")],
            )),
        );
        let body = Stmt::map(MapStmt {
            vars: vec![t3],
            function: assemble_fn("asm"),
            target: Expr::var(verts.clone()),
            neighbors: None,
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![verts], vec![], body);

        let err = infer_storage(&func).unwrap_err();
        assert!(matches!(err, CompilerError::Temporary { .. }), "{:?}", err);
    }

    #[test]
    fn unresolved_assembled_assignment_is_temporary() {
        let a = system_matrix("A", "V");
        let x = dense_vector("x", "V");
        // No rhs leaf carries system storage, so A's layout is unknowable.
        let body = Stmt::assign(a, Expr::add(Expr::var(x.clone()), Expr::var(x.clone())));
        let func = Func::internal("main", vec![x], vec![], body);

        let err = infer_storage(&func).unwrap_err();
        assert!(matches!(err, CompilerError::Temporary { .. }), "{:?}", err);
    }

    #[test]
    fn system_storage_propagates_through_assignment() {
        let verts = point_set_var("V");
        let a = system_matrix("A", "V");
        let b = system_matrix("B", "V");

        let mut seeded = Storage::new();
        seeded.add(&a, TensorStorage::system_reduced(Expr::var(verts.clone()), Expr::var(verts.clone())));

        let body = Stmt::assign(b.clone(), Expr::add(Expr::var(a.clone()), Expr::var(a.clone())));
        let func = Func::internal("main", vec![a, verts], vec![], body).with_storage(seeded);

        let storage = infer_storage(&func).unwrap();
        assert!(matches!(
            storage.get("B").unwrap().kind(),
            TensorStorageKind::SystemReduced { .. }
        ));
    }
}
