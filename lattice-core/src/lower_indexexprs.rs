//! Index-expression lowering: loop-nest synthesis.
//!
//! An index expression is lowered in four steps:
//!
//! 1. Map every distinct tuple of index variables to the indexed tensors
//!    using it (`IndexTupleUses`).
//! 2. Build an undirected graph over index variables with an edge wherever
//!    two variables co-occur in a tuple.
//! 3. Depth-first traverse the graph from the free variables in declared
//!    order; the visit order is the loop order, enclosing to innermost. A
//!    variable with no `SystemReduced` use gets a dense loop, the rest get
//!    sparse while loops tied to their DFS predecessor.
//! 4. Emit loops innermost-first. Sparse loops zip the CSR coordinates of
//!    every sparse use: per-use column variables are loaded at the top of the
//!    body, the loop variable is their minimum (left-most wins ties), and
//!    coordinates whose column matches advance at the bottom.

use std::ops::ControlFlow;

use indexmap::IndexMap;
use log::trace;

use crate::error::Result;
use crate::internal_error;
use crate::ir::{
    BinOp, Expr, ExprKind, Func, IndexReadKind, IndexVar, NameGenerator, ReductionOp, Stmt,
    StmtKind, Var,
};
use crate::storage::{Storage, TensorStorageKind};
use crate::temporary_error;
use crate::types::ScalarKind;
use crate::visitor::{walk_expr, walk_rewrite_expr, walk_rewrite_stmt, Rewriter, Visitor};

pub fn lower_index_expressions(func: &Func, names: &mut NameGenerator) -> Result<Func> {
    let storage = func.storage().clone();
    let mut lowerer = IndexExprLowerer { storage, names };
    lowerer.rewrite_func(func)
}

struct IndexExprLowerer<'a> {
    storage: Storage,
    names: &'a mut NameGenerator,
}

impl Rewriter for IndexExprLowerer<'_> {
    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        if let StmtKind::Assign { var, value } = s.kind() {
            if let ExprKind::IndexExpr { result_vars, rhs } = value.kind() {
                return lower(var, result_vars, rhs, &self.storage, self.names);
            }
        }
        walk_rewrite_stmt(self, s)
    }
}

/// One indexed-tensor occurrence, keyed by its tensor variable and tuple.
#[derive(Debug, Clone)]
struct TensorUse {
    tensor: Var,
    index_vars: Vec<IndexVar>,
}

impl TensorUse {
    fn key(&self) -> (String, Vec<IndexVar>) {
        (self.tensor.name.clone(), self.index_vars.clone())
    }

    /// Coordinate variables are named from the index variable names followed
    /// by the tensor name, e.g. `ijA`.
    fn coordinate_name(&self) -> String {
        let vars: String = self.index_vars.iter().map(|iv| iv.name.as_str()).collect();
        format!("{}{}", vars, self.tensor.name)
    }
}

type IndexTupleUses = IndexMap<Vec<IndexVar>, Vec<TensorUse>>;
type IndexVarGraph = IndexMap<IndexVar, Vec<IndexVar>>;

/// Collect the distinct tensor uses of each index tuple, in rhs order.
fn get_index_tuple_uses(rhs: &Expr) -> Result<IndexTupleUses> {
    struct Collector {
        uses: IndexTupleUses,
        error: Option<crate::error::CompilerError>,
    }
    impl Visitor for Collector {
        type Break = ();
        fn visit_indexed_tensor(
            &mut self,
            _e: &Expr,
            tensor: &Expr,
            index_vars: &[IndexVar],
        ) -> ControlFlow<()> {
            let var = match tensor.kind() {
                ExprKind::VarRead(var) => var.clone(),
                _ => {
                    self.error = Some(internal_error!(
                        "index expressions must be flattened before lowering"
                    ));
                    return ControlFlow::Break(());
                }
            };
            if index_vars.is_empty() {
                return ControlFlow::Continue(());
            }
            let uses = self.uses.entry(index_vars.to_vec()).or_default();
            let candidate = TensorUse { tensor: var, index_vars: index_vars.to_vec() };
            if !uses.iter().any(|u| u.key() == candidate.key()) {
                uses.push(candidate);
            }
            ControlFlow::Continue(())
        }
    }

    let mut collector = Collector { uses: IndexMap::new(), error: None };
    let _ = walk_expr(&mut collector, rhs);
    match collector.error {
        Some(err) => Err(err),
        None => Ok(collector.uses),
    }
}

/// Undirected co-occurrence graph; adjacency lists follow tuple declaration
/// order.
fn create_index_var_graph(tuple_uses: &IndexTupleUses) -> IndexVarGraph {
    let mut graph = IndexVarGraph::new();
    for tuple in tuple_uses.keys() {
        for var in tuple {
            graph.entry(var.clone()).or_default();
        }
        for i in 0..tuple.len().saturating_sub(1) {
            for j in (i + 1)..tuple.len() {
                graph.entry(tuple[i].clone()).or_default().push(tuple[j].clone());
                graph.entry(tuple[j].clone()).or_default().push(tuple[i].clone());
            }
        }
    }
    graph
}

/// Per-variable list of participating tensor uses.
fn get_index_uses(tuple_uses: &IndexTupleUses) -> IndexMap<IndexVar, Vec<TensorUse>> {
    let mut index_uses: IndexMap<IndexVar, Vec<TensorUse>> = IndexMap::new();
    for (tuple, uses) in tuple_uses {
        for var in tuple {
            let entry = index_uses.entry(var.clone()).or_default();
            for use_ in uses {
                if !entry.iter().any(|u| u.key() == use_.key()) {
                    entry.push(use_.clone());
                }
            }
        }
    }
    index_uses
}

#[derive(Debug, Clone)]
enum LoopKind {
    Dense,
    Sparse { parent: IndexVar },
}

#[derive(Debug, Clone)]
struct Loop {
    index_var: IndexVar,
    kind: LoopKind,
}

fn is_sparse_use(use_: &TensorUse, storage: &Storage) -> bool {
    matches!(
        storage.get(&use_.tensor.name).map(|s| s.kind()),
        Some(TensorStorageKind::SystemReduced { .. })
    )
}

fn has_sparse_use(
    var: &IndexVar,
    index_uses: &IndexMap<IndexVar, Vec<TensorUse>>,
    storage: &Storage,
) -> bool {
    index_uses
        .get(var)
        .map(|uses| uses.iter().any(|u| is_sparse_use(u, storage)))
        .unwrap_or(false)
}

/// DFS over the index-variable graph. Sources become dense loops; every other
/// variable is tied to its spanning-forest predecessor. Dense children are
/// visited before sparse children at equal depth.
fn create_loop_nest(
    graph: &IndexVarGraph,
    sources: &[IndexVar],
    index_uses: &IndexMap<IndexVar, Vec<TensorUse>>,
    storage: &Storage,
) -> Vec<Loop> {
    fn visit(
        graph: &IndexVarGraph,
        source: &IndexVar,
        index_uses: &IndexMap<IndexVar, Vec<TensorUse>>,
        storage: &Storage,
        visited: &mut Vec<IndexVar>,
        loops: &mut Vec<Loop>,
    ) {
        let empty = Vec::new();
        let sinks = graph.get(source).unwrap_or(&empty);
        let mut pending: Vec<&IndexVar> = Vec::new();
        for sink in sinks {
            if !visited.contains(sink) && !pending.contains(&sink) {
                pending.push(sink);
            }
        }
        // Dense loops enclose sparse loops at equal depth.
        let (dense, sparse): (Vec<&IndexVar>, Vec<&IndexVar>) = pending
            .into_iter()
            .partition(|&sink| !has_sparse_use(sink, index_uses, storage));
        for sink in dense.into_iter().chain(sparse) {
            if visited.contains(sink) {
                continue;
            }
            visited.push(sink.clone());
            let kind = if has_sparse_use(sink, index_uses, storage) {
                LoopKind::Sparse { parent: source.clone() }
            } else {
                LoopKind::Dense
            };
            loops.push(Loop { index_var: sink.clone(), kind });
            visit(graph, sink, index_uses, storage, visited, loops);
        }
    }

    let mut visited: Vec<IndexVar> = Vec::new();
    let mut loops = Vec::new();
    for source in sources {
        if visited.contains(source) {
            continue;
        }
        visited.push(source.clone());
        loops.push(Loop { index_var: source.clone(), kind: LoopKind::Dense });
        visit(graph, source, index_uses, storage, &mut visited, &mut loops);
    }
    loops
}

/// Reduction variables of the rhs, in appearance order.
fn reduction_vars(tuple_uses: &IndexTupleUses) -> Vec<IndexVar> {
    let mut vars = Vec::new();
    for tuple in tuple_uses.keys() {
        for var in tuple {
            if var.is_reduction() && !vars.contains(var) {
                vars.push(var.clone());
            }
        }
    }
    vars
}

/// Compute the smallest of `cols` into `var`; the left-most smallest value
/// wins ties. The two-coordinate case is special-cased to a single branch.
fn compute_min(var: &Var, cols: &[Var]) -> Stmt {
    debug_assert!(!cols.is_empty());
    let decl = Stmt::var_decl(var.clone());
    let min_stmt = if cols.len() == 2 {
        Stmt::block(vec![
            decl,
            Stmt::if_then_else(
                Expr::le(Expr::var(cols[0].clone()), Expr::var(cols[1].clone())),
                Stmt::assign(var.clone(), Expr::var(cols[0].clone())),
                Stmt::assign(var.clone(), Expr::var(cols[1].clone())),
            ),
        ])
    } else {
        let mut stmts = vec![decl, Stmt::assign(var.clone(), Expr::var(cols[0].clone()))];
        for col in &cols[1..] {
            stmts.push(Stmt::if_then(
                Expr::lt(Expr::var(col.clone()), Expr::var(var.clone())),
                Stmt::assign(var.clone(), Expr::var(col.clone())),
            ));
        }
        Stmt::block(stmts)
    };

    let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
    let text = format!("{} = min({})", var.name, names.join(", "));
    Stmt::comment(text, min_stmt)
}

/// Replace every indexed tensor in the rhs with a read through the loop
/// induction variables (dense) or the use's coordinate variable (sparse).
struct UseSubstituter<'a> {
    storage: &'a Storage,
}

impl Rewriter for UseSubstituter<'_> {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        if let ExprKind::IndexedTensor { tensor, index_vars } = e.kind() {
            let var = match tensor.kind() {
                ExprKind::VarRead(var) => var.clone(),
                _ => {
                    return Err(internal_error!(
                        "index expressions must be flattened before lowering"
                    ))
                }
            };
            if index_vars.is_empty() {
                return Ok(tensor.clone());
            }
            let use_ = TensorUse { tensor: var.clone(), index_vars: index_vars.clone() };
            if is_sparse_use(&use_, self.storage) {
                let coord = Var::int(use_.coordinate_name());
                return Ok(Expr::tensor_read(tensor.clone(), vec![Expr::var(coord)]));
            }
            let indices = index_vars
                .iter()
                .map(|iv| Expr::var(Var::int(iv.name.clone())))
                .collect();
            return Ok(Expr::tensor_read(tensor.clone(), indices));
        }
        walk_rewrite_expr(self, e)
    }
}

/// Indices for the result write, honouring the target's storage kind.
fn result_write_indices(
    target: &Var,
    result_vars: &[IndexVar],
    tuple_uses: &IndexTupleUses,
    storage: &Storage,
) -> Result<Vec<Expr>> {
    let kind = storage.get(&target.name).map(|s| s.kind());
    if let Some(TensorStorageKind::SystemReduced { .. }) = kind {
        // Reuse the coordinate of the left-most operand sharing the result's
        // tuple; without one the output's sparsity structure is unknown.
        let uses = tuple_uses
            .get(result_vars)
            .into_iter()
            .flatten()
            .find(|&u| is_sparse_use(u, storage));
        return match uses {
            Some(use_) => Ok(vec![Expr::var(Var::int(use_.coordinate_name()))]),
            None => Err(temporary_error!(
                "cannot infer the sparsity structure of result tensor '{}'",
                target.name
            )),
        };
    }
    Ok(result_vars
        .iter()
        .map(|iv| Expr::var(Var::int(iv.name.clone())))
        .collect())
}

fn lower(
    target: &Var,
    result_vars: &[IndexVar],
    rhs: &Expr,
    storage: &Storage,
    names: &mut NameGenerator,
) -> Result<Stmt> {
    let tuple_uses = get_index_tuple_uses(rhs)?;
    let graph = create_index_var_graph(&tuple_uses);
    let index_uses = get_index_uses(&tuple_uses);

    // Free variables seed the traversal in declared order; reduction
    // variables unreachable from them root their own loops.
    let mut sources: Vec<IndexVar> = result_vars.to_vec();
    for var in reduction_vars(&tuple_uses) {
        if !sources.contains(&var) {
            sources.push(var);
        }
    }
    let loops = create_loop_nest(&graph, &sources, &index_uses, storage);
    trace!("index expression over {} loops", loops.len());

    let mut substituter = UseSubstituter { storage };
    let value = substituter.rewrite_expr(rhs)?;

    // Scalar assignment once the loop nest is empty.
    if loops.is_empty() {
        return Ok(Stmt::assign(target.clone(), value));
    }

    let has_reduction = loops.iter().any(|l| l.index_var.is_reduction());
    // The accumulator pattern requires the reduction loops to be the
    // innermost suffix; otherwise accumulate into the target directly.
    let reduction_suffix = loops
        .iter()
        .position(|l| l.index_var.is_reduction())
        .filter(|&k| loops[k..].iter().all(|l| l.index_var.is_reduction()));

    let component = target
        .ty
        .to_tensor()
        .map(|t| t.component)
        .unwrap_or(ScalarKind::Float);

    let write_indices = result_write_indices(target, result_vars, &tuple_uses, storage)?;
    let write = |value: Expr| -> Stmt {
        if write_indices.is_empty() {
            Stmt::assign(target.clone(), value)
        } else {
            Stmt::tensor_write(Expr::var(target.clone()), write_indices.clone(), value)
        }
    };

    let accumulator = reduction_suffix.map(|_| {
        Var::new(names.fresh("acc"), crate::types::Type::scalar(component))
    });

    // Innermost statement.
    let mut nest = match (&accumulator, has_reduction) {
        (Some(acc), _) => Stmt::assign(acc.clone(), Expr::add(Expr::var(acc.clone()), value)),
        (None, true) => {
            // General reduction: read-modify-write on the zero-initialised
            // target.
            let read = if write_indices.is_empty() {
                Expr::var(target.clone())
            } else {
                Expr::tensor_read(Expr::var(target.clone()), write_indices.clone())
            };
            write(Expr::add(read, value))
        }
        (None, false) => write(value),
    };

    // Emit loops innermost-first.
    for (k, loop_) in loops.iter().enumerate().rev() {
        let iv = Var::int(loop_.index_var.name.clone());
        nest = match &loop_.kind {
            LoopKind::Dense => {
                let domain = loop_.index_var.domain.index_sets[0].clone();
                Stmt::for_loop(iv, domain, nest)
            }
            LoopKind::Sparse { parent } => {
                emit_sparse_loop(loop_, parent, &iv, nest, &index_uses, storage)?
            }
        };

        if Some(k) == reduction_suffix {
            let acc = accumulator.clone().expect("accumulator exists");
            let zero = ReductionOp::Sum.neutral(component);
            nest = Stmt::block(vec![
                Stmt::var_decl(acc.clone()),
                Stmt::assign(acc.clone(), Expr::literal(zero)),
                nest,
                write(Expr::var(acc)),
            ]);
        }
    }

    Ok(nest)
}

/// Emit one sparse while loop zipping the CSR coordinates of every sparse use
/// of the loop's index variable.
fn emit_sparse_loop(
    loop_: &Loop,
    parent: &IndexVar,
    iv: &Var,
    inner: Stmt,
    index_uses: &IndexMap<IndexVar, Vec<TensorUse>>,
    storage: &Storage,
) -> Result<Stmt> {
    let empty = Vec::new();
    let sparse_uses: Vec<&TensorUse> = index_uses
        .get(&loop_.index_var)
        .unwrap_or(&empty)
        .iter()
        .filter(|&u| is_sparse_use(u, storage))
        .collect();
    if sparse_uses.is_empty() {
        return Err(internal_error!(
            "sparse loop over '{}' has no sparse uses",
            loop_.index_var.name
        ));
    }

    let parent_iv = Var::int(parent.name.clone());

    let mut inits: Vec<Stmt> = Vec::new();
    let mut conds: Vec<Expr> = Vec::new();
    let mut col_binds: Vec<Stmt> = Vec::new();
    let mut cols: Vec<Var> = Vec::new();
    let mut advances: Vec<Stmt> = Vec::new();

    for use_ in &sparse_uses {
        let descriptor = storage.expect(&use_.tensor.name)?;
        let target_set = match descriptor.kind() {
            TensorStorageKind::SystemReduced { target, .. } => target.clone(),
            _ => unreachable!("filtered to sparse uses"),
        };

        let coord = Var::int(use_.coordinate_name());
        let coord_end = Var::int(format!("{}_end", use_.coordinate_name()));
        let col = Var::int(format!("{}_idx", use_.coordinate_name()));

        let starts = Expr::index_read(target_set.clone(), IndexReadKind::NeighborStarts);
        let columns = Expr::index_read(target_set, IndexReadKind::Neighbors);

        inits.push(Stmt::var_decl(coord.clone()));
        inits.push(Stmt::assign(
            coord.clone(),
            Expr::load(starts.clone(), Expr::var(parent_iv.clone())),
        ));
        inits.push(Stmt::var_decl(coord_end.clone()));
        inits.push(Stmt::assign(
            coord_end.clone(),
            Expr::load(starts, Expr::add(Expr::var(parent_iv.clone()), Expr::int(1))),
        ));

        conds.push(Expr::lt(Expr::var(coord.clone()), Expr::var(coord_end)));

        col_binds.push(Stmt::var_decl(col.clone()));
        col_binds.push(Stmt::assign(col.clone(), Expr::load(columns, Expr::var(coord.clone()))));
        cols.push(col.clone());

        let step = Stmt::assign(coord.clone(), Expr::add(Expr::var(coord), Expr::int(1)));
        if sparse_uses.len() == 1 {
            advances.push(step);
        } else {
            advances.push(Stmt::if_then(
                Expr::binary(BinOp::Eq, Expr::var(col), Expr::var(iv.clone())),
                step,
            ));
        }
    }

    let cond = conds
        .into_iter()
        .reduce(Expr::and)
        .expect("at least one sparse use");

    let mut body = col_binds;
    body.push(compute_min(iv, &cols));
    body.push(inner);
    body.extend(advances);

    let mut stmts = inits;
    stmts.push(Stmt::while_loop(cond, Stmt::block(body)));
    Ok(Stmt::block(stmts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TensorStorage;
    use crate::types::{ElementType, IndexDomain, SetType, TensorType, Type};

    fn matrix(name: &str, m: i64, n: i64) -> Var {
        Var::new(
            name,
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::range(m), IndexDomain::range(n)],
            )),
        )
    }

    fn seed_dense(storage: &mut Storage, vars: &[&Var]) {
        for &var in vars {
            storage.add(var, TensorStorage::dense_row_major(true));
        }
    }

    /// S1: element-wise add over ranges lowers to nested dense loops.
    #[test]
    fn elementwise_add_lowers_to_dense_loops() {
        let a = matrix("A", 2, 3);
        let b = matrix("B", 2, 3);
        let c = matrix("C", 2, 3);
        let i = IndexVar::free("i", IndexDomain::range(2));
        let j = IndexVar::free("j", IndexDomain::range(3));
        let rhs = Expr::index_expr(
            vec![i.clone(), j.clone()],
            Expr::add(
                Expr::indexed_tensor(Expr::var(b.clone()), vec![i.clone(), j.clone()]),
                Expr::indexed_tensor(Expr::var(a.clone()), vec![i.clone(), j.clone()]),
            ),
        );
        let mut storage = Storage::new();
        seed_dense(&mut storage, &[&a, &b, &c]);
        let func = Func::internal("main", vec![], vec![], Stmt::assign(c, rhs))
            .with_storage(storage);

        let mut names = NameGenerator::new();
        let lowered = lower_index_expressions(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert_eq!(
            printed,
            "for i in 0:2:\n  for j in 0:3:\n    C(i,j) = (B(i,j) + A(i,j));\n"
        );
    }

    fn point_set(name: &str) -> Var {
        let elem = ElementType::new("Point", vec![]);
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

    /// S2: matrix-vector product on a graph: dense row loop, sparse column
    /// while, accumulator epilogue.
    #[test]
    fn sparse_matvec_lowers_to_while_loop() {
        let verts = point_set("V");
        let a = system_matrix("A", "V");
        let x = dense_vector("x", "V");
        let y = dense_vector("y", "V");

        let i = IndexVar::free("i", IndexDomain::set("V"));
        let j = IndexVar::sum("j", IndexDomain::set("V"));
        let rhs = Expr::index_expr(
            vec![i.clone()],
            Expr::mul(
                Expr::indexed_tensor(Expr::var(a.clone()), vec![i.clone(), j.clone()]),
                Expr::indexed_tensor(Expr::var(x.clone()), vec![j.clone()]),
            ),
        );

        let mut storage = Storage::new();
        storage.add(
            &a,
            TensorStorage::system_reduced(Expr::var(verts.clone()), Expr::var(verts.clone())),
        );
        seed_dense(&mut storage, &[&x, &y]);
        let func = Func::internal("main", vec![verts], vec![], Stmt::assign(y, rhs))
            .with_storage(storage);

        let mut names = NameGenerator::new();
        let lowered = lower_index_expressions(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.starts_with("for i in V:\n"), "{}", printed);
        assert!(printed.contains("acc0 = 0.0;"), "{}", printed);
        assert!(printed.contains("ijA = V.neighbors.start[i];"), "{}", printed);
        assert!(printed.contains("ijA_end = V.neighbors.start[(i + 1)];"), "{}", printed);
        assert!(printed.contains("while (ijA < ijA_end):"), "{}", printed);
        assert!(printed.contains("ijA_idx = V.neighbors[ijA];"), "{}", printed);
        assert!(printed.contains("// j = min(ijA_idx)"), "{}", printed);
        assert!(printed.contains("acc0 = (acc0 + (A(ijA) * x(j)));"), "{}", printed);
        assert!(printed.contains("ijA = (ijA + 1);"), "{}", printed);
        assert!(printed.contains("y(i) = acc0;"), "{}", printed);

        // The write sits after the while loop, inside the dense row loop.
        let while_pos = printed.find("while").unwrap();
        let write_pos = printed.find("y(i) = acc0").unwrap();
        assert!(write_pos > while_pos);
    }

    /// Two sparse operands zip their coordinates with a min-merge.
    #[test]
    fn sparse_add_merges_two_coordinates() {
        let verts = point_set("V");
        let a = system_matrix("A", "V");
        let b = system_matrix("B", "V");
        let c = system_matrix("C", "V");

        let i = IndexVar::free("i", IndexDomain::set("V"));
        let j = IndexVar::free("j", IndexDomain::set("V"));
        let rhs = Expr::index_expr(
            vec![i.clone(), j.clone()],
            Expr::add(
                Expr::indexed_tensor(Expr::var(a.clone()), vec![i.clone(), j.clone()]),
                Expr::indexed_tensor(Expr::var(b.clone()), vec![i.clone(), j.clone()]),
            ),
        );

        let mut storage = Storage::new();
        let reduced =
            TensorStorage::system_reduced(Expr::var(verts.clone()), Expr::var(verts.clone()));
        storage.add(&a, reduced.clone());
        storage.add(&b, reduced.clone());
        storage.add(&c, reduced);
        let func = Func::internal("main", vec![verts], vec![], Stmt::assign(c, rhs))
            .with_storage(storage);

        let mut names = NameGenerator::new();
        let lowered = lower_index_expressions(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("while ((ijA < ijA_end) and (ijB < ijB_end)):"), "{}", printed);
        assert!(printed.contains("// j = min(ijA_idx, ijB_idx)"), "{}", printed);
        // Binary min is a single branch, left-most wins ties.
        assert!(printed.contains("if (ijA_idx <= ijB_idx):"), "{}", printed);
        // Guarded advances.
        assert!(printed.contains("if (ijA_idx == j):"), "{}", printed);
        assert!(printed.contains("if (ijB_idx == j):"), "{}", printed);
        // Each operand reads at its own coordinate; the result reuses the
        // left-most one.
        assert!(printed.contains("C(ijA) = (A(ijA) + B(ijB))"), "{}", printed);
    }

    /// Full contraction to a scalar roots the loop at the reduction variable.
    #[test]
    fn scalar_contraction_uses_reduction_sources() {
        let x = Var::new(
            "x",
            Type::Tensor(TensorType::new(ScalarKind::Float, vec![IndexDomain::range(4)])),
        );
        let s = Var::new("s", Type::float());
        let i = IndexVar::sum("i", IndexDomain::range(4));
        let rhs = Expr::index_expr(
            vec![],
            Expr::mul(
                Expr::indexed_tensor(Expr::var(x.clone()), vec![i.clone()]),
                Expr::indexed_tensor(Expr::var(x.clone()), vec![i.clone()]),
            ),
        );
        let mut storage = Storage::new();
        seed_dense(&mut storage, &[&x]);
        let func = Func::internal("main", vec![], vec![], Stmt::assign(s, rhs))
            .with_storage(storage);

        let mut names = NameGenerator::new();
        let lowered = lower_index_expressions(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("acc0 = 0.0;"), "{}", printed);
        assert!(printed.contains("for i in 0:4:"), "{}", printed);
        assert!(printed.contains("acc0 = (acc0 + (x(i) * x(i)));"), "{}", printed);
        assert!(printed.contains("s = acc0;"), "{}", printed);
    }

    /// Matrix multiply: the free column loop lands inside the reduction loop,
    /// so the result accumulates in place.
    #[test]
    fn matmul_accumulates_into_target() {
        let a = matrix("A", 2, 4);
        let b = matrix("B", 4, 3);
        let c = matrix("C", 2, 3);
        let i = IndexVar::free("i", IndexDomain::range(2));
        let j = IndexVar::free("j", IndexDomain::range(3));
        let k = IndexVar::sum("k", IndexDomain::range(4));
        let rhs = Expr::index_expr(
            vec![i.clone(), j.clone()],
            Expr::mul(
                Expr::indexed_tensor(Expr::var(a.clone()), vec![i.clone(), k.clone()]),
                Expr::indexed_tensor(Expr::var(b.clone()), vec![k.clone(), j.clone()]),
            ),
        );
        let mut storage = Storage::new();
        seed_dense(&mut storage, &[&a, &b, &c]);
        let func = Func::internal("main", vec![], vec![], Stmt::assign(c, rhs))
            .with_storage(storage);

        let mut names = NameGenerator::new();
        let lowered = lower_index_expressions(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        // Loop order follows the DFS: i, then k, then j.
        assert_eq!(
            printed,
            "for i in 0:2:\n  for k in 0:4:\n    for j in 0:3:\n      \
             C(i,j) = (C(i,j) + (A(i,k) * B(k,j)));\n"
        );
    }
}
