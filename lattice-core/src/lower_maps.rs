//! Map lowering.
//!
//! `vars = map F to S with N reduce op` becomes an explicit loop over `S`.
//! The mapped function's body is inlined: element field reads become indexed
//! reads of the set's field arrays, endpoint tuple reads become reads through
//! the edge set's endpoint array (unrolled, the arity is static), and the
//! per-element results are bound to fresh locals that are combined into the
//! map outputs at the bottom of the loop body.
//!
//! Parallelisability is expressed, not enforced; whether iterations run
//! concurrently is the backend's choice.

use std::collections::HashMap;

use log::trace;

use crate::error::{DiagnosticSink, Result};
use crate::ir::{
    Expr, ExprKind, Func, IndexReadKind, Literal, MapStmt, NameGenerator, ReductionOp, Stmt,
    StmtKind, Var,
};
use crate::temporary_error;
use crate::types::{IndexSet, ScalarKind};
use crate::visitor::{walk_rewrite_expr, walk_rewrite_stmt, Rewriter};

pub fn lower_maps(
    func: &Func,
    names: &mut NameGenerator,
    sink: &mut DiagnosticSink,
) -> Result<Func> {
    let origin = func.name().to_string();
    let mut lowerer = MapLowerer { names, sink, origin, temps: Vec::new() };
    let func = lowerer.rewrite_func(func)?;

    // Per-element result locals need storage slots for access lowering.
    if lowerer.temps.is_empty() {
        return Ok(func);
    }
    let mut storage = func.storage().clone();
    for temp in &lowerer.temps {
        if temp.ty.is_tensor() && !temp.ty.is_scalar() {
            storage.add(temp, crate::storage::TensorStorage::dense_row_major(true));
        }
    }
    Ok(func.with_storage(storage))
}

struct MapLowerer<'a> {
    names: &'a mut NameGenerator,
    sink: &'a mut DiagnosticSink,
    origin: String,
    temps: Vec<Var>,
}

impl Rewriter for MapLowerer<'_> {
    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        if let StmtKind::Map(map) = s.kind() {
            if map.neighbors.is_some() && map.reduction.is_none() {
                // Endpoint writes of distinct edges can land on the same
                // element; without a reduction the last write wins.
                self.sink.warn(
                    &self.origin,
                    format!(
                        "unreduced map of '{}' over an edge set overwrites \
                         overlapping endpoint contributions",
                        map.function.name()
                    ),
                );
            }
            return lower_map(map, self.names, &mut self.temps);
        }
        walk_rewrite_stmt(self, s)
    }
}

fn target_index_set(target: &Expr) -> Result<IndexSet> {
    match target.kind() {
        ExprKind::VarRead(var) => Ok(IndexSet::Set(var.name.clone())),
        _ => Err(temporary_error!("map targets must be set variables")),
    }
}

fn target_arity(target: &Expr) -> usize {
    target
        .ty()
        .to_set()
        .map(|s| s.arity())
        .unwrap_or(0)
}

fn lower_map(map: &MapStmt, names: &mut NameGenerator, temps: &mut Vec<Var>) -> Result<Stmt> {
    let function = &map.function;
    let domain = target_index_set(&map.target)?;
    let loop_var = Var::int(names.fresh("i"));
    trace!("lowering map of {} over {}", function.name(), domain);

    let elem_arg = function
        .args()
        .first()
        .ok_or_else(|| temporary_error!("mapped function '{}' takes no element", function.name()))?
        .clone();
    let nbr_arg = function.args().get(1).cloned();

    let arity = target_arity(&map.target);
    if nbr_arg.is_some() && arity == 0 {
        return Err(temporary_error!(
            "mapped function '{}' takes endpoints but the target is not an edge set",
            function.name()
        ));
    }

    let mut body_stmts: Vec<Stmt> = Vec::new();

    // Bind the endpoints of the current edge; the arity is static, so the
    // endpoint reads are unrolled.
    let mut endpoints = Vec::new();
    if nbr_arg.is_some() {
        let ep_array = Expr::index_read(map.target.clone(), IndexReadKind::Endpoints);
        for k in 0..arity {
            let ep = Var::int(names.fresh("ep"));
            let offset = Expr::add(
                Expr::mul(Expr::var(loop_var.clone()), Expr::int(arity as i64)),
                Expr::int(k as i64),
            );
            body_stmts.push(Stmt::var_decl(ep.clone()));
            body_stmts.push(Stmt::assign(ep.clone(), Expr::load(ep_array.clone(), offset)));
            endpoints.push(ep);
        }
    }

    // Fresh locals for the per-element results.
    let mut renames: HashMap<String, Var> = HashMap::new();
    let mut result_temps = Vec::with_capacity(function.results().len());
    for res in function.results() {
        let temp = Var::new(names.fresh(&res.name), res.ty.clone());
        body_stmts.push(Stmt::var_decl(temp.clone()));
        renames.insert(res.name.clone(), temp.clone());
        temps.push(temp.clone());
        result_temps.push(temp);
    }

    // Inline the function body with element and endpoint substitution.
    let body = function.body().ok_or_else(|| {
        temporary_error!("cannot inline bodiless function '{}'", function.name())
    })?;
    let mut inliner = MapInliner {
        names,
        temps,
        elem_arg: elem_arg.name.clone(),
        nbr_arg: nbr_arg.as_ref().map(|v| v.name.clone()),
        target: map.target.clone(),
        neighbors: map.neighbors.clone(),
        loop_var: loop_var.clone(),
        endpoints: endpoints.clone(),
        renames,
    };
    body_stmts.push(inliner.rewrite_stmt(body)?);

    // Combine per-element results into the map outputs.
    for (out, temp) in map.vars.iter().zip(&result_temps) {
        let combine = if endpoints.is_empty() {
            combine_element(out, temp, &loop_var, map.reduction)?
        } else {
            combine_edge(out, temp, &endpoints, map.reduction)?
        };
        body_stmts.push(combine);
    }

    // A scalar output accumulates across every iteration, so it starts at
    // the reduction's neutral element before the loop.
    let mut prologue: Vec<Stmt> = Vec::new();
    if let Some(op) = map.reduction {
        for out in &map.vars {
            if !out.ty.is_scalar() {
                continue;
            }
            let component = out
                .ty
                .to_tensor()
                .map(|t| t.component)
                .unwrap_or(ScalarKind::Float);
            prologue.push(Stmt::var_decl(out.clone()));
            prologue.push(Stmt::assign(out.clone(), Expr::literal(op.neutral(component))));
        }
    }

    let loop_stmt = Stmt::for_loop(loop_var, domain, Stmt::block(body_stmts));
    if prologue.is_empty() {
        return Ok(loop_stmt);
    }
    prologue.push(loop_stmt);
    Ok(Stmt::block(prologue))
}

/// Combine one vertex-map result. Iterations touch disjoint rows, so plain
/// writes suffice even under a reduction.
fn combine_element(
    out: &Var,
    temp: &Var,
    loop_var: &Var,
    reduction: Option<ReductionOp>,
) -> Result<Stmt> {
    let order = out.ty.to_tensor().map(|t| t.order()).unwrap_or(0);
    let value = Expr::var(temp.clone());
    match order {
        0 => {
            // A scalar output reduces over all elements.
            let combined = match reduction {
                Some(ReductionOp::Sum) => Expr::add(Expr::var(out.clone()), value),
                None => value,
            };
            Ok(Stmt::assign(out.clone(), combined))
        }
        1 => Ok(Stmt::tensor_write(
            Expr::var(out.clone()),
            vec![Expr::var(loop_var.clone())],
            value,
        )),
        2 => {
            if !temp.ty.is_scalar() {
                return Err(temporary_error!(
                    "blocked contributions to assembled tensor '{}' are not supported",
                    out.name
                ));
            }
            Ok(Stmt::tensor_write(
                Expr::var(out.clone()),
                vec![Expr::var(loop_var.clone()), Expr::var(loop_var.clone())],
                value,
            ))
        }
        order => Err(temporary_error!(
            "assembled tensors of order {} are not supported (variable '{}')",
            order,
            out.name
        )),
    }
}

/// Combine one edge-map result: each endpoint (or endpoint pair) receives one
/// scalar contribution from the per-edge result tensor.
fn combine_edge(
    out: &Var,
    temp: &Var,
    endpoints: &[Var],
    reduction: Option<ReductionOp>,
) -> Result<Stmt> {
    let order = out.ty.to_tensor().map(|t| t.order()).unwrap_or(0);
    let temp_tensor = temp.ty.to_tensor();
    let accumulate = |target: Expr, indices: Vec<Expr>, value: Expr| match reduction {
        Some(ReductionOp::Sum) => {
            let read = Expr::tensor_read(target.clone(), indices.clone());
            Stmt::tensor_write(target, indices, Expr::add(read, value))
        }
        None => Stmt::tensor_write(target, indices, value),
    };

    match order {
        1 => {
            // One contribution per endpoint.
            let ok = temp_tensor
                .map(|t| t.order() == 1 && t.is_element_tensor())
                .unwrap_or(false);
            if !ok {
                return Err(temporary_error!(
                    "edge map result '{}' must produce one value per endpoint",
                    temp.name
                ));
            }
            let mut writes = Vec::with_capacity(endpoints.len());
            for (a, ep) in endpoints.iter().enumerate() {
                let contribution =
                    Expr::tensor_read(Expr::var(temp.clone()), vec![Expr::int(a as i64)]);
                writes.push(accumulate(
                    Expr::var(out.clone()),
                    vec![Expr::var(ep.clone())],
                    contribution,
                ));
            }
            Ok(Stmt::block(writes))
        }
        2 => {
            // One contribution per endpoint pair.
            let ok = temp_tensor
                .map(|t| t.order() == 2 && t.is_element_tensor())
                .unwrap_or(false);
            if !ok {
                return Err(temporary_error!(
                    "edge map result '{}' must produce one value per endpoint pair",
                    temp.name
                ));
            }
            let mut writes = Vec::with_capacity(endpoints.len() * endpoints.len());
            for (a, ep_a) in endpoints.iter().enumerate() {
                for (b, ep_b) in endpoints.iter().enumerate() {
                    let contribution = Expr::tensor_read(
                        Expr::var(temp.clone()),
                        vec![Expr::int(a as i64), Expr::int(b as i64)],
                    );
                    writes.push(accumulate(
                        Expr::var(out.clone()),
                        vec![Expr::var(ep_a.clone()), Expr::var(ep_b.clone())],
                        contribution,
                    ));
                }
            }
            Ok(Stmt::block(writes))
        }
        order => Err(temporary_error!(
            "assembled tensors of order {} are not supported (variable '{}')",
            order,
            out.name
        )),
    }
}

/// Substitutes element/endpoint references while inlining a mapped function.
struct MapInliner<'a> {
    names: &'a mut NameGenerator,
    temps: &'a mut Vec<Var>,
    elem_arg: String,
    nbr_arg: Option<String>,
    target: Expr,
    neighbors: Option<Expr>,
    loop_var: Var,
    endpoints: Vec<Var>,
    renames: HashMap<String, Var>,
}

impl MapInliner<'_> {
    fn endpoint_for(&self, index: &Expr) -> Result<Var> {
        let k = match index.kind() {
            ExprKind::Literal(Literal::Int(k)) => *k as usize,
            _ => {
                return Err(temporary_error!(
                    "endpoint tuples must be read with a static index"
                ))
            }
        };
        self.endpoints.get(k).cloned().ok_or_else(|| {
            temporary_error!("endpoint index {} exceeds the edge arity", k)
        })
    }
}

impl Rewriter for MapInliner<'_> {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        match e.kind() {
            // e.f  ->  S.f(i)
            ExprKind::FieldRead { target, field } => match target.kind() {
                ExprKind::VarRead(v) if v.name == self.elem_arg => Ok(Expr::tensor_read(
                    Expr::field_read(self.target.clone(), field.clone()),
                    vec![Expr::var(self.loop_var.clone())],
                )),
                // nbrs(k).f  ->  N.f(ep_k)
                ExprKind::TupleRead { tuple, index }
                    if matches!(
                        (tuple.kind(), &self.nbr_arg),
                        (ExprKind::VarRead(v), Some(nbr)) if v.name == *nbr
                    ) =>
                {
                    let neighbors = self.neighbors.clone().ok_or_else(|| {
                        temporary_error!("endpoint read without a neighbour set")
                    })?;
                    let ep = self.endpoint_for(index)?;
                    Ok(Expr::tensor_read(
                        Expr::field_read(neighbors, field.clone()),
                        vec![Expr::var(ep)],
                    ))
                }
                _ => walk_rewrite_expr(self, e),
            },
            ExprKind::VarRead(v) => {
                if let Some(renamed) = self.renames.get(&v.name) {
                    return Ok(Expr::var(renamed.clone()));
                }
                if v.name == self.elem_arg || Some(&v.name) == self.nbr_arg.as_ref() {
                    return Err(temporary_error!(
                        "unsupported use of map argument '{}' outside a field access",
                        v.name
                    ));
                }
                Ok(e.clone())
            }
            _ => walk_rewrite_expr(self, e),
        }
    }

    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        match s.kind() {
            StmtKind::VarDecl { var } => {
                let renamed = Var::new(self.names.fresh(&var.name), var.ty.clone());
                self.renames.insert(var.name.clone(), renamed.clone());
                self.temps.push(renamed.clone());
                Ok(Stmt::var_decl(renamed))
            }
            StmtKind::Assign { var, value } => {
                let value2 = self.rewrite_expr(value)?;
                let var2 = self.renames.get(&var.name).cloned().unwrap_or_else(|| var.clone());
                if var2 == *var && Expr::ptr_eq(value, &value2) {
                    return Ok(s.clone());
                }
                Ok(Stmt::assign(var2, value2))
            }
            // e.f = v  ->  S.f(i) = v
            StmtKind::FieldWrite { target, field, value } => match target.kind() {
                ExprKind::VarRead(v) if v.name == self.elem_arg => {
                    let value2 = self.rewrite_expr(value)?;
                    Ok(Stmt::tensor_write(
                        Expr::field_read(self.target.clone(), field.clone()),
                        vec![Expr::var(self.loop_var.clone())],
                        value2,
                    ))
                }
                _ => walk_rewrite_stmt(self, s),
            },
            _ => walk_rewrite_stmt(self, s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementType, IndexDomain, ScalarKind, SetType, TensorType, Type};

    fn cell_element() -> ElementType {
        ElementType::new("Cell", vec![
            ("h".into(), TensorType::scalar(ScalarKind::Float)),
        ])
    }

    /// `map F to Cells reduce +` with F writing one scalar per cell.
    #[test]
    fn vertex_map_becomes_a_loop() {
        let elem = cell_element();
        let cells = Var::new("Cells", Type::Set(SetType::new(elem.clone())));
        let y = Var::new(
            "y",
            Type::Tensor(TensorType::new(ScalarKind::Float, vec![IndexDomain::set("Cells")])),
        );
        let r = Var::new("r", Type::float());
        let f = Func::internal(
            "f",
            vec![Var::new("c", Type::Element(elem))],
            vec![r.clone()],
            Stmt::assign(
                r.clone(),
                Expr::mul(
                    Expr::field_read(Expr::var(Var::new("c", Type::Element(cell_element()))), "h"),
                    Expr::float(2.0),
                ),
            ),
        );
        let body = Stmt::map(MapStmt {
            vars: vec![y.clone()],
            function: f,
            target: Expr::var(cells.clone()),
            neighbors: None,
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![cells], vec![y], body);

        let mut names = NameGenerator::new();
        let lowered = lower_maps(&func, &mut names, &mut DiagnosticSink::new()).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("for i0 in Cells:"), "{}", printed);
        assert!(printed.contains("r1 = (Cells.h(i0) * 2.0);"), "{}", printed);
        assert!(printed.contains("y(i0) = r1;"), "{}", printed);
    }

    /// A scalar output reduces over every element; it is zeroed before the
    /// loop and accumulated inside it.
    #[test]
    fn scalar_map_reduce_starts_at_zero() {
        let elem = cell_element();
        let cells = Var::new("Cells", Type::Set(SetType::new(elem.clone())));
        let total = Var::new("total", Type::float());
        let r = Var::new("r", Type::float());
        let f = Func::internal(
            "ke",
            vec![Var::new("c", Type::Element(elem))],
            vec![r.clone()],
            Stmt::assign(
                r.clone(),
                Expr::field_read(Expr::var(Var::new("c", Type::Element(cell_element()))), "h"),
            ),
        );
        let body = Stmt::map(MapStmt {
            vars: vec![total.clone()],
            function: f,
            target: Expr::var(cells.clone()),
            neighbors: None,
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![cells], vec![], body);

        let mut names = NameGenerator::new();
        let lowered = lower_maps(&func, &mut names, &mut DiagnosticSink::new()).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("var total : float;"), "{}", printed);
        assert!(printed.contains("total = 0.0;"), "{}", printed);
        assert!(printed.contains("total = (total + r1);"), "{}", printed);
        // The zero-init sits before the loop.
        let init = printed.find("total = 0.0;").unwrap();
        let loop_pos = printed.find("for i0 in Cells:").unwrap();
        assert!(init < loop_pos, "{}", printed);
    }

    /// Edge maps read endpoints through the endpoint array and accumulate
    /// per-endpoint-pair contributions.
    #[test]
    fn edge_map_assembles_through_endpoints() {
        let point = ElementType::new("Point", vec![
            ("w".into(), TensorType::scalar(ScalarKind::Float)),
        ]);
        let spring = ElementType::new("Spring", vec![]);
        let points = Var::new("P", Type::Set(SetType::new(point.clone())));
        let springs = Var::new(
            "S",
            Type::Set(SetType::edge(spring.clone(), vec!["P".into(), "P".into()])),
        );
        let a = Var::new(
            "A",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("P"), IndexDomain::set("P")],
            )),
        );

        let block = Var::new(
            "K",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::range(2), IndexDomain::range(2)],
            )),
        );
        let s_arg = Var::new("s", Type::Element(spring));
        let p_arg = Var::new(
            "ps",
            Type::Tuple(crate::types::TupleType { element: point, size: 2 }),
        );
        let f = Func::internal(
            "stiffness",
            vec![s_arg, p_arg.clone()],
            vec![block.clone()],
            Stmt::tensor_write(
                Expr::var(block.clone()),
                vec![Expr::int(0), Expr::int(1)],
                Expr::field_read(Expr::tuple_read(Expr::var(p_arg), Expr::int(0)), "w"),
            ),
        );

        let body = Stmt::map(MapStmt {
            vars: vec![a.clone()],
            function: f,
            target: Expr::var(springs.clone()),
            neighbors: Some(Expr::var(points.clone())),
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![points, springs], vec![], body);

        let mut names = NameGenerator::new();
        let lowered = lower_maps(&func, &mut names, &mut DiagnosticSink::new()).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("for i0 in S:"), "{}", printed);
        // Unrolled endpoint binds.
        assert!(printed.contains("ep1 = S.endpoints[((i0 * 2) + 0)];"), "{}", printed);
        assert!(printed.contains("ep2 = S.endpoints[((i0 * 2) + 1)];"), "{}", printed);
        // The endpoint field read goes through the neighbour set.
        assert!(printed.contains("P.w(ep1)"), "{}", printed);
        // Accumulating endpoint-pair writes.
        assert!(printed.contains("A(ep1,ep2) = (A(ep1,ep2) + K3(0,1));"), "{}", printed);
    }

    #[test]
    fn map_of_order_three_output_is_rejected() {
        let elem = cell_element();
        let cells = Var::new("Cells", Type::Set(SetType::new(elem.clone())));
        let t = Var::new(
            "T",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![
                    IndexDomain::set("Cells"),
                    IndexDomain::set("Cells"),
                    IndexDomain::set("Cells"),
                ],
            )),
        );
        let r = Var::new("r", Type::float());
        let f = Func::internal(
            "f",
            vec![Var::new("c", Type::Element(elem))],
            vec![r.clone()],
            Stmt::assign(r, Expr::float(0.0)),
        );
        let body = Stmt::map(MapStmt {
            vars: vec![t],
            function: f,
            target: Expr::var(cells.clone()),
            neighbors: None,
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![cells], vec![], body);

        let mut names = NameGenerator::new();
        let err = lower_maps(&func, &mut names, &mut DiagnosticSink::new()).unwrap_err();
        assert!(matches!(err, crate::error::CompilerError::Temporary { .. }));
    }
}
