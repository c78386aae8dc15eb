//! Temporary insertion.
//!
//! Two situations get a named intermediate:
//!
//! 1. An index expression that reads the tensor it is being assigned to
//!    (a write-then-read aliasing hazard, e.g. a transpose onto itself).
//! 2. An aggregate produced directly into a function result or global, which
//!    later passes expect to have a locally named storage slot (map outputs
//!    and index-expression results).
//!
//! Temporaries are declared immediately before the producing statement, in
//! the innermost block containing it.

use std::collections::HashSet;
use std::ops::ControlFlow;

use log::trace;

use crate::error::Result;
use crate::ir::{Expr, ExprKind, Func, MapStmt, NameGenerator, Stmt, StmtKind, Var};
use crate::visitor::{walk_expr, walk_rewrite_stmt, Rewriter, Visitor};

pub fn insert_temporaries(func: &Func, names: &mut NameGenerator) -> Result<Func> {
    let mut non_locals: HashSet<String> = HashSet::new();
    for res in func.results() {
        non_locals.insert(res.name.clone());
    }
    for global in &func.env().globals {
        non_locals.insert(global.name.clone());
    }

    let mut inserter = TempInserter { names, non_locals };
    inserter.rewrite_func(func)
}

struct TempInserter<'a> {
    names: &'a mut NameGenerator,
    non_locals: HashSet<String>,
}

impl TempInserter<'_> {
    fn fresh_temp(&mut self, like: &Var) -> Var {
        let name = self.names.fresh("tmp");
        trace!("binding {} through temporary {}", like.name, name);
        Var::new(name, like.ty.clone())
    }
}

/// Whether `expr` reads `var` anywhere.
fn reads_var(expr: &Expr, var: &Var) -> bool {
    struct ReadsVar<'a> {
        var: &'a Var,
    }
    impl Visitor for ReadsVar<'_> {
        type Break = ();
        fn visit_var_read(&mut self, _e: &Expr, var: &Var) -> ControlFlow<()> {
            if var.name == self.var.name {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }
    walk_expr(&mut ReadsVar { var }, expr).is_break()
}

impl Rewriter for TempInserter<'_> {
    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        match s.kind() {
            StmtKind::Assign { var, value }
                if matches!(value.kind(), ExprKind::IndexExpr { .. })
                    && (reads_var(value, var) || self.non_locals.contains(&var.name)) =>
            {
                let temp = self.fresh_temp(var);
                Ok(Stmt::block(vec![
                    Stmt::var_decl(temp.clone()),
                    Stmt::assign(temp.clone(), value.clone()),
                    Stmt::assign(var.clone(), Expr::var(temp)),
                ]))
            }
            StmtKind::Map(map) if map.vars.iter().any(|v| self.non_locals.contains(&v.name)) => {
                let mut stmts = Vec::new();
                let mut vars = Vec::with_capacity(map.vars.len());
                let mut copies = Vec::new();
                for var in &map.vars {
                    if self.non_locals.contains(&var.name) {
                        let temp = self.fresh_temp(var);
                        stmts.push(Stmt::var_decl(temp.clone()));
                        copies.push(Stmt::assign(var.clone(), Expr::var(temp.clone())));
                        vars.push(temp);
                    } else {
                        vars.push(var.clone());
                    }
                }
                stmts.push(Stmt::map(MapStmt {
                    vars,
                    function: map.function.clone(),
                    target: map.target.clone(),
                    neighbors: map.neighbors.clone(),
                    reduction: map.reduction,
                }));
                stmts.extend(copies);
                Ok(Stmt::block(stmts))
            }
            _ => walk_rewrite_stmt(self, s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IndexVar, ReductionOp};
    use crate::types::{ElementType, IndexDomain, ScalarKind, SetType, TensorType, Type};

    fn matrix(name: &str, n: i64) -> Var {
        Var::new(
            name,
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::range(n), IndexDomain::range(n)],
            )),
        )
    }

    #[test]
    fn transpose_onto_itself_gets_a_temp() {
        let c = matrix("C", 3);
        let i = IndexVar::free("i", IndexDomain::range(3));
        let j = IndexVar::free("j", IndexDomain::range(3));
        let rhs = Expr::index_expr(
            vec![i.clone(), j.clone()],
            Expr::indexed_tensor(Expr::var(c.clone()), vec![j, i]),
        );
        let func = Func::internal("main", vec![], vec![], Stmt::assign(c.clone(), rhs));

        let mut names = NameGenerator::new();
        let with_temps = insert_temporaries(&func, &mut names).unwrap();

        let stmts = match with_temps.body().unwrap().kind() {
            StmtKind::Block(stmts) => stmts.clone(),
            other => panic!("expected block, got {:?}", other),
        };
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0].kind(), StmtKind::VarDecl { var } if var.name == "tmp0"));
        assert!(matches!(stmts[1].kind(), StmtKind::Assign { var, .. } if var.name == "tmp0"));
        match stmts[2].kind() {
            StmtKind::Assign { var, value } => {
                assert_eq!(var.name, "C");
                assert_eq!(value.to_string(), "tmp0");
            }
            other => panic!("expected copy-back, got {:?}", other),
        }
    }

    #[test]
    fn hazard_free_assignment_is_unchanged() {
        let c = matrix("C", 3);
        let d = matrix("D", 3);
        let i = IndexVar::free("i", IndexDomain::range(3));
        let j = IndexVar::free("j", IndexDomain::range(3));
        let rhs = Expr::index_expr(
            vec![i.clone(), j.clone()],
            Expr::indexed_tensor(Expr::var(d), vec![i, j]),
        );
        let func = Func::internal("main", vec![], vec![], Stmt::assign(c, rhs));

        let mut names = NameGenerator::new();
        let with_temps = insert_temporaries(&func, &mut names).unwrap();
        assert!(Stmt::ptr_eq(func.body().unwrap(), with_temps.body().unwrap()));
    }

    #[test]
    fn map_into_result_goes_through_a_local() {
        let elem = ElementType::new("Cell", vec![]);
        let cells = Var::new("Cells", Type::Set(SetType::new(elem.clone())));
        let y = Var::new(
            "y",
            Type::Tensor(TensorType::new(ScalarKind::Float, vec![IndexDomain::set("Cells")])),
        );
        let f = Func::internal(
            "f",
            vec![Var::new("c", Type::Element(elem))],
            vec![Var::new("r", Type::float())],
            Stmt::assign(Var::new("r", Type::float()), Expr::float(1.0)),
        );
        let body = Stmt::map(MapStmt {
            vars: vec![y.clone()],
            function: f,
            target: Expr::var(cells.clone()),
            neighbors: None,
            reduction: Some(ReductionOp::Sum),
        });
        let func = Func::internal("main", vec![cells], vec![y.clone()], body);

        let mut names = NameGenerator::new();
        let with_temps = insert_temporaries(&func, &mut names).unwrap();

        let stmts = match with_temps.body().unwrap().kind() {
            StmtKind::Block(stmts) => stmts.clone(),
            other => panic!("expected block, got {:?}", other),
        };
        assert_eq!(stmts.len(), 3);
        match stmts[1].kind() {
            StmtKind::Map(map) => assert_eq!(map.vars[0].name, "tmp0"),
            other => panic!("expected map, got {:?}", other),
        }
        match stmts[2].kind() {
            StmtKind::Assign { var, value } => {
                assert_eq!(var.name, "y");
                assert_eq!(value.to_string(), "tmp0");
            }
            other => panic!("expected copy-back, got {:?}", other),
        }
    }
}
