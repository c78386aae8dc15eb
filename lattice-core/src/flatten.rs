//! Index-expression flattening.
//!
//! After this pass, the rhs of every index expression is a leaf-level
//! arithmetic combination of `IndexedTensor` nodes whose tensor operand is a
//! plain variable reference. Nested index expressions are lifted into fresh
//! temporaries bound immediately before the enclosing statement.

use log::trace;

use crate::error::Result;
use crate::ir::{Expr, ExprKind, Func, NameGenerator, Stmt, Var};
use crate::visitor::{walk_rewrite_expr, walk_rewrite_stmt, Rewriter};

pub fn flatten_index_expressions(func: &Func, names: &mut NameGenerator) -> Result<Func> {
    let mut flattener = Flattener { names, hoisted: Vec::new() };
    flattener.rewrite_func(func)
}

struct Flattener<'a> {
    names: &'a mut NameGenerator,
    /// Temporaries pending insertion before the enclosing statement.
    hoisted: Vec<Stmt>,
}

impl Flattener<'_> {
    /// Bind `value` to a fresh temporary and return a reference to it.
    fn hoist(&mut self, value: Expr) -> Var {
        let name = self.names.fresh("t");
        let temp = Var::new(name, value.ty().clone());
        trace!("hoisting index expression into {}", temp.name);
        self.hoisted.push(Stmt::var_decl(temp.clone()));
        self.hoisted.push(Stmt::assign(temp.clone(), value));
        temp
    }

    /// Flatten the rhs of an index expression.
    fn flatten_rhs(&mut self, e: &Expr) -> Result<Expr> {
        match e.kind() {
            ExprKind::IndexedTensor { tensor, index_vars } => match tensor.kind() {
                ExprKind::VarRead(_) => Ok(e.clone()),
                _ => {
                    // A computed tensor operand; flatten it first, then give
                    // it a name.
                    let flat = self.rewrite_expr(tensor)?;
                    let temp = self.hoist(flat);
                    Ok(Expr::indexed_tensor(Expr::var(temp), index_vars.clone()))
                }
            },
            ExprKind::IndexExpr { result_vars, .. } => {
                // A nested index expression used directly as a value: name it
                // and read it back through its free variables.
                let flat = self.rewrite_expr(e)?;
                let temp = self.hoist(flat);
                Ok(Expr::indexed_tensor(Expr::var(temp), result_vars.clone()))
            }
            ExprKind::Unary { op, a } => {
                let a2 = self.flatten_rhs(a)?;
                if Expr::ptr_eq(a, &a2) {
                    Ok(e.clone())
                } else {
                    Ok(Expr::new(e.ty().clone(), ExprKind::Unary { op: *op, a: a2 }))
                }
            }
            ExprKind::Binary { op, a, b } => {
                let a2 = self.flatten_rhs(a)?;
                let b2 = self.flatten_rhs(b)?;
                if Expr::ptr_eq(a, &a2) && Expr::ptr_eq(b, &b2) {
                    Ok(e.clone())
                } else {
                    Ok(Expr::binary(*op, a2, b2))
                }
            }
            ExprKind::Call { func, args } => {
                let mut changed = false;
                let mut args2 = Vec::with_capacity(args.len());
                for arg in args {
                    let arg2 = self.flatten_rhs(arg)?;
                    changed |= !Expr::ptr_eq(arg, &arg2);
                    args2.push(arg2);
                }
                if changed {
                    Ok(Expr::call(func.clone(), args2))
                } else {
                    Ok(e.clone())
                }
            }
            _ => Ok(e.clone()),
        }
    }
}

impl Rewriter for Flattener<'_> {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        if let ExprKind::IndexExpr { result_vars, rhs } = e.kind() {
            let rhs2 = self.flatten_rhs(rhs)?;
            if Expr::ptr_eq(rhs, &rhs2) {
                return Ok(e.clone());
            }
            return Ok(Expr::index_expr(result_vars.clone(), rhs2));
        }
        walk_rewrite_expr(self, e)
    }

    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        let pending = self.hoisted.len();
        let s2 = walk_rewrite_stmt(self, s)?;
        if self.hoisted.len() == pending {
            return Ok(s2);
        }
        // Temporaries bound by this statement's expressions go right before it.
        let mut stmts: Vec<Stmt> = self.hoisted.split_off(pending);
        stmts.push(s2);
        Ok(Stmt::block(stmts))
    }
}
