//! IR traversal: visitors, rewriters, and call-graph variants.
//!
//! [`Visitor`] exposes one hook per node kind; the default hook descends into
//! children in declared order via the `walk_*` functions, so implementors
//! override only what they need. The `Break` associated type lets a visitor
//! short-circuit traversal.
//!
//! [`Rewriter`] reconstructs nodes bottom-up. When every child of a node comes
//! back pointer-equal, the original handle is returned unchanged, so shared
//! subtrees stay shared across passes.

use std::collections::HashMap;
use std::ops::ControlFlow;

use crate::error::Result;
use crate::ir::{
    Expr, ExprKind, Func, FuncKind, IndexReadKind, IndexVar, Literal, MapStmt, ShardDimension,
    Stmt, StmtKind, Var,
};
use crate::types::IndexSet;

pub trait Visitor: Sized {
    type Break;

    fn visit_expr(&mut self, e: &Expr) -> ControlFlow<Self::Break> {
        walk_expr(self, e)
    }

    fn visit_stmt(&mut self, s: &Stmt) -> ControlFlow<Self::Break> {
        walk_stmt(self, s)
    }

    // --- Expression hooks ---

    fn visit_literal(&mut self, _e: &Expr, _lit: &Literal) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn visit_var_read(&mut self, _e: &Expr, _var: &Var) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn visit_field_read(&mut self, _e: &Expr, target: &Expr, _field: &str) -> ControlFlow<Self::Break> {
        self.visit_expr(target)
    }

    fn visit_tensor_read(
        &mut self,
        _e: &Expr,
        tensor: &Expr,
        indices: &[Expr],
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(tensor)?;
        for index in indices {
            self.visit_expr(index)?;
        }
        ControlFlow::Continue(())
    }

    fn visit_tuple_read(&mut self, _e: &Expr, tuple: &Expr, index: &Expr) -> ControlFlow<Self::Break> {
        self.visit_expr(tuple)?;
        self.visit_expr(index)
    }

    fn visit_index_read(
        &mut self,
        _e: &Expr,
        set: &Expr,
        _kind: IndexReadKind,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(set)
    }

    fn visit_length(&mut self, _e: &Expr, _set: &IndexSet) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn visit_indexed_tensor(
        &mut self,
        _e: &Expr,
        tensor: &Expr,
        _index_vars: &[IndexVar],
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(tensor)
    }

    fn visit_index_expr(
        &mut self,
        _e: &Expr,
        _result_vars: &[IndexVar],
        rhs: &Expr,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(rhs)
    }

    fn visit_unary(&mut self, _e: &Expr, a: &Expr) -> ControlFlow<Self::Break> {
        self.visit_expr(a)
    }

    fn visit_binary(&mut self, _e: &Expr, a: &Expr, b: &Expr) -> ControlFlow<Self::Break> {
        self.visit_expr(a)?;
        self.visit_expr(b)
    }

    fn visit_call(&mut self, _e: &Expr, _func: &Func, args: &[Expr]) -> ControlFlow<Self::Break> {
        for arg in args {
            self.visit_expr(arg)?;
        }
        ControlFlow::Continue(())
    }

    fn visit_load(&mut self, _e: &Expr, buffer: &Expr, index: &Expr) -> ControlFlow<Self::Break> {
        self.visit_expr(buffer)?;
        self.visit_expr(index)
    }

    fn visit_thread_idx(&mut self, _e: &Expr, _dim: ShardDimension) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    // --- Statement hooks ---

    fn visit_assign(&mut self, _s: &Stmt, _var: &Var, value: &Expr) -> ControlFlow<Self::Break> {
        self.visit_expr(value)
    }

    fn visit_field_write(
        &mut self,
        _s: &Stmt,
        target: &Expr,
        _field: &str,
        value: &Expr,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(target)?;
        self.visit_expr(value)
    }

    fn visit_tensor_write(
        &mut self,
        _s: &Stmt,
        tensor: &Expr,
        indices: &[Expr],
        value: &Expr,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(tensor)?;
        for index in indices {
            self.visit_expr(index)?;
        }
        self.visit_expr(value)
    }

    fn visit_store(
        &mut self,
        _s: &Stmt,
        buffer: &Expr,
        index: &Expr,
        value: &Expr,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(buffer)?;
        self.visit_expr(index)?;
        self.visit_expr(value)
    }

    fn visit_var_decl(&mut self, _s: &Stmt, _var: &Var) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn visit_block(&mut self, _s: &Stmt, stmts: &[Stmt]) -> ControlFlow<Self::Break> {
        for stmt in stmts {
            self.visit_stmt(stmt)?;
        }
        ControlFlow::Continue(())
    }

    fn visit_for(
        &mut self,
        _s: &Stmt,
        _var: &Var,
        _domain: &IndexSet,
        body: &Stmt,
    ) -> ControlFlow<Self::Break> {
        self.visit_stmt(body)
    }

    fn visit_while(&mut self, _s: &Stmt, cond: &Expr, body: &Stmt) -> ControlFlow<Self::Break> {
        self.visit_expr(cond)?;
        self.visit_stmt(body)
    }

    fn visit_if_then_else(
        &mut self,
        _s: &Stmt,
        cond: &Expr,
        then_body: &Stmt,
        else_body: Option<&Stmt>,
    ) -> ControlFlow<Self::Break> {
        self.visit_expr(cond)?;
        self.visit_stmt(then_body)?;
        if let Some(els) = else_body {
            self.visit_stmt(els)?;
        }
        ControlFlow::Continue(())
    }

    fn visit_comment(&mut self, _s: &Stmt, _text: &str, body: &Stmt) -> ControlFlow<Self::Break> {
        self.visit_stmt(body)
    }

    fn visit_map(&mut self, _s: &Stmt, map: &MapStmt) -> ControlFlow<Self::Break> {
        self.visit_expr(&map.target)?;
        if let Some(neighbors) = &map.neighbors {
            self.visit_expr(neighbors)?;
        }
        ControlFlow::Continue(())
    }

    fn visit_gpu_for(
        &mut self,
        _s: &Stmt,
        _var: &Var,
        _domain: &IndexSet,
        _dim: ShardDimension,
        body: &Stmt,
    ) -> ControlFlow<Self::Break> {
        self.visit_stmt(body)
    }

    fn visit_barrier(&mut self, _s: &Stmt) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }

    fn visit_pass(&mut self, _s: &Stmt) -> ControlFlow<Self::Break> {
        ControlFlow::Continue(())
    }
}

pub fn walk_expr<V: Visitor>(v: &mut V, e: &Expr) -> ControlFlow<V::Break> {
    match e.kind() {
        ExprKind::Literal(lit) => v.visit_literal(e, lit),
        ExprKind::VarRead(var) => v.visit_var_read(e, var),
        ExprKind::FieldRead { target, field } => v.visit_field_read(e, target, field),
        ExprKind::TensorRead { tensor, indices } => v.visit_tensor_read(e, tensor, indices),
        ExprKind::TupleRead { tuple, index } => v.visit_tuple_read(e, tuple, index),
        ExprKind::IndexRead { set, kind } => v.visit_index_read(e, set, *kind),
        ExprKind::Length(set) => v.visit_length(e, set),
        ExprKind::IndexedTensor { tensor, index_vars } => {
            v.visit_indexed_tensor(e, tensor, index_vars)
        }
        ExprKind::IndexExpr { result_vars, rhs } => v.visit_index_expr(e, result_vars, rhs),
        ExprKind::Unary { a, .. } => v.visit_unary(e, a),
        ExprKind::Binary { a, b, .. } => v.visit_binary(e, a, b),
        ExprKind::Call { func, args } => v.visit_call(e, func, args),
        ExprKind::Load { buffer, index } => v.visit_load(e, buffer, index),
        ExprKind::ThreadIdx(dim) => v.visit_thread_idx(e, *dim),
    }
}

pub fn walk_stmt<V: Visitor>(v: &mut V, s: &Stmt) -> ControlFlow<V::Break> {
    match s.kind() {
        StmtKind::Assign { var, value } => v.visit_assign(s, var, value),
        StmtKind::FieldWrite { target, field, value } => v.visit_field_write(s, target, field, value),
        StmtKind::TensorWrite { tensor, indices, value } => {
            v.visit_tensor_write(s, tensor, indices, value)
        }
        StmtKind::Store { buffer, index, value } => v.visit_store(s, buffer, index, value),
        StmtKind::VarDecl { var } => v.visit_var_decl(s, var),
        StmtKind::Block(stmts) => v.visit_block(s, stmts),
        StmtKind::For { var, domain, body } => v.visit_for(s, var, domain, body),
        StmtKind::While { cond, body } => v.visit_while(s, cond, body),
        StmtKind::IfThenElse { cond, then_body, else_body } => {
            v.visit_if_then_else(s, cond, then_body, else_body.as_ref())
        }
        StmtKind::Comment { text, body } => v.visit_comment(s, text, body),
        StmtKind::Map(map) => v.visit_map(s, map),
        StmtKind::GPUFor { var, domain, dimension, body } => {
            v.visit_gpu_for(s, var, domain, *dimension, body)
        }
        StmtKind::Barrier => v.visit_barrier(s),
        StmtKind::Pass => v.visit_pass(s),
    }
}

/// Bottom-up rewriter. Implementors override `rewrite_expr` or `rewrite_stmt`
/// and delegate to the `walk_rewrite_*` functions for the cases they do not
/// handle; the walks reconstruct nodes only when a child actually changed.
pub trait Rewriter {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        walk_rewrite_expr(self, e)
    }

    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        walk_rewrite_stmt(self, s)
    }

    fn rewrite_func(&mut self, f: &Func) -> Result<Func> {
        walk_rewrite_func(self, f)
    }
}

fn rewrite_expr_list<R: Rewriter + ?Sized>(
    r: &mut R,
    exprs: &[Expr],
) -> Result<(Vec<Expr>, bool)> {
    let mut changed = false;
    let mut out = Vec::with_capacity(exprs.len());
    for e in exprs {
        let e2 = r.rewrite_expr(e)?;
        changed |= !Expr::ptr_eq(e, &e2);
        out.push(e2);
    }
    Ok((out, changed))
}

pub fn walk_rewrite_expr<R: Rewriter + ?Sized>(r: &mut R, e: &Expr) -> Result<Expr> {
    let rewritten = match e.kind() {
        ExprKind::Literal(_)
        | ExprKind::VarRead(_)
        | ExprKind::Length(_)
        | ExprKind::ThreadIdx(_) => return Ok(e.clone()),
        ExprKind::FieldRead { target, field } => {
            let target2 = r.rewrite_expr(target)?;
            if Expr::ptr_eq(target, &target2) {
                return Ok(e.clone());
            }
            Expr::field_read(target2, field.clone())
        }
        ExprKind::TensorRead { tensor, indices } => {
            let tensor2 = r.rewrite_expr(tensor)?;
            let (indices2, indices_changed) = rewrite_expr_list(r, indices)?;
            if Expr::ptr_eq(tensor, &tensor2) && !indices_changed {
                return Ok(e.clone());
            }
            Expr::tensor_read(tensor2, indices2)
        }
        ExprKind::TupleRead { tuple, index } => {
            let tuple2 = r.rewrite_expr(tuple)?;
            let index2 = r.rewrite_expr(index)?;
            if Expr::ptr_eq(tuple, &tuple2) && Expr::ptr_eq(index, &index2) {
                return Ok(e.clone());
            }
            Expr::tuple_read(tuple2, index2)
        }
        ExprKind::IndexRead { set, kind } => {
            let set2 = r.rewrite_expr(set)?;
            if Expr::ptr_eq(set, &set2) {
                return Ok(e.clone());
            }
            Expr::index_read(set2, *kind)
        }
        ExprKind::IndexedTensor { tensor, index_vars } => {
            let tensor2 = r.rewrite_expr(tensor)?;
            if Expr::ptr_eq(tensor, &tensor2) {
                return Ok(e.clone());
            }
            Expr::indexed_tensor(tensor2, index_vars.clone())
        }
        ExprKind::IndexExpr { result_vars, rhs } => {
            let rhs2 = r.rewrite_expr(rhs)?;
            if Expr::ptr_eq(rhs, &rhs2) {
                return Ok(e.clone());
            }
            Expr::index_expr(result_vars.clone(), rhs2)
        }
        ExprKind::Unary { op, a } => {
            let a2 = r.rewrite_expr(a)?;
            if Expr::ptr_eq(a, &a2) {
                return Ok(e.clone());
            }
            Expr::new(e.ty().clone(), ExprKind::Unary { op: *op, a: a2 })
        }
        ExprKind::Binary { op, a, b } => {
            let a2 = r.rewrite_expr(a)?;
            let b2 = r.rewrite_expr(b)?;
            if Expr::ptr_eq(a, &a2) && Expr::ptr_eq(b, &b2) {
                return Ok(e.clone());
            }
            Expr::binary(*op, a2, b2)
        }
        ExprKind::Call { func, args } => {
            let (args2, args_changed) = rewrite_expr_list(r, args)?;
            if !args_changed {
                return Ok(e.clone());
            }
            Expr::call(func.clone(), args2)
        }
        ExprKind::Load { buffer, index } => {
            let buffer2 = r.rewrite_expr(buffer)?;
            let index2 = r.rewrite_expr(index)?;
            if Expr::ptr_eq(buffer, &buffer2) && Expr::ptr_eq(index, &index2) {
                return Ok(e.clone());
            }
            Expr::load(buffer2, index2)
        }
    };
    Ok(rewritten)
}

pub fn walk_rewrite_stmt<R: Rewriter + ?Sized>(r: &mut R, s: &Stmt) -> Result<Stmt> {
    let rewritten = match s.kind() {
        StmtKind::VarDecl { .. } | StmtKind::Barrier | StmtKind::Pass => return Ok(s.clone()),
        StmtKind::Assign { var, value } => {
            let value2 = r.rewrite_expr(value)?;
            if Expr::ptr_eq(value, &value2) {
                return Ok(s.clone());
            }
            Stmt::assign(var.clone(), value2)
        }
        StmtKind::FieldWrite { target, field, value } => {
            let target2 = r.rewrite_expr(target)?;
            let value2 = r.rewrite_expr(value)?;
            if Expr::ptr_eq(target, &target2) && Expr::ptr_eq(value, &value2) {
                return Ok(s.clone());
            }
            Stmt::field_write(target2, field.clone(), value2)
        }
        StmtKind::TensorWrite { tensor, indices, value } => {
            let tensor2 = r.rewrite_expr(tensor)?;
            let (indices2, indices_changed) = rewrite_expr_list(r, indices)?;
            let value2 = r.rewrite_expr(value)?;
            if Expr::ptr_eq(tensor, &tensor2) && !indices_changed && Expr::ptr_eq(value, &value2) {
                return Ok(s.clone());
            }
            Stmt::tensor_write(tensor2, indices2, value2)
        }
        StmtKind::Store { buffer, index, value } => {
            let buffer2 = r.rewrite_expr(buffer)?;
            let index2 = r.rewrite_expr(index)?;
            let value2 = r.rewrite_expr(value)?;
            if Expr::ptr_eq(buffer, &buffer2)
                && Expr::ptr_eq(index, &index2)
                && Expr::ptr_eq(value, &value2)
            {
                return Ok(s.clone());
            }
            Stmt::store(buffer2, index2, value2)
        }
        StmtKind::Block(stmts) => {
            let mut changed = false;
            let mut out = Vec::with_capacity(stmts.len());
            for stmt in stmts {
                let stmt2 = r.rewrite_stmt(stmt)?;
                changed |= !Stmt::ptr_eq(stmt, &stmt2);
                out.push(stmt2);
            }
            if !changed {
                return Ok(s.clone());
            }
            Stmt::new(StmtKind::Block(out))
        }
        StmtKind::For { var, domain, body } => {
            let body2 = r.rewrite_stmt(body)?;
            if Stmt::ptr_eq(body, &body2) {
                return Ok(s.clone());
            }
            Stmt::for_loop(var.clone(), domain.clone(), body2)
        }
        StmtKind::While { cond, body } => {
            let cond2 = r.rewrite_expr(cond)?;
            let body2 = r.rewrite_stmt(body)?;
            if Expr::ptr_eq(cond, &cond2) && Stmt::ptr_eq(body, &body2) {
                return Ok(s.clone());
            }
            Stmt::while_loop(cond2, body2)
        }
        StmtKind::IfThenElse { cond, then_body, else_body } => {
            let cond2 = r.rewrite_expr(cond)?;
            let then2 = r.rewrite_stmt(then_body)?;
            let (else2, else_changed) = match else_body {
                Some(els) => {
                    let els2 = r.rewrite_stmt(els)?;
                    let changed = !Stmt::ptr_eq(els, &els2);
                    (Some(els2), changed)
                }
                None => (None, false),
            };
            if Expr::ptr_eq(cond, &cond2) && Stmt::ptr_eq(then_body, &then2) && !else_changed {
                return Ok(s.clone());
            }
            Stmt::new(StmtKind::IfThenElse { cond: cond2, then_body: then2, else_body: else2 })
        }
        StmtKind::Comment { text, body } => {
            let body2 = r.rewrite_stmt(body)?;
            if Stmt::ptr_eq(body, &body2) {
                return Ok(s.clone());
            }
            Stmt::comment(text.clone(), body2)
        }
        StmtKind::Map(map) => {
            let target2 = r.rewrite_expr(&map.target)?;
            let (neighbors2, neighbors_changed) = match &map.neighbors {
                Some(n) => {
                    let n2 = r.rewrite_expr(n)?;
                    let changed = !Expr::ptr_eq(n, &n2);
                    (Some(n2), changed)
                }
                None => (None, false),
            };
            if Expr::ptr_eq(&map.target, &target2) && !neighbors_changed {
                return Ok(s.clone());
            }
            Stmt::map(MapStmt {
                vars: map.vars.clone(),
                function: map.function.clone(),
                target: target2,
                neighbors: neighbors2,
                reduction: map.reduction,
            })
        }
        StmtKind::GPUFor { var, domain, dimension, body } => {
            let body2 = r.rewrite_stmt(body)?;
            if Stmt::ptr_eq(body, &body2) {
                return Ok(s.clone());
            }
            Stmt::gpu_for(var.clone(), domain.clone(), *dimension, body2)
        }
    };
    Ok(rewritten)
}

pub fn walk_rewrite_func<R: Rewriter + ?Sized>(r: &mut R, f: &Func) -> Result<Func> {
    match f.body() {
        Some(body) => {
            let body2 = r.rewrite_stmt(body)?;
            if Stmt::ptr_eq(body, &body2) {
                Ok(f.clone())
            } else {
                Ok(f.with_body(body2))
            }
        }
        // External and intrinsic functions are opaque.
        None => Ok(f.clone()),
    }
}

/// Rewrite every distinct internal function reachable from `func` through
/// calls and maps, innermost first, applying `rule` exactly once per function.
pub fn rewrite_call_graph(
    func: &Func,
    rule: &mut dyn FnMut(Func) -> Result<Func>,
) -> Result<Func> {
    struct CallGraphRewriter<'a> {
        rule: &'a mut dyn FnMut(Func) -> Result<Func>,
        done: HashMap<String, Func>,
    }

    impl CallGraphRewriter<'_> {
        fn rewrite_function(&mut self, f: &Func) -> Result<Func> {
            if f.kind() != FuncKind::Internal {
                return Ok(f.clone());
            }
            if let Some(done) = self.done.get(f.name()) {
                return Ok(done.clone());
            }
            let rewritten = walk_rewrite_func(self, f)?;
            let result = (self.rule)(rewritten)?;
            self.done.insert(f.name().to_string(), result.clone());
            Ok(result)
        }
    }

    impl Rewriter for CallGraphRewriter<'_> {
        fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
            if let ExprKind::Call { func, args } = e.kind() {
                let func2 = self.rewrite_function(func)?;
                let (args2, args_changed) = rewrite_expr_list(self, args)?;
                if Func::ptr_eq(func, &func2) && !args_changed {
                    return Ok(e.clone());
                }
                return Ok(Expr::call(func2, args2));
            }
            walk_rewrite_expr(self, e)
        }

        fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
            if let StmtKind::Map(map) = s.kind() {
                let function2 = self.rewrite_function(&map.function)?;
                let rewritten = walk_rewrite_stmt(self, s)?;
                if Func::ptr_eq(&map.function, &function2) {
                    return Ok(rewritten);
                }
                if let StmtKind::Map(map2) = rewritten.kind() {
                    return Ok(Stmt::map(MapStmt {
                        vars: map2.vars.clone(),
                        function: function2,
                        target: map2.target.clone(),
                        neighbors: map2.neighbors.clone(),
                        reduction: map2.reduction,
                    }));
                }
                return Ok(rewritten);
            }
            walk_rewrite_stmt(self, s)
        }
    }

    let mut rewriter = CallGraphRewriter { rule, done: HashMap::new() };
    rewriter.rewrite_function(func)
}

/// Visit every distinct internal function reachable from `func`, innermost
/// first.
pub fn visit_call_graph(func: &Func, rule: &mut dyn FnMut(&Func)) {
    struct CallGraphVisitor<'a> {
        rule: &'a mut dyn FnMut(&Func),
        visited: std::collections::HashSet<String>,
    }

    impl CallGraphVisitor<'_> {
        fn visit_function(&mut self, f: &Func) {
            if f.kind() != FuncKind::Internal || !self.visited.insert(f.name().to_string()) {
                return;
            }
            if let Some(body) = f.body() {
                let _ = self.visit_stmt(body);
            }
            (self.rule)(f);
        }
    }

    impl Visitor for CallGraphVisitor<'_> {
        type Break = std::convert::Infallible;

        fn visit_call(&mut self, _e: &Expr, func: &Func, args: &[Expr]) -> ControlFlow<Self::Break> {
            self.visit_function(func);
            for arg in args {
                self.visit_expr(arg)?;
            }
            ControlFlow::Continue(())
        }

        fn visit_map(&mut self, _s: &Stmt, map: &MapStmt) -> ControlFlow<Self::Break> {
            self.visit_function(&map.function);
            self.visit_expr(&map.target)?;
            if let Some(neighbors) = &map.neighbors {
                self.visit_expr(neighbors)?;
            }
            ControlFlow::Continue(())
        }
    }

    let mut visitor = CallGraphVisitor { rule, visited: std::collections::HashSet::new() };
    visitor.visit_function(func);
}
