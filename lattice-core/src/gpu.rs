//! GPU loop sharding.
//!
//! Outer loops over set domains become shard dimensions: the loop turns into
//! a `GPUFor` whose induction variable is bound to a thread-index read, and a
//! workgroup barrier closes the body. Nested loops shard across distinct
//! dimensions in configuration order; a dimension can never be active twice
//! on the same path.

use std::collections::HashMap;

use log::debug;

use crate::error::Result;
use crate::ir::{Expr, Func, ShardDimension, Stmt, StmtKind};
use crate::types::IndexSet;
use crate::{temporary_error, user_error};

/// GPU pipeline configuration: which dimensions loops may shard over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub shard_dims: Vec<ShardDimension>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            shard_dims: vec![ShardDimension::X, ShardDimension::Y, ShardDimension::Z],
        }
    }
}

pub fn shard_loops(func: &Func, config: &GpuConfig) -> Result<Func> {
    let body = match func.body() {
        Some(body) => body,
        None => return Ok(func.clone()),
    };
    let sharded = shard_stmt(body, config, &mut Vec::new(), func.name())?;
    let func = if Stmt::ptr_eq(body, &sharded) {
        func.clone()
    } else {
        func.with_body(sharded)
    };
    check_first_assignments(&func)?;
    Ok(func)
}

fn shard_stmt(
    s: &Stmt,
    config: &GpuConfig,
    active: &mut Vec<ShardDimension>,
    origin: &str,
) -> Result<Stmt> {
    match s.kind() {
        StmtKind::For { var, domain, body } => {
            // Only loops over set domains shard; range loops stay serial.
            let dimension = match domain {
                IndexSet::Set(_) => config.shard_dims.iter().find(|&&d| !active.contains(&d)),
                IndexSet::Range(_) => None,
            };
            match dimension {
                Some(&dimension) => {
                    debug!("sharding loop over {} on dimension {}", domain, dimension);
                    active.push(dimension);
                    let inner = shard_stmt(body, config, active, origin)?;
                    active.pop();
                    let bound_body = Stmt::block(vec![
                        Stmt::assign(var.clone(), Expr::thread_idx(dimension)),
                        inner,
                        Stmt::barrier(),
                    ]);
                    Ok(Stmt::gpu_for(var.clone(), domain.clone(), dimension, bound_body))
                }
                None => {
                    let inner = shard_stmt(body, config, active, origin)?;
                    if Stmt::ptr_eq(body, &inner) {
                        Ok(s.clone())
                    } else {
                        Ok(Stmt::for_loop(var.clone(), domain.clone(), inner))
                    }
                }
            }
        }
        StmtKind::GPUFor { var, domain, dimension, body } => {
            if active.contains(dimension) {
                return Err(user_error!(
                    origin,
                    "loop over {} shards dimension {} twice",
                    domain,
                    dimension
                ));
            }
            active.push(*dimension);
            let inner = shard_stmt(body, config, active, origin)?;
            active.pop();
            if Stmt::ptr_eq(body, &inner) {
                Ok(s.clone())
            } else {
                Ok(Stmt::gpu_for(var.clone(), domain.clone(), *dimension, inner))
            }
        }
        StmtKind::Block(stmts) => {
            let mut changed = false;
            let mut out = Vec::with_capacity(stmts.len());
            for stmt in stmts {
                let stmt2 = shard_stmt(stmt, config, active, origin)?;
                changed |= !Stmt::ptr_eq(stmt, &stmt2);
                out.push(stmt2);
            }
            if changed {
                Ok(Stmt::new(StmtKind::Block(out)))
            } else {
                Ok(s.clone())
            }
        }
        StmtKind::While { cond, body } => {
            let inner = shard_stmt(body, config, active, origin)?;
            if Stmt::ptr_eq(body, &inner) {
                Ok(s.clone())
            } else {
                Ok(Stmt::while_loop(cond.clone(), inner))
            }
        }
        StmtKind::IfThenElse { cond, then_body, else_body } => {
            let then2 = shard_stmt(then_body, config, active, origin)?;
            let else2 = match else_body {
                Some(els) => Some(shard_stmt(els, config, active, origin)?),
                None => None,
            };
            let unchanged = Stmt::ptr_eq(then_body, &then2)
                && match (&else2, else_body) {
                    (Some(a), Some(b)) => Stmt::ptr_eq(b, a),
                    (None, None) => true,
                    _ => false,
                };
            if unchanged {
                Ok(s.clone())
            } else {
                Ok(Stmt::new(StmtKind::IfThenElse {
                    cond: cond.clone(),
                    then_body: then2,
                    else_body: else2,
                }))
            }
        }
        StmtKind::Comment { text, body } => {
            let inner = shard_stmt(body, config, active, origin)?;
            if Stmt::ptr_eq(body, &inner) {
                Ok(s.clone())
            } else {
                Ok(Stmt::comment(text.clone(), inner))
            }
        }
        _ => Ok(s.clone()),
    }
}

/// A variable first assigned inside a shard must not be written outside one.
fn check_first_assignments(func: &Func) -> Result<()> {
    fn walk(
        s: &Stmt,
        in_shard: bool,
        first_assigns: &mut HashMap<String, bool>,
    ) -> Result<()> {
        match s.kind() {
            StmtKind::Assign { var, .. } => {
                match first_assigns.get(&var.name) {
                    None => {
                        first_assigns.insert(var.name.clone(), in_shard);
                    }
                    Some(true) if !in_shard => {
                        return Err(temporary_error!(
                            "variable '{}' is first assigned inside a shard but written \
                             outside it",
                            var.name
                        ));
                    }
                    Some(_) => {}
                }
                Ok(())
            }
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    walk(stmt, in_shard, first_assigns)?;
                }
                Ok(())
            }
            StmtKind::For { body, .. }
            | StmtKind::While { body, .. }
            | StmtKind::Comment { body, .. } => walk(body, in_shard, first_assigns),
            StmtKind::GPUFor { body, .. } => walk(body, true, first_assigns),
            StmtKind::IfThenElse { then_body, else_body, .. } => {
                walk(then_body, in_shard, first_assigns)?;
                if let Some(els) = else_body {
                    walk(els, in_shard, first_assigns)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    let mut first_assigns = HashMap::new();
    match func.body() {
        Some(body) => walk(body, false, &mut first_assigns),
        None => Ok(()),
    }
}
