//! Tensor-access lowering.
//!
//! Replaces every symbolic `TensorRead`/`TensorWrite` with an explicit
//! offset-computed `Load`/`Store`. The offset function follows the tensor's
//! storage kind: dense row-major tensors use the usual strided sum, diagonal
//! system tensors use the (asserted equal) coordinate directly, and reduced
//! system tensors address through the coordinate established by the sparse
//! loop, or through a column search of the CSR row for explicit writes.

use log::trace;

use crate::error::Result;
use crate::internal_error;
use crate::ir::{
    BinOp, Expr, ExprKind, Func, IndexReadKind, NameGenerator, Stmt, StmtKind, Var,
};
use crate::storage::{Storage, TensorStorageKind};
use crate::types::{IndexDomain, IndexSet, TensorType};
use crate::visitor::{walk_rewrite_expr, walk_rewrite_stmt, Rewriter};

pub fn lower_tensor_accesses(func: &Func, names: &mut NameGenerator) -> Result<Func> {
    let storage = func.storage().clone();
    let mut lowerer = AccessLowerer { storage, names };
    lowerer.rewrite_func(func)
}

struct AccessLowerer<'a> {
    storage: Storage,
    names: &'a mut NameGenerator,
}

/// Size of one dimension as an expression; concatenated domains sum.
fn domain_size(domain: &IndexDomain) -> Expr {
    let mut sizes = domain.index_sets.iter().map(|is| match is {
        IndexSet::Range(n) => Expr::int(*n),
        IndexSet::Set(_) => Expr::length(is.clone()),
    });
    let first = sizes.next().expect("domains have at least one index set");
    sizes.fold(first, Expr::add)
}

/// Row-major offset: sum over k of `index_k * prod of trailing dim sizes`.
fn dense_offset(tensor_type: &TensorType, indices: &[Expr]) -> Result<Expr> {
    if tensor_type.order() != indices.len() {
        return Err(internal_error!(
            "tensor of order {} accessed with {} indices",
            tensor_type.order(),
            indices.len()
        ));
    }
    let mut offset: Option<Expr> = None;
    for (k, index) in indices.iter().enumerate() {
        let mut term = index.clone();
        for dim in &tensor_type.dims[k + 1..] {
            term = Expr::mul(term, domain_size(dim));
        }
        offset = Some(match offset {
            None => term,
            Some(o) => Expr::add(o, term),
        });
    }
    Ok(offset.unwrap_or_else(|| Expr::int(0)))
}

impl AccessLowerer<'_> {
    /// The offset of a read or write, given the buffer's storage kind.
    fn access_offset(&self, tensor: &Expr, indices: &[Expr]) -> Result<Expr> {
        let tensor_type = tensor
            .ty()
            .to_tensor()
            .ok_or_else(|| internal_error!("tensor access on non-tensor expression"))?;

        let kind = match tensor.kind() {
            ExprKind::VarRead(var) => self.storage.expect(&var.name)?.kind().clone(),
            // Set field arrays are stored densely.
            ExprKind::FieldRead { .. } => TensorStorageKind::DenseRowMajor,
            _ => {
                return Err(internal_error!(
                    "tensor accesses must go through variables or set fields"
                ))
            }
        };

        match kind {
            TensorStorageKind::DenseRowMajor => dense_offset(tensor_type, indices),
            TensorStorageKind::SystemDiagonal { .. } => {
                for index in &indices[1..] {
                    if *index != indices[0] {
                        return Err(internal_error!(
                            "diagonal tensor accessed off the diagonal"
                        ));
                    }
                }
                Ok(indices[0].clone())
            }
            TensorStorageKind::SystemReduced { .. } => {
                // Sparse reads carry the coordinate induction variable set up
                // by index-expression lowering.
                if indices.len() == 1 {
                    Ok(indices[0].clone())
                } else {
                    Err(internal_error!(
                        "reduced system tensor accessed with {} explicit indices",
                        indices.len()
                    ))
                }
            }
            TensorStorageKind::SystemNone => Err(internal_error!(
                "access to unmaterialised system tensor"
            )),
            TensorStorageKind::Undefined => Err(internal_error!(
                "access to tensor with undefined storage"
            )),
        }
    }

    /// Lower a write into a reduced system tensor at explicit `(row, col)`
    /// indices: search the CSR row for the column, then store at the found
    /// coordinate. A read of the same element inside `value` reuses it.
    fn lower_assembly_write(
        &mut self,
        tensor: &Expr,
        target_set: Expr,
        indices: &[Expr],
        value: &Expr,
    ) -> Result<Stmt> {
        let row = indices[0].clone();
        let col = indices[1].clone();
        let coord = Var::int(self.names.fresh("p"));
        trace!("assembly write searches row through {}", coord.name);

        let starts = Expr::index_read(target_set.clone(), IndexReadKind::NeighborStarts);
        let columns = Expr::index_read(target_set, IndexReadKind::Neighbors);

        // Self-reads of the written element become reads at the coordinate.
        let tensor_name = match tensor.kind() {
            ExprKind::VarRead(var) => var.name.clone(),
            _ => return Err(internal_error!("assembly writes go through variables")),
        };
        let mut replacer = ReplaceSelfRead {
            tensor_name,
            indices: indices.to_vec(),
            replacement: Expr::load(tensor.clone(), Expr::var(coord.clone())),
        };
        let value = replacer.rewrite_expr(value)?;
        let value = self.rewrite_expr(&value)?;

        Ok(Stmt::block(vec![
            Stmt::var_decl(coord.clone()),
            Stmt::assign(coord.clone(), Expr::load(starts, row)),
            Stmt::while_loop(
                Expr::binary(
                    BinOp::Ne,
                    Expr::load(columns, Expr::var(coord.clone())),
                    col,
                ),
                Stmt::assign(coord.clone(), Expr::add(Expr::var(coord.clone()), Expr::int(1))),
            ),
            Stmt::store(tensor.clone(), Expr::var(coord), value),
        ]))
    }
}

impl Rewriter for AccessLowerer<'_> {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        let e = walk_rewrite_expr(self, e)?;
        if let ExprKind::TensorRead { tensor, indices } = e.kind() {
            let offset = self.access_offset(tensor, indices)?;
            return Ok(Expr::load(tensor.clone(), offset));
        }
        Ok(e)
    }

    fn rewrite_stmt(&mut self, s: &Stmt) -> Result<Stmt> {
        if let StmtKind::TensorWrite { tensor, indices, value } = s.kind() {
            let mut lowered_indices = Vec::with_capacity(indices.len());
            for index in indices {
                lowered_indices.push(self.rewrite_expr(index)?);
            }

            let reduced_target = match tensor.kind() {
                ExprKind::VarRead(var) => match self.storage.expect(&var.name)?.kind() {
                    TensorStorageKind::SystemReduced { target, .. } => Some(target.clone()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(target) = reduced_target {
                if lowered_indices.len() == 2 {
                    return self.lower_assembly_write(tensor, target, &lowered_indices, value);
                }
            }

            let offset = self.access_offset(tensor, &lowered_indices)?;
            let value = self.rewrite_expr(value)?;
            return Ok(Stmt::store(tensor.clone(), offset, value));
        }
        walk_rewrite_stmt(self, s)
    }
}

/// Replaces reads of one tensor element, matched structurally, with a fixed
/// expression.
struct ReplaceSelfRead {
    tensor_name: String,
    indices: Vec<Expr>,
    replacement: Expr,
}

impl Rewriter for ReplaceSelfRead {
    fn rewrite_expr(&mut self, e: &Expr) -> Result<Expr> {
        if let ExprKind::TensorRead { tensor, indices } = e.kind() {
            if let ExprKind::VarRead(var) = tensor.kind() {
                if var.name == self.tensor_name && *indices == self.indices {
                    return Ok(self.replacement.clone());
                }
            }
        }
        walk_rewrite_expr(self, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TensorStorage;
    use crate::types::{ElementType, ScalarKind, SetType, Type};

    fn matrix(name: &str, m: i64, n: i64) -> Var {
        Var::new(
            name,
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::range(m), IndexDomain::range(n)],
            )),
        )
    }

    fn func_with_storage(body: Stmt, seed: &[(&Var, TensorStorage)]) -> Func {
        let mut storage = Storage::new();
        for &(var, ref descriptor) in seed {
            storage.add(var, descriptor.clone());
        }
        Func::internal("main", vec![], vec![], body).with_storage(storage)
    }

    #[test]
    fn dense_access_uses_row_major_offsets() {
        let a = matrix("A", 2, 3);
        let c = matrix("C", 2, 3);
        let i = Var::int("i");
        let j = Var::int("j");
        let body = Stmt::tensor_write(
            Expr::var(c.clone()),
            vec![Expr::var(i.clone()), Expr::var(j.clone())],
            Expr::tensor_read(Expr::var(a.clone()), vec![Expr::var(i), Expr::var(j)]),
        );
        let func = func_with_storage(body, &[
            (&a, TensorStorage::dense_row_major(false)),
            (&c, TensorStorage::dense_row_major(true)),
        ]);

        let mut names = NameGenerator::new();
        let lowered = lower_tensor_accesses(&func, &mut names).unwrap();
        assert_eq!(
            lowered.body().unwrap().to_string(),
            "C[((i * 3) + j)] = A[((i * 3) + j)];\n"
        );
    }

    #[test]
    fn set_sized_dimensions_use_length() {
        let x = Var::new(
            "x",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::range(3)],
            )),
        );
        let i = Var::int("i");
        let body = Stmt::tensor_write(
            Expr::var(x.clone()),
            vec![Expr::var(i.clone()), Expr::int(2)],
            Expr::float(1.0),
        );
        let func = func_with_storage(body, &[(&x, TensorStorage::dense_row_major(true))]);

        let mut names = NameGenerator::new();
        let lowered = lower_tensor_accesses(&func, &mut names).unwrap();
        assert_eq!(
            lowered.body().unwrap().to_string(),
            "x[((i * 3) + 2)] = 1.0;\n"
        );
    }

    #[test]
    fn diagonal_access_takes_the_coordinate() {
        let verts = Var::new("V", Type::Set(SetType::new(ElementType::new("P", vec![]))));
        let d = Var::new(
            "D",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::set("V")],
            )),
        );
        let i = Var::int("i");
        let body = Stmt::tensor_write(
            Expr::var(d.clone()),
            vec![Expr::var(i.clone()), Expr::var(i.clone())],
            Expr::float(2.0),
        );
        let func = func_with_storage(
            body,
            &[(&d, TensorStorage::system_diagonal(Expr::var(verts)))],
        );

        let mut names = NameGenerator::new();
        let lowered = lower_tensor_accesses(&func, &mut names).unwrap();
        assert_eq!(lowered.body().unwrap().to_string(), "D[i] = 2.0;\n");
    }

    #[test]
    fn off_diagonal_access_is_an_internal_error() {
        let verts = Var::new("V", Type::Set(SetType::new(ElementType::new("P", vec![]))));
        let d = Var::new(
            "D",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::set("V")],
            )),
        );
        let body = Stmt::tensor_write(
            Expr::var(d.clone()),
            vec![Expr::var(Var::int("i")), Expr::var(Var::int("j"))],
            Expr::float(2.0),
        );
        let func = func_with_storage(
            body,
            &[(&d, TensorStorage::system_diagonal(Expr::var(verts)))],
        );

        let mut names = NameGenerator::new();
        let err = lower_tensor_accesses(&func, &mut names).unwrap_err();
        assert!(matches!(err, crate::error::CompilerError::Internal { .. }));
    }

    #[test]
    fn assembly_write_searches_the_row() {
        let verts = Var::new("V", Type::Set(SetType::new(ElementType::new("P", vec![]))));
        let a = Var::new(
            "A",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::set("V")],
            )),
        );
        let u = Var::int("u");
        let v = Var::int("v");
        // A(u,v) = A(u,v) + 1.0
        let body = Stmt::tensor_write(
            Expr::var(a.clone()),
            vec![Expr::var(u.clone()), Expr::var(v.clone())],
            Expr::add(
                Expr::tensor_read(
                    Expr::var(a.clone()),
                    vec![Expr::var(u.clone()), Expr::var(v.clone())],
                ),
                Expr::float(1.0),
            ),
        );
        let func = func_with_storage(
            body,
            &[(&a, TensorStorage::system_reduced(Expr::var(verts.clone()), Expr::var(verts)))],
        );

        let mut names = NameGenerator::new();
        let lowered = lower_tensor_accesses(&func, &mut names).unwrap();
        let printed = lowered.body().unwrap().to_string();

        assert!(printed.contains("p0 = V.neighbors.start[u];"), "{}", printed);
        assert!(printed.contains("while (V.neighbors[p0] != v):"), "{}", printed);
        assert!(printed.contains("p0 = (p0 + 1);"), "{}", printed);
        assert!(printed.contains("A[p0] = (A[p0] + 1.0);"), "{}", printed);
    }

    #[test]
    fn sparse_read_at_coordinate_becomes_a_load() {
        let verts = Var::new("V", Type::Set(SetType::new(ElementType::new("P", vec![]))));
        let a = Var::new(
            "A",
            Type::Tensor(TensorType::new(
                ScalarKind::Float,
                vec![IndexDomain::set("V"), IndexDomain::set("V")],
            )),
        );
        let acc = Var::new("acc", Type::float());
        let body = Stmt::assign(
            acc.clone(),
            Expr::tensor_read(Expr::var(a.clone()), vec![Expr::var(Var::int("ijA"))]),
        );
        let func = func_with_storage(
            body,
            &[(&a, TensorStorage::system_reduced(Expr::var(verts.clone()), Expr::var(verts)))],
        );

        let mut names = NameGenerator::new();
        let lowered = lower_tensor_accesses(&func, &mut names).unwrap();
        assert_eq!(lowered.body().unwrap().to_string(), "acc = A[ijA];\n");
    }
}
