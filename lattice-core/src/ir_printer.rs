//! Readable formatting for IR nodes.
//!
//! `Display` for expressions is a one-line rendering; statements and
//! functions print as indented multi-line listings, two spaces per level.

use std::fmt::{self, Write as _};

use crate::ir::{Expr, ExprKind, Func, Literal, Stmt, StmtKind, UnaryOp};

struct IrPrinter<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
    indentation: usize,
}

impl IrPrinter<'_, '_> {
    fn indent(&mut self) -> fmt::Result {
        for _ in 0..self.indentation {
            self.f.write_str("  ")?;
        }
        Ok(())
    }

    fn print_expr(&mut self, e: &Expr) -> fmt::Result {
        match e.kind() {
            ExprKind::Literal(lit) => match lit {
                Literal::Int(v) => write!(self.f, "{}", v),
                Literal::Float(v) => write!(self.f, "{:?}", v),
                Literal::Bool(v) => write!(self.f, "{}", v),
            },
            ExprKind::VarRead(var) => write!(self.f, "{}", var),
            ExprKind::FieldRead { target, field } => {
                self.print_expr(target)?;
                write!(self.f, ".{}", field)
            }
            ExprKind::TensorRead { tensor, indices } => {
                self.print_expr(tensor)?;
                self.print_index_list(indices)
            }
            ExprKind::TupleRead { tuple, index } => {
                self.print_expr(tuple)?;
                self.f.write_char('(')?;
                self.print_expr(index)?;
                self.f.write_char(')')
            }
            ExprKind::IndexRead { set, kind } => {
                self.print_expr(set)?;
                write!(self.f, ".{}", kind)
            }
            ExprKind::Length(set) => write!(self.f, "length({})", set),
            ExprKind::IndexedTensor { tensor, index_vars } => {
                self.print_expr(tensor)?;
                if !index_vars.is_empty() {
                    let names: Vec<String> =
                        index_vars.iter().map(|iv| iv.name.clone()).collect();
                    write!(self.f, "({})", names.join(","))?;
                }
                Ok(())
            }
            ExprKind::IndexExpr { result_vars, rhs } => {
                if !result_vars.is_empty() {
                    let names: Vec<String> =
                        result_vars.iter().map(|iv| iv.to_string()).collect();
                    write!(self.f, "({}) ", names.join(","))?;
                }
                self.print_expr(rhs)
            }
            ExprKind::Unary { op, a } => {
                match op {
                    UnaryOp::Neg => self.f.write_char('-')?,
                    UnaryOp::Not => self.f.write_str("not ")?,
                }
                self.print_expr(a)
            }
            ExprKind::Binary { op, a, b } => {
                self.f.write_char('(')?;
                self.print_expr(a)?;
                write!(self.f, " {} ", op)?;
                self.print_expr(b)?;
                self.f.write_char(')')
            }
            ExprKind::Call { func, args } => {
                write!(self.f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.f.write_str(", ")?;
                    }
                    self.print_expr(arg)?;
                }
                self.f.write_char(')')
            }
            ExprKind::Load { buffer, index } => {
                self.print_expr(buffer)?;
                self.f.write_char('[')?;
                self.print_expr(index)?;
                self.f.write_char(']')
            }
            ExprKind::ThreadIdx(dim) => write!(self.f, "threadIdx.{}", dim),
        }
    }

    fn print_index_list(&mut self, indices: &[Expr]) -> fmt::Result {
        self.f.write_char('(')?;
        for (i, index) in indices.iter().enumerate() {
            if i > 0 {
                self.f.write_char(',')?;
            }
            self.print_expr(index)?;
        }
        self.f.write_char(')')
    }

    fn print_stmt(&mut self, s: &Stmt) -> fmt::Result {
        match s.kind() {
            StmtKind::Assign { var, value } => {
                self.indent()?;
                write!(self.f, "{} = ", var)?;
                self.print_expr(value)?;
                self.f.write_str(";\n")
            }
            StmtKind::FieldWrite { target, field, value } => {
                self.indent()?;
                self.print_expr(target)?;
                write!(self.f, ".{} = ", field)?;
                self.print_expr(value)?;
                self.f.write_str(";\n")
            }
            StmtKind::TensorWrite { tensor, indices, value } => {
                self.indent()?;
                self.print_expr(tensor)?;
                self.print_index_list(indices)?;
                self.f.write_str(" = ")?;
                self.print_expr(value)?;
                self.f.write_str(";\n")
            }
            StmtKind::Store { buffer, index, value } => {
                self.indent()?;
                self.print_expr(buffer)?;
                self.f.write_char('[')?;
                self.print_expr(index)?;
                self.f.write_str("] = ")?;
                self.print_expr(value)?;
                self.f.write_str(";\n")
            }
            StmtKind::VarDecl { var } => {
                self.indent()?;
                writeln!(self.f, "var {} : {};", var, var.ty)
            }
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.print_stmt(stmt)?;
                }
                Ok(())
            }
            StmtKind::For { var, domain, body } => {
                self.indent()?;
                writeln!(self.f, "for {} in {}:", var, domain)?;
                self.print_nested(body)
            }
            StmtKind::While { cond, body } => {
                self.indent()?;
                self.f.write_str("while ")?;
                self.print_expr(cond)?;
                self.f.write_str(":\n")?;
                self.print_nested(body)
            }
            StmtKind::IfThenElse { cond, then_body, else_body } => {
                self.indent()?;
                self.f.write_str("if ")?;
                self.print_expr(cond)?;
                self.f.write_str(":\n")?;
                self.print_nested(then_body)?;
                if let Some(els) = else_body {
                    self.indent()?;
                    self.f.write_str("else:\n")?;
                    self.print_nested(els)?;
                }
                Ok(())
            }
            StmtKind::Comment { text, body } => {
                self.indent()?;
                writeln!(self.f, "// {}", text)?;
                self.print_stmt(body)
            }
            StmtKind::Map(map) => {
                self.indent()?;
                let names: Vec<String> = map.vars.iter().map(|v| v.name.clone()).collect();
                write!(self.f, "{} = map {} to ", names.join(", "), map.function.name())?;
                self.print_expr(&map.target)?;
                if let Some(neighbors) = &map.neighbors {
                    self.f.write_str(" with ")?;
                    self.print_expr(neighbors)?;
                }
                if let Some(op) = map.reduction {
                    write!(self.f, " reduce {}", op)?;
                }
                self.f.write_str(";\n")
            }
            StmtKind::GPUFor { var, domain, dimension, body } => {
                self.indent()?;
                writeln!(self.f, "gpufor {} in {} over {}:", var, domain, dimension)?;
                self.print_nested(body)
            }
            StmtKind::Barrier => {
                self.indent()?;
                self.f.write_str("barrier;\n")
            }
            StmtKind::Pass => {
                self.indent()?;
                self.f.write_str("pass;\n")
            }
        }
    }

    fn print_nested(&mut self, body: &Stmt) -> fmt::Result {
        self.indentation += 1;
        self.print_stmt(body)?;
        self.indentation -= 1;
        Ok(())
    }

    fn print_func(&mut self, func: &Func) -> fmt::Result {
        write!(self.f, "func {}(", func.name())?;
        for (i, arg) in func.args().iter().enumerate() {
            if i > 0 {
                self.f.write_str(", ")?;
            }
            write!(self.f, "{} : {}", arg, arg.ty)?;
        }
        self.f.write_char(')')?;

        if !func.results().is_empty() {
            self.f.write_str(" -> (")?;
            for (i, res) in func.results().iter().enumerate() {
                if i > 0 {
                    self.f.write_str(", ")?;
                }
                write!(self.f, "{} : {}", res, res.ty)?;
            }
            self.f.write_char(')')?;
        }
        self.f.write_char('\n')?;

        if let Some(body) = func.body() {
            self.indentation += 1;
            self.print_stmt(body)?;
            self.indentation -= 1;
        }
        self.f.write_str("end")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        IrPrinter { f, indentation: 0 }.print_expr(self)
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        IrPrinter { f, indentation: 0 }.print_stmt(self)
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        IrPrinter { f, indentation: 0 }.print_func(self)
    }
}
