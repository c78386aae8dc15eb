//! The lowering pipeline.
//!
//! One entry point, [`lower`], composes the passes in a fixed order:
//! flatten index expressions, insert temporaries, infer storage, lower maps,
//! lower index expressions, lower tensor accesses, and (for the GPU backend)
//! shard loops. Every pass maps over the call graph of internal functions
//! exactly once per distinct function, innermost first, and returns a new
//! function; nothing is mutated in place.

use std::ops::ControlFlow;

use log::{debug, warn};

use crate::error::{DiagnosticSink, Result};
use crate::flatten::flatten_index_expressions;
use crate::gpu::{shard_loops, GpuConfig};
use crate::internal_error;
use crate::ir::{Expr, Func, NameGenerator, Stmt};
use crate::lower_accesses::lower_tensor_accesses;
use crate::lower_indexexprs::lower_index_expressions;
use crate::lower_maps::lower_maps;
use crate::storage::infer_storage;
use crate::visitor::{rewrite_call_graph, visit_call_graph, walk_stmt, Visitor};

/// Which backend the pipeline lowers for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Cpu,
    Gpu(GpuConfig),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    pub backend: Backend,
    /// Print the IR of every reachable function after each pass.
    pub verbose: bool,
}

impl PipelineConfig {
    pub fn cpu() -> Self {
        PipelineConfig::default()
    }

    pub fn gpu() -> Self {
        PipelineConfig { backend: Backend::Gpu(GpuConfig::default()), verbose: false }
    }
}

/// Lower a function to loops, scalar operations, and typed loads/stores.
pub fn lower(func: Func, config: &PipelineConfig, sink: &mut DiagnosticSink) -> Result<Func> {
    let mut names = NameGenerator::new();

    // Flatten index expressions and insert temporaries.
    let func = rewrite_call_graph(&func, &mut |f| flatten_index_expressions(&f, &mut names))?;
    let func = rewrite_call_graph(&func, &mut |f| crate::temps::insert_temporaries(&f, &mut names))?;
    print_call_graph("Insert Temporaries and Flatten Index Expressions", &func, config.verbose);
    emit_warnings(sink);

    // Determine storage.
    let func = rewrite_call_graph(&func, &mut |f| {
        let storage = infer_storage(&f)?;
        Ok(f.with_storage(storage))
    })?;
    if config.verbose {
        println!("--- Tensor storage");
        visit_call_graph(&func, &mut |f| {
            println!("func {}:", f.name());
            for (name, descriptor) in f.storage().iter() {
                println!("  {} : {}", name, descriptor);
            }
            println!();
        });
    }
    emit_warnings(sink);

    // Lower maps.
    let func = rewrite_call_graph(&func, &mut |f| lower_maps(&f, &mut names, sink))?;
    print_call_graph("Lower Maps", &func, config.verbose);
    emit_warnings(sink);

    // Lower index expressions.
    let func = rewrite_call_graph(&func, &mut |f| lower_index_expressions(&f, &mut names))?;
    print_call_graph("Lower Index Expressions", &func, config.verbose);
    emit_warnings(sink);

    // Lower tensor reads and writes.
    let func = rewrite_call_graph(&func, &mut |f| lower_tensor_accesses(&f, &mut names))?;
    print_call_graph("Lower Tensor Reads and Writes", &func, config.verbose);
    emit_warnings(sink);

    // Shard loops over device threads.
    let func = match &config.backend {
        Backend::Cpu => func,
        Backend::Gpu(gpu) => {
            let func = rewrite_call_graph(&func, &mut |f| shard_loops(&f, gpu))?;
            print_call_graph("Shard Loops", &func, config.verbose);
            func
        }
    };
    emit_warnings(sink);

    verify_lowered(&func)?;
    Ok(func)
}

fn emit_warnings(sink: &mut DiagnosticSink) {
    for diagnostic in sink.drain() {
        warn!("{}", diagnostic);
    }
}

fn print_call_graph(header: &str, func: &Func, print: bool) {
    if print {
        println!("--- {}", header);
        visit_call_graph(func, &mut |f| println!("{}\n", f));
        println!();
    } else {
        debug!("{}: done", header);
    }
}

/// Check the lowered-IR contract: no symbolic tensor operations survive, and
/// every tensor variable has defined storage.
fn verify_lowered(func: &Func) -> Result<()> {
    struct Verifier;
    impl Visitor for Verifier {
        type Break = crate::error::CompilerError;

        fn visit_index_expr(
            &mut self,
            _e: &Expr,
            _result_vars: &[crate::ir::IndexVar],
            _rhs: &Expr,
        ) -> ControlFlow<Self::Break> {
            ControlFlow::Break(internal_error!("index expression survived lowering"))
        }

        fn visit_indexed_tensor(
            &mut self,
            _e: &Expr,
            _tensor: &Expr,
            _index_vars: &[crate::ir::IndexVar],
        ) -> ControlFlow<Self::Break> {
            ControlFlow::Break(internal_error!("indexed tensor survived lowering"))
        }

        fn visit_tensor_read(
            &mut self,
            _e: &Expr,
            _tensor: &Expr,
            _indices: &[Expr],
        ) -> ControlFlow<Self::Break> {
            ControlFlow::Break(internal_error!("tensor read survived lowering"))
        }

        fn visit_tensor_write(
            &mut self,
            _s: &Stmt,
            _tensor: &Expr,
            _indices: &[Expr],
            _value: &Expr,
        ) -> ControlFlow<Self::Break> {
            ControlFlow::Break(internal_error!("tensor write survived lowering"))
        }

        fn visit_map(&mut self, _s: &Stmt, _map: &crate::ir::MapStmt) -> ControlFlow<Self::Break> {
            ControlFlow::Break(internal_error!("map survived lowering"))
        }
    }

    let mut failure = None;
    visit_call_graph(func, &mut |f| {
        if failure.is_some() {
            return;
        }
        if let Some(body) = f.body() {
            if let ControlFlow::Break(err) = walk_stmt(&mut Verifier, body) {
                failure = Some(err);
            }
        }
        for (name, descriptor) in f.storage().iter() {
            if descriptor.is_undefined() {
                failure = Some(internal_error!(
                    "tensor '{}' has undefined storage after lowering",
                    name
                ));
                return;
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
