//! Engine lifecycle and the host-call surface (spec 6.2): `gab_create`,
//! `gab_cmpl`, `gab_run`, `gab_exec` and the diagnostic flag bitset they all
//! take. A `Gab` bundles the shared [`crate::vm::Engine`] tables with the
//! fiber [`Scheduler`] and the per-name module cache; a host (the `gab` CLI,
//! or an embedder) owns exactly one for a whole process lifetime.

use crate::error::RuntimeError;
use crate::heap::{Block, Kind, ObjHeader};
use crate::module;
use crate::scheduler::Scheduler;
use crate::value::{Value, ValueExt};
use crate::vm::{Engine, Vm};
use gab_compiler::CompileError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Diagnostic bitset (spec 6.2). Hand-rolled rather than pulling in a
/// bitflags dependency for eight bits, matching [`crate::gc::GcFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagFlags(u32);

impl DiagFlags {
    pub const NONE: DiagFlags = DiagFlags(0);
    pub const DUMP_BYTECODE: DiagFlags = DiagFlags(1 << 0);
    pub const DUMP_ERROR: DiagFlags = DiagFlags(1 << 1);
    pub const ERR_QUIET: DiagFlags = DiagFlags(1 << 2);
    pub const ERR_STRUCTURED: DiagFlags = DiagFlags(1 << 3);
    pub const ERR_EXIT: DiagFlags = DiagFlags(1 << 4);
    pub const BUILD_CHECK: DiagFlags = DiagFlags(1 << 5);
    pub const STREAM_INPUT: DiagFlags = DiagFlags(1 << 6);

    pub fn contains(self, other: DiagFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DiagFlags {
    type Output = DiagFlags;
    fn bitor(self, rhs: DiagFlags) -> DiagFlags {
        DiagFlags(self.0 | rhs.0)
    }
}

/// `gab_create`'s `opts` record (spec 6.2). `os_dynopen`/`os_dynsymbol`
/// overrides and a custom object allocator are the external collaborator's
/// business (spec 1) and aren't modeled here; `jobs` and the module search
/// path are the two knobs this runtime actually consults.
#[derive(Debug, Clone)]
pub struct GabOptions {
    pub jobs: usize,
    pub module_search_paths: Vec<PathBuf>,
}

impl Default for GabOptions {
    fn default() -> Self {
        GabOptions { jobs: 8, module_search_paths: Vec::new() }
    }
}

#[derive(Debug)]
pub enum GabError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl std::fmt::Display for GabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GabError::Compile(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            GabError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

/// One engine instance: the shared heap/GC/interning tables, the fiber
/// scheduler, and the module cache. `gab run`/`gab exec`/`gab repl` each
/// create exactly one and drop it when done.
pub struct Gab {
    pub engine: Arc<Engine>,
    scheduler: Mutex<Scheduler>,
    modules: Mutex<HashMap<String, Value>>,
    pub module_search_paths: Vec<PathBuf>,
}

pub fn gab_create(opts: GabOptions) -> Gab {
    let engine = Engine::new();
    let scheduler = Scheduler::new(opts.jobs, Arc::clone(&engine.collector));
    Gab { engine, scheduler: Mutex::new(scheduler), modules: Mutex::new(HashMap::new()), module_search_paths: opts.module_search_paths }
}

pub fn gab_destroy(gab: Gab) {
    gab.scheduler.lock().unwrap().shutdown();
}

impl Gab {
    /// `gab_cmpl`: compile `source` into a top-level block value.
    pub fn compile(&self, name: &str, source: &str, flags: DiagFlags) -> Result<Value, GabError> {
        let proto = gab_compiler::compile(source, name).map_err(GabError::Compile)?;
        if flags.contains(DiagFlags::DUMP_BYTECODE) {
            tracing::debug!(name, bytes = proto.code.len(), protos = proto.protos.len(), "compiled prototype");
        }
        let block = crate::alloc::alloc(Block { header: ObjHeader::new(Kind::Block), prototype: proto, upvalue_descriptors: Vec::new(), upvalues: Vec::new() });
        Ok(Value::from_obj(block))
    }

    /// `gab_run`: execute a previously compiled block value on a fresh `Vm`,
    /// blocking the calling thread until the top-level fiber returns.
    pub fn run(&self, main: Value, argv: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        let block = main.as_obj().ok_or_else(|| {
            RuntimeError::new(crate::error::RuntimeErrorKind::NotCallable, "gab_run requires a compiled block", gab_core::Span::point(0, 0))
        })?;
        let mut vm = Vm::new(Arc::clone(&self.engine));
        vm.call_top_level(block, argv)
    }

    /// `gab_exec`: compile then immediately run a literal program.
    pub fn exec(&self, name: &str, source: &str, argv: Vec<Value>, flags: DiagFlags) -> Result<Vec<Value>, GabError> {
        let main = self.compile(name, source, flags)?;
        self.run(main, argv).map_err(GabError::Runtime)
    }

    /// Resolve and load an `import`ed module by name (spec 6.4), caching it
    /// under `name` for subsequent imports.
    pub fn import(&self, name: &str) -> Result<Value, GabError> {
        match module::resolve(name, &self.module_search_paths) {
            Some(resolved) => module::load(self, name, resolved),
            None => Err(GabError::Runtime(RuntimeError::new(
                crate::error::RuntimeErrorKind::NotCallable,
                format!("no module named '{name}' on the search path"),
                gab_core::Span::point(0, 0),
            ))),
        }
    }

    pub(crate) fn cached_module(&self, name: &str) -> Option<Value> {
        self.modules.lock().unwrap().get(name).copied()
    }

    pub(crate) fn cache_module(&self, name: String, value: Value) {
        self.modules.lock().unwrap().insert(name, value);
    }

    /// Block the calling thread until every spawned fiber has settled, the
    /// same "drain before exit" point `gab run`/`repl` sit at.
    pub fn wait_idle(&self) {
        self.scheduler.lock().unwrap().wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_runs_a_literal_program() {
        let gab = gab_create(GabOptions { jobs: 1, ..Default::default() });
        let results = gab.exec("<test>", "1 + 2", Vec::new(), DiagFlags::NONE).unwrap();
        assert_eq!(results[0].as_number(), Some(3.0));
        gab_destroy(gab);
    }

    #[test]
    fn compile_error_is_reported_as_gab_error() {
        let gab = gab_create(GabOptions { jobs: 1, ..Default::default() });
        let err = gab.compile("<test>", "def def def", DiagFlags::NONE).unwrap_err();
        assert!(matches!(err, GabError::Compile(_)));
        gab_destroy(gab);
    }
}
