//! Module resolution and loading (spec 6.4). Given an import name, a fixed
//! set of prefix/suffix combinations are probed on disk; a `.gab` hit is
//! compiled and run as a fresh top-level fiber, a `.so` hit is `dlopen`ed and
//! its `gab_lib` entry invoked. Successfully loaded modules are cached by
//! their resolved path so a second `import` of the same name is free.
//!
//! Native module *content* is an external collaborator (spec 1): this module
//! only owns getting the shared object mapped in and its entry point called,
//! not what library a `.so` actually implements.

use crate::engine::{Gab, GabError};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::value::Value;
use gab_core::Span;
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Default prefixes probed ahead of any caller-supplied search path,
/// relative to the importing module's directory.
const DEFAULT_PREFIXES: &[&str] = &["./mod/", "./"];
const SUFFIXES: &[&str] = &[".gab", "/mod.gab", ".so"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedModule {
    Source(PathBuf),
    Native(PathBuf),
}

/// Search `prefixes` (the defaults plus the engine's configured
/// `$PREFIX/gab/modules/`-style paths) crossed with `SUFFIXES` for `name`,
/// in order, returning the first path that exists.
pub fn resolve(name: &str, extra_prefixes: &[PathBuf]) -> Option<ResolvedModule> {
    let mut prefixes: Vec<PathBuf> = DEFAULT_PREFIXES.iter().map(PathBuf::from).collect();
    prefixes.extend(extra_prefixes.iter().cloned());

    for prefix in &prefixes {
        for suffix in SUFFIXES {
            let candidate = prefix.join(format!("{name}{suffix}"));
            if candidate.is_file() {
                return Some(if *suffix == ".so" { ResolvedModule::Native(candidate) } else { ResolvedModule::Source(candidate) });
            }
        }
    }
    None
}

/// Load (compiling and running, or dlopening, as appropriate) and cache a
/// resolved module under `name`. Returns the cached value on a repeat call.
pub fn load(gab: &Gab, name: &str, resolved: ResolvedModule) -> Result<Value, GabError> {
    if let Some(cached) = gab.cached_module(name) {
        return Ok(cached);
    }
    let value = match &resolved {
        ResolvedModule::Source(path) => load_source(gab, name, path)?,
        ResolvedModule::Native(path) => load_native(gab, path).map_err(GabError::Runtime)?,
    };
    gab.cache_module(name.to_string(), value);
    Ok(value)
}

fn load_source(gab: &Gab, name: &str, path: &Path) -> Result<Value, GabError> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        GabError::Runtime(RuntimeError::new(RuntimeErrorKind::NotCallable, format!("cannot read module '{name}': {e}"), Span::point(0, 0)))
    })?;
    let block = gab.compile(name, &source, crate::engine::DiagFlags::NONE)?;
    gab.run(block, Vec::new()).map(|mut results| results.pop().unwrap_or(gab_core::gab_nil())).map_err(GabError::Runtime)
}

/// `dlopen`s a native module and invokes its `gab_lib` entry point. The
/// entry point receives the engine's address so it can register
/// specializations through host callbacks it looks up itself; what it does
/// with that address is the module's own business.
fn load_native(gab: &Gab, path: &Path) -> Result<Value, RuntimeError> {
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| RuntimeError::new(RuntimeErrorKind::NotCallable, "module path contains a NUL byte", Span::point(0, 0)))?;

    // SAFETY: `dlopen`/`dlsym`/`dlclose` are the documented libc interface
    // for loading shared objects; the handle is never touched again after
    // this call, matching the module cache's fire-and-forget load model.
    unsafe {
        let handle = libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW);
        if handle.is_null() {
            return Err(RuntimeError::new(RuntimeErrorKind::NotCallable, format!("dlopen failed for {}", path.display()), Span::point(0, 0)));
        }
        let symbol = CString::new("gab_lib").unwrap();
        let entry = libc::dlsym(handle, symbol.as_ptr());
        if entry.is_null() {
            libc::dlclose(handle);
            return Err(RuntimeError::new(RuntimeErrorKind::NotCallable, format!("{} has no gab_lib entry point", path.display()), Span::point(0, 0)));
        }
        type GabLibFn = unsafe extern "C" fn(*const Gab) -> *mut std::ffi::c_void;
        let gab_lib: GabLibFn = std::mem::transmute(entry);
        crate::error::clear_panic();
        let result = gab_lib(gab as *const Gab);
        if let Some(err) = crate::error::take_panic() {
            libc::dlclose(handle);
            return Err(err);
        }
        tracing::debug!(module = %path.display(), registered = !result.is_null(), "loaded native module");
    }
    Ok(gab_core::gab_nil())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_gab_suffix_in_current_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("greet.gab");
        std::fs::write(&file_path, "nil").unwrap();
        let resolved = resolve("greet", std::slice::from_ref(&dir.path().to_path_buf()));
        assert_eq!(resolved, Some(ResolvedModule::Source(file_path)));
    }

    #[test]
    fn resolves_mod_gab_over_missing_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        let mod_path = dir.path().join("pkg/mod.gab");
        let mut f = std::fs::File::create(&mod_path).unwrap();
        writeln!(f, "nil").unwrap();
        let resolved = resolve("pkg", std::slice::from_ref(&dir.path().to_path_buf()));
        assert_eq!(resolved, Some(ResolvedModule::Source(mod_path)));
    }

    #[test]
    fn unresolvable_name_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve("does-not-exist", std::slice::from_ref(&dir.path().to_path_buf())), None);
    }
}
