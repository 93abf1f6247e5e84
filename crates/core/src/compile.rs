//! Compiling a description file into its pre-execution form.
//!
//! A [`CompiledPkgFile`] is either everything needed to execute the file
//! (the program, the extracted literal sets, the annotation map and the
//! predeclared environment) or the list of syntax errors that prevented
//! compilation. Exactly one of the two, never both, and syntax problems
//! are never raised as `Err`.

use loadstone_lua::chunk::compile_chunk;
use loadstone_lua::runtime::{base_environment, sandboxed_lua};
use loadstone_lua::scan::scan_pkg_source;
use loadstone_lua::{ScanInfo, SyntaxError};
use mlua::prelude::*;

use crate::error::{LoadError, LoadErrorKind};
use crate::graph::ModuleSource;

/// A compiled program plus the runtime that owns it. Lives only inside an
/// in-flight construction's compute state.
pub struct Program {
  pub lua: Lua,
  pub func: LuaFunction,
  /// The predeclared-symbol environment the program was compiled against.
  pub env: LuaTable,
}

/// The post-parse, pre-execution form of a description file.
pub enum CompiledPkgFile {
  Compiled { program: Program, scan: ScanInfo },
  Failed { errors: Vec<SyntaxError> },
}

impl CompiledPkgFile {
  pub fn ok(&self) -> bool {
    matches!(self, CompiledPkgFile::Compiled { .. })
  }
}

fn vm_error(err: LuaError) -> LoadError {
  LoadError::persistent(LoadErrorKind::Io(format!("lua runtime failure: {}", err)))
}

/// Compile a description file. Pure in its inputs: the optional prelude
/// has already been fetched by the caller (the one suspension point of
/// this stage), so identical bytes and prelude produce a structurally
/// identical result.
pub fn compile_pkg_file(
  file_name: &str,
  bytes: &[u8],
  prelude: Option<&ModuleSource>,
) -> Result<CompiledPkgFile, LoadError> {
  let source = match std::str::from_utf8(bytes) {
    Ok(source) => source,
    Err(_) => {
      return Ok(CompiledPkgFile::Failed {
        errors: vec![SyntaxError::new(file_name, None, "file is not valid UTF-8")],
      });
    }
  };

  // One pass over the token stream: forbidden forms, literal globs and
  // subpackages, import references, call-site annotations.
  let scan = match scan_pkg_source(file_name, source) {
    Ok(scan) => scan,
    Err(errors) => return Ok(CompiledPkgFile::Failed { errors }),
  };

  let lua = sandboxed_lua().map_err(vm_error)?;
  let env = base_environment(&lua).map_err(vm_error)?;

  // Prelude bindings become file-level globals of the package file.
  if let Some(prelude) = prelude {
    if let Some(errors) = merge_prelude(&lua, &env, prelude).map_err(vm_error)? {
      return Ok(CompiledPkgFile::Failed { errors });
    }
  }

  match compile_chunk(&lua, source, file_name, &env).map_err(vm_error)? {
    Ok(func) => Ok(CompiledPkgFile::Compiled {
      program: Program { lua, func, env },
      scan,
    }),
    Err(errors) => Ok(CompiledPkgFile::Failed { errors }),
  }
}

/// Evaluate the prelude and merge its exported bindings into `env`.
/// Returns `Some(errors)` when the prelude itself is broken.
fn merge_prelude(lua: &Lua, env: &LuaTable, prelude: &ModuleSource) -> LuaResult<Option<Vec<SyntaxError>>> {
  let name = prelude.path.rel.clone();
  let Ok(source) = std::str::from_utf8(&prelude.bytes) else {
    return Ok(Some(vec![SyntaxError::new(&name, None, "prelude is not valid UTF-8")]));
  };

  let prelude_env = base_environment(lua)?;
  let func = match compile_chunk(lua, source, &name, &prelude_env)? {
    Ok(func) => func,
    Err(errors) => return Ok(Some(errors)),
  };

  let exports: LuaValue = match func.call(()) {
    Ok(exports) => exports,
    Err(err) => {
      return Ok(Some(vec![SyntaxError::new(
        &name,
        None,
        format!("error evaluating prelude: {}", err),
      )]));
    }
  };
  let LuaValue::Table(exports) = exports else {
    return Ok(Some(vec![SyntaxError::new(
      &name,
      None,
      "prelude must return a table of bindings",
    )]));
  };

  for pair in exports.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    env.set(key, value)?;
  }
  Ok(None)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vfs::{Root, RootedPath};

  fn prelude(source: &str) -> ModuleSource {
    ModuleSource {
      path: RootedPath::new(Root::new("/ws"), "tools/prelude.lua"),
      bytes: source.as_bytes().to_vec(),
    }
  }

  #[test]
  fn well_formed_file_compiles_with_extraction() {
    let source = br#"
      target { name = "lib", kind = "cc_library", srcs = glob { "*.c" } }
    "#;
    let compiled = compile_pkg_file("pkg/PKG.lua", source, None).unwrap();
    let CompiledPkgFile::Compiled { scan, .. } = compiled else {
      panic!("expected a compiled file");
    };
    assert!(scan.globs.contains("*.c"));
    assert_eq!(scan.annotations.len(), 1);
  }

  #[test]
  fn syntax_errors_are_data_not_failures() {
    let compiled = compile_pkg_file("pkg/PKG.lua", b"target { name = ", None).unwrap();
    let CompiledPkgFile::Failed { errors } = compiled else {
      panic!("expected a failed file");
    };
    assert!(!errors.is_empty());
    assert_eq!(errors[0].file, "pkg/PKG.lua");
  }

  #[test]
  fn forbidden_syntax_fails_before_compilation() {
    let compiled = compile_pkg_file("pkg/PKG.lua", b"while true do end", None).unwrap();
    let CompiledPkgFile::Failed { errors } = compiled else {
      panic!("expected a failed file");
    };
    assert!(errors[0].message.contains("'while'"));
  }

  #[test]
  fn prelude_bindings_are_file_level_globals() {
    let prelude = prelude(
      r#"
        return {
          DEFAULT_COPTS = { "-Wall" },
        }
      "#,
    );
    let source = br#"
      target { name = "lib", kind = "cc_library", copts = DEFAULT_COPTS }
    "#;
    let compiled = compile_pkg_file("pkg/PKG.lua", source, Some(&prelude)).unwrap();
    let CompiledPkgFile::Compiled { program, .. } = compiled else {
      panic!("expected a compiled file");
    };
    // The binding is visible in the environment, not as a VM global.
    assert!(!program.env.get::<LuaValue>("DEFAULT_COPTS").unwrap().is_nil());
    assert!(program.lua.globals().get::<LuaValue>("DEFAULT_COPTS").unwrap().is_nil());
  }

  #[test]
  fn broken_prelude_fails_the_file() {
    let prelude = prelude("return 42");
    let compiled = compile_pkg_file("pkg/PKG.lua", b"x = 1", Some(&prelude)).unwrap();
    let CompiledPkgFile::Failed { errors } = compiled else {
      panic!("expected a failed file");
    };
    assert!(errors[0].message.contains("must return a table"));
    assert_eq!(errors[0].file, "tools/prelude.lua");
  }

  #[test]
  fn recompiling_identical_inputs_is_structurally_identical() {
    let source = br#"x = glob { "*.h", dirs = true }"#;
    let a = compile_pkg_file("PKG.lua", source, None).unwrap();
    let b = compile_pkg_file("PKG.lua", source, None).unwrap();
    let (CompiledPkgFile::Compiled { scan: scan_a, .. }, CompiledPkgFile::Compiled { scan: scan_b, .. }) = (a, b)
    else {
      panic!("expected two compiled files");
    };
    assert_eq!(scan_a, scan_b);
  }
}
