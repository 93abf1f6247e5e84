//! Lua runtime construction for description files.
//!
//! Description files run against a reduced standard library (no `io`, `os`,
//! `package` or `debug`) and see their symbols through an explicit
//! environment table rather than the VM globals, so one VM can compile and
//! run chunks with differing predeclared environments.

use mlua::prelude::*;
use mlua::{LuaOptions, StdLib};

/// Base library members copied into every description-file environment.
const SAFE_GLOBALS: &[&str] = &[
  "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber", "tostring", "type",
  "string", "table", "math",
];

/// Create a sandboxed Lua VM for description files and modules.
pub fn sandboxed_lua() -> LuaResult<Lua> {
  Lua::new_with(StdLib::TABLE | StdLib::STRING | StdLib::MATH, LuaOptions::default())
}

/// Build a fresh environment table carrying the safe base members.
///
/// The returned table is the predeclared-symbol environment a chunk is
/// compiled against; callers merge prelude bindings and registration
/// functions into it before execution.
pub fn base_environment(lua: &Lua) -> LuaResult<LuaTable> {
  let env = lua.create_table()?;
  let globals = lua.globals();
  for name in SAFE_GLOBALS {
    let value: LuaValue = globals.get(*name)?;
    env.set(*name, value)?;
  }
  Ok(env)
}
