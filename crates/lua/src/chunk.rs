//! Chunk compilation against a predeclared environment.
//!
//! Compilation failures come back as [`SyntaxError`] data; only VM-level
//! problems (out of memory, broken environment table) surface as `Err`.

use mlua::prelude::*;

use crate::diag::{Location, SyntaxError};

/// Compile `source` into a callable function whose free names resolve
/// against `env`.
pub fn compile_chunk(
  lua: &Lua,
  source: &str,
  chunk_name: &str,
  env: &LuaTable,
) -> LuaResult<Result<LuaFunction, Vec<SyntaxError>>> {
  let chunk = lua
    .load(source)
    .set_name(format!("@{}", chunk_name))
    .set_environment(env.clone());
  match chunk.into_function() {
    Ok(func) => Ok(Ok(func)),
    Err(LuaError::SyntaxError { message, .. }) => {
      Ok(Err(vec![syntax_error_from_message(chunk_name, &message)]))
    }
    Err(other) => Err(other),
  }
}

/// Turn a Lua error message of the usual `name:line: text` shape into a
/// located [`SyntaxError`]. Messages that do not match keep their full text
/// and no location.
pub fn syntax_error_from_message(chunk_name: &str, message: &str) -> SyntaxError {
  // mlua prefixes its own wrapper text; the location sits wherever the
  // chunk name is first mentioned.
  let needle = format!("{}:", chunk_name);
  if let Some(at) = message.find(&needle) {
    let rest = &message[at + needle.len()..];
    if let Some((line_no, text)) = rest.split_once(':') {
      if let Ok(line_no) = line_no.trim().parse::<u32>() {
        let text = text.lines().next().unwrap_or(text);
        return SyntaxError::new(
          chunk_name,
          Some(Location::new(line_no, 1)),
          text.trim().to_string(),
        );
      }
    }
  }
  SyntaxError::new(chunk_name, None, message.to_string())
}
