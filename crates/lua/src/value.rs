//! The attribute value tree exchanged with Lua.

use std::collections::BTreeMap;

use mlua::prelude::*;
use serde::{Deserialize, Serialize};

/// A plain data value as it appears in target attributes and resolver
/// configuration. Functions, userdata and threads have no representation
/// here and are rejected at conversion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
  String(String),
  Number(f64),
  Boolean(bool),
  List(Vec<Value>),
  Table(BTreeMap<String, Value>),
}

impl Value {
  /// Convert a Lua value into a [`Value`], or describe why it cannot be.
  pub fn from_lua_value(value: &LuaValue) -> Result<Value, String> {
    match value {
      LuaValue::Boolean(b) => Ok(Value::Boolean(*b)),
      LuaValue::Integer(i) => Ok(Value::Number(*i as f64)),
      LuaValue::Number(n) => Ok(Value::Number(*n)),
      LuaValue::String(s) => match s.to_str() {
        Ok(s) => Ok(Value::String(s.to_string())),
        Err(_) => Err("string is not valid UTF-8".to_string()),
      },
      LuaValue::Table(table) => Self::from_lua_table(table),
      LuaValue::Nil => Err("nil is not a valid attribute value".to_string()),
      other => Err(format!("{} is not a valid attribute value", other.type_name())),
    }
  }

  fn from_lua_table(table: &LuaTable) -> Result<Value, String> {
    // A table with sequence entries is a list; otherwise a string-keyed map.
    let len = table.raw_len();
    if len > 0 {
      let mut items = Vec::with_capacity(len);
      for i in 1..=len {
        let item: LuaValue = table.raw_get(i).map_err(|e| e.to_string())?;
        items.push(Self::from_lua_value(&item)?);
      }
      return Ok(Value::List(items));
    }

    let mut map = BTreeMap::new();
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
      let (key, value) = pair.map_err(|e| e.to_string())?;
      let key = match key {
        LuaValue::String(s) => s
          .to_str()
          .map_err(|_| "table key is not valid UTF-8".to_string())?
          .to_string(),
        other => return Err(format!("table keys must be strings, got {}", other.type_name())),
      };
      map.insert(key, Self::from_lua_value(&value)?);
    }
    Ok(Value::Table(map))
  }

  /// Build the Lua representation of this value.
  pub fn to_lua(&self, lua: &Lua) -> LuaResult<LuaValue> {
    match self {
      Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
      Value::Number(n) => Ok(LuaValue::Number(*n)),
      Value::Boolean(b) => Ok(LuaValue::Boolean(*b)),
      Value::List(items) => {
        let table = lua.create_table()?;
        for (i, item) in items.iter().enumerate() {
          table.raw_set(i + 1, item.to_lua(lua)?)?;
        }
        Ok(LuaValue::Table(table))
      }
      Value::Table(map) => {
        let table = lua.create_table()?;
        for (key, value) in map {
          table.raw_set(key.as_str(), value.to_lua(lua)?)?;
        }
        Ok(LuaValue::Table(table))
      }
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }
}
