//! Token-level scanning of `PKG.lua` sources.
//!
//! Before a description file is handed to the Lua compiler, a single pass
//! over its token stream:
//! - rejects forms that are not allowed in description files (`goto` and
//!   labels, `while`/`repeat` loops, named `function` declarations),
//! - collects every literal `glob { ... }` argument, split into the
//!   files-only and files-and-dirs pattern sets,
//! - collects literal `subpackages { ... }` arguments,
//! - collects literal `import("...")` module references,
//! - records, for each top-level call statement, the callee name keyed by
//!   its source location.
//!
//! The scanner never executes code and only sees literals: a glob pattern
//! built from an expression is invisible here and is picked up at execution
//! time instead.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{Location, SyntaxError};

/// A statically-declared module reference (`import("//tools/defs.lua")`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
  pub path: String,
  pub location: Location,
}

/// Everything the scan pass extracts from one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanInfo {
  /// Literal glob patterns from calls without `dirs = true`.
  pub globs: BTreeSet<String>,
  /// Literal glob patterns from calls with `dirs = true`.
  pub globs_with_dirs: BTreeSet<String>,
  /// Literal subpackage patterns.
  pub subpackages: BTreeSet<String>,
  /// Literal module references, in source order.
  pub imports: Vec<ImportRef>,
  /// Callee name of every top-level call statement, keyed by location.
  pub annotations: BTreeMap<Location, String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
  Name(String),
  Str(String),
  Number,
  Sym(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
  tok: Tok,
  loc: Location,
}

const KEYWORDS: &[&str] = &[
  "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
  "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Scan one description file. Returns the extracted info, or the list of
/// problems found. A file with problems is never partially extracted.
pub fn scan_pkg_source(file: &str, source: &str) -> Result<ScanInfo, Vec<SyntaxError>> {
  let tokens = match lex(file, source) {
    Ok(tokens) => tokens,
    Err(err) => return Err(vec![err]),
  };
  let mut errors = Vec::new();
  let info = analyze(file, &tokens, &mut errors);
  if errors.is_empty() { Ok(info) } else { Err(errors) }
}

struct Lexer<'a> {
  chars: std::iter::Peekable<std::str::Chars<'a>>,
  line: u32,
  col: u32,
}

impl<'a> Lexer<'a> {
  fn new(source: &'a str) -> Self {
    Self {
      chars: source.chars().peekable(),
      line: 1,
      col: 1,
    }
  }

  fn loc(&self) -> Location {
    Location::new(self.line, self.col)
  }

  fn bump(&mut self) -> Option<char> {
    let c = self.chars.next()?;
    if c == '\n' {
      self.line += 1;
      self.col = 1;
    } else {
      self.col += 1;
    }
    Some(c)
  }

  fn peek(&mut self) -> Option<char> {
    self.chars.peek().copied()
  }

  fn eat(&mut self, expected: char) -> bool {
    if self.peek() == Some(expected) {
      self.bump();
      true
    } else {
      false
    }
  }
}

fn lex(file: &str, source: &str) -> Result<Vec<Token>, SyntaxError> {
  let mut lx = Lexer::new(source);
  let mut tokens = Vec::new();

  while let Some(c) = lx.peek() {
    let loc = lx.loc();
    match c {
      ' ' | '\t' | '\r' | '\n' => {
        lx.bump();
      }
      '-' => {
        lx.bump();
        if lx.eat('-') {
          // Comment: long form if a long bracket follows, else to end of line.
          if lx.peek() == Some('[') {
            if let Some(level) = peek_long_bracket(&mut lx) {
              read_long_string(file, &mut lx, level, loc)?;
              continue;
            }
          }
          while let Some(c) = lx.peek() {
            if c == '\n' {
              break;
            }
            lx.bump();
          }
        } else {
          tokens.push(Token { tok: Tok::Sym("-"), loc });
        }
      }
      '"' | '\'' => {
        let quote = c;
        lx.bump();
        let mut text = String::new();
        loop {
          match lx.bump() {
            None | Some('\n') => {
              return Err(SyntaxError::new(file, Some(loc), "unterminated string literal"));
            }
            Some('\\') => {
              // Keep common escapes literal enough for pattern extraction.
              match lx.bump() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some(other) => text.push(other),
                None => {
                  return Err(SyntaxError::new(file, Some(loc), "unterminated string literal"));
                }
              }
            }
            Some(c) if c == quote => break,
            Some(c) => text.push(c),
          }
        }
        tokens.push(Token { tok: Tok::Str(text), loc });
      }
      '[' => {
        if let Some(level) = peek_long_bracket(&mut lx) {
          let text = read_long_string(file, &mut lx, level, loc)?;
          tokens.push(Token { tok: Tok::Str(text), loc });
        } else {
          lx.bump();
          tokens.push(Token { tok: Tok::Sym("["), loc });
        }
      }
      '0'..='9' => {
        lex_number(&mut lx);
        tokens.push(Token { tok: Tok::Number, loc });
      }
      'a'..='z' | 'A'..='Z' | '_' => {
        let mut name = String::new();
        while let Some(c) = lx.peek() {
          if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            lx.bump();
          } else {
            break;
          }
        }
        tokens.push(Token { tok: Tok::Name(name), loc });
      }
      '.' => {
        lx.bump();
        if lx.eat('.') {
          if lx.eat('.') {
            tokens.push(Token { tok: Tok::Sym("..."), loc });
          } else {
            tokens.push(Token { tok: Tok::Sym(".."), loc });
          }
        } else if matches!(lx.peek(), Some('0'..='9')) {
          lex_number(&mut lx);
          tokens.push(Token { tok: Tok::Number, loc });
        } else {
          tokens.push(Token { tok: Tok::Sym("."), loc });
        }
      }
      ':' => {
        lx.bump();
        if lx.eat(':') {
          tokens.push(Token { tok: Tok::Sym("::"), loc });
        } else {
          tokens.push(Token { tok: Tok::Sym(":"), loc });
        }
      }
      '=' => {
        lx.bump();
        if lx.eat('=') {
          tokens.push(Token { tok: Tok::Sym("=="), loc });
        } else {
          tokens.push(Token { tok: Tok::Sym("="), loc });
        }
      }
      '~' => {
        lx.bump();
        lx.eat('=');
        tokens.push(Token { tok: Tok::Sym("~="), loc });
      }
      '<' | '>' => {
        lx.bump();
        // <=, >=, <<, >> all behave the same for scanning purposes.
        if lx.peek() == Some('=') || lx.peek() == Some(c) {
          lx.bump();
        }
        tokens.push(Token {
          tok: Tok::Sym(if c == '<' { "<" } else { ">" }),
          loc,
        });
      }
      '/' => {
        lx.bump();
        lx.eat('/');
        tokens.push(Token { tok: Tok::Sym("/"), loc });
      }
      '(' | ')' | '{' | '}' | ']' | ',' | ';' | '+' | '*' | '%' | '^' | '#' | '&' | '|' => {
        lx.bump();
        tokens.push(Token {
          tok: Tok::Sym(sym_str(c)),
          loc,
        });
      }
      other => {
        return Err(SyntaxError::new(
          file,
          Some(loc),
          format!("unexpected character '{}'", other),
        ));
      }
    }
  }

  Ok(tokens)
}

fn sym_str(c: char) -> &'static str {
  match c {
    '(' => "(",
    ')' => ")",
    '{' => "{",
    '}' => "}",
    ']' => "]",
    ',' => ",",
    ';' => ";",
    '+' => "+",
    '*' => "*",
    '%' => "%",
    '^' => "^",
    '#' => "#",
    '&' => "&",
    '|' => "|",
    _ => unreachable!("not a single-char symbol"),
  }
}

fn lex_number(lx: &mut Lexer<'_>) {
  // Numbers carry no information for scanning; consume greedily.
  let mut prev_exp = false;
  while let Some(c) = lx.peek() {
    if c.is_ascii_alphanumeric() || c == '.' {
      prev_exp = matches!(c, 'e' | 'E' | 'p' | 'P');
      lx.bump();
    } else if prev_exp && (c == '+' || c == '-') {
      prev_exp = false;
      lx.bump();
    } else {
      break;
    }
  }
}

/// If the lexer sits on a long-bracket opener (`[[`, `[=[`, ...), consume it
/// and return its level. Leaves the lexer untouched otherwise.
fn peek_long_bracket(lx: &mut Lexer<'_>) -> Option<usize> {
  // Cheap lookahead over a clone of the char iterator.
  let mut probe = lx.chars.clone();
  if probe.next() != Some('[') {
    return None;
  }
  let mut level = 0;
  loop {
    match probe.next() {
      Some('=') => level += 1,
      Some('[') => break,
      _ => return None,
    }
  }
  // Commit: consume '[' '='* '['.
  lx.bump();
  for _ in 0..level {
    lx.bump();
  }
  lx.bump();
  Some(level)
}

fn read_long_string(
  file: &str,
  lx: &mut Lexer<'_>,
  level: usize,
  start: Location,
) -> Result<String, SyntaxError> {
  let mut text = String::new();
  loop {
    match lx.bump() {
      None => {
        return Err(SyntaxError::new(file, Some(start), "unterminated long bracket"));
      }
      Some(']') => {
        let mut eqs = 0;
        while lx.peek() == Some('=') {
          lx.bump();
          eqs += 1;
        }
        if eqs == level && lx.peek() == Some(']') {
          lx.bump();
          return Ok(text);
        }
        text.push(']');
        for _ in 0..eqs {
          text.push('=');
        }
      }
      Some(c) => text.push(c),
    }
  }
}

fn is_keyword(name: &str) -> bool {
  KEYWORDS.contains(&name)
}

fn analyze(file: &str, tokens: &[Token], errors: &mut Vec<SyntaxError>) -> ScanInfo {
  let mut info = ScanInfo::default();
  let mut depth: i32 = 0;

  for i in 0..tokens.len() {
    let token = &tokens[i];
    match &token.tok {
      Tok::Sym("(") | Tok::Sym("{") | Tok::Sym("[") => depth += 1,
      Tok::Sym(")") | Tok::Sym("}") | Tok::Sym("]") => depth -= 1,
      Tok::Sym("::") => {
        errors.push(SyntaxError::new(
          file,
          Some(token.loc),
          "labels are not allowed in PKG.lua files",
        ));
      }
      Tok::Name(name) => match name.as_str() {
        "goto" | "while" | "repeat" => {
          errors.push(SyntaxError::new(
            file,
            Some(token.loc),
            format!("'{}' statements are not allowed in PKG.lua files", name),
          ));
        }
        "function" => {
          if matches!(tokens.get(i + 1), Some(Token { tok: Tok::Name(n), .. }) if !is_keyword(n)) {
            errors.push(SyntaxError::new(
              file,
              Some(token.loc),
              "named function declarations are not allowed in PKG.lua files; \
               define macros in an imported module instead",
            ));
          }
        }
        _ if is_keyword(name) => {}
        _ => {
          // Field and method accesses are not calls of the bare name.
          let after_accessor = matches!(
            tokens.get(i.wrapping_sub(1)),
            Some(Token { tok: Tok::Sym("."), .. }) | Some(Token { tok: Tok::Sym(":"), .. })
          ) && i > 0;
          if after_accessor {
            continue;
          }
          match name.as_str() {
            "glob" => {
              if let Some((patterns, dirs)) = parse_glob_args(tokens, i + 1) {
                let set = if dirs { &mut info.globs_with_dirs } else { &mut info.globs };
                set.extend(patterns);
              }
            }
            "subpackages" => {
              if let Some((patterns, _)) = parse_glob_args(tokens, i + 1) {
                info.subpackages.extend(patterns);
              }
            }
            "import" => match parse_import_arg(tokens, i + 1) {
              Some(path) => info.imports.push(ImportRef {
                path,
                location: token.loc,
              }),
              None => errors.push(SyntaxError::new(
                file,
                Some(token.loc),
                "import() requires a literal string argument",
              )),
            },
            _ => {
              if depth == 0 && is_statement_start(tokens, i) && is_call(tokens.get(i + 1)) {
                info.annotations.insert(token.loc, name.clone());
              }
            }
          }
        }
      },
      _ => {}
    }
  }

  info
}

fn is_call(next: Option<&Token>) -> bool {
  matches!(
    next,
    Some(Token { tok: Tok::Sym("("), .. })
      | Some(Token { tok: Tok::Sym("{"), .. })
      | Some(Token { tok: Tok::Str(_), .. })
  )
}

fn is_statement_start(tokens: &[Token], i: usize) -> bool {
  if i == 0 {
    return true;
  }
  matches!(
    tokens[i - 1].tok,
    Tok::Sym(";") | Tok::Sym(")") | Tok::Sym("}") | Tok::Sym("]") | Tok::Str(_) | Tok::Number
  ) || matches!(&tokens[i - 1].tok, Tok::Name(n) if n == "end" || n == "do" || n == "then" || n == "else")
}

/// Parse the argument of a `glob`/`subpackages` call starting at `i`
/// (just past the callee name). Returns the literal include patterns and
/// whether `dirs = true` was given. Non-literal members are skipped.
fn parse_glob_args(tokens: &[Token], i: usize) -> Option<(Vec<String>, bool)> {
  let mut i = i;
  // glob("pat") | glob({...}) | glob{...}
  let mut paren = false;
  if matches!(tokens.get(i), Some(Token { tok: Tok::Sym("("), .. })) {
    paren = true;
    i += 1;
  }
  match tokens.get(i) {
    Some(Token { tok: Tok::Str(s), .. }) if paren => Some((vec![s.clone()], false)),
    Some(Token { tok: Tok::Sym("{"), .. }) => parse_glob_table(tokens, i + 1),
    _ => None,
  }
}

fn parse_glob_table(tokens: &[Token], start: usize) -> Option<(Vec<String>, bool)> {
  let mut patterns = Vec::new();
  let mut dirs = false;
  let mut depth = 1;
  let mut i = start;

  while depth > 0 {
    let token = tokens.get(i)?;
    match &token.tok {
      Tok::Sym("{") | Tok::Sym("(") | Tok::Sym("[") => {
        depth += 1;
        i += 1;
      }
      Tok::Sym("}") | Tok::Sym(")") | Tok::Sym("]") => {
        depth -= 1;
        i += 1;
      }
      Tok::Str(s) if depth == 1 => {
        // A positional string entry; named values were consumed below.
        patterns.push(s.clone());
        i += 1;
      }
      Tok::Name(key) if depth == 1 => {
        let is_field = matches!(tokens.get(i + 1), Some(Token { tok: Tok::Sym("="), .. }));
        if !is_field {
          i += 1;
          continue;
        }
        match key.as_str() {
          "dirs" => {
            if matches!(tokens.get(i + 2), Some(Token { tok: Tok::Name(v), .. }) if v == "true") {
              dirs = true;
            }
            i += 3;
          }
          "include" => {
            if let Some((inner, end)) = parse_string_list(tokens, i + 2) {
              patterns.extend(inner);
              i = end;
            } else {
              i += 2;
            }
          }
          _ => {
            // Skip the value of any other field (exclude, allow_empty, ...).
            i += 2;
          }
        }
      }
      _ => {
        i += 1;
      }
    }
  }

  Some((patterns, dirs))
}

/// Parse a literal `{ "a", "b" }` at `i`; returns the strings and the index
/// just past the closing brace.
fn parse_string_list(tokens: &[Token], i: usize) -> Option<(Vec<String>, usize)> {
  if !matches!(tokens.get(i), Some(Token { tok: Tok::Sym("{"), .. })) {
    return None;
  }
  let mut out = Vec::new();
  let mut j = i + 1;
  loop {
    match &tokens.get(j)?.tok {
      Tok::Sym("}") => return Some((out, j + 1)),
      Tok::Str(s) => {
        out.push(s.clone());
        j += 1;
      }
      Tok::Sym(",") => j += 1,
      _ => return None,
    }
  }
}

fn parse_import_arg(tokens: &[Token], i: usize) -> Option<String> {
  match tokens.get(i) {
    Some(Token { tok: Tok::Str(s), .. }) => Some(s.clone()),
    Some(Token { tok: Tok::Sym("("), .. }) => match (tokens.get(i + 1), tokens.get(i + 2)) {
      (Some(Token { tok: Tok::Str(s), .. }), Some(Token { tok: Tok::Sym(")"), .. })) => Some(s.clone()),
      _ => None,
    },
    _ => None,
  }
}
