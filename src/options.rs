/*!
  Pattern compiler options, parsed from an option-letter string such as
  `"imx"` or `"e=%;n=calc"`. Letter values follow the engine's option
  vocabulary: `b` (no bracket escapes), `e=<byte>` (escape character),
  `i m s x q u` (modes), `o` (optimize), `p` (emit predictor), `r` (raise
  errors), `w` (warn to stderr), `f=<file>` (emit tables), `n=<name>`,
  `z=<namespace>`. An unknown letter fails with `InvalidModifier`.
*/

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::character::Char;
use crate::error::{ErrorKind, RegexError, Result};
use crate::Index32;

/// Global modifier modes, syntax flags, and compiler options.
#[derive(Clone, Debug)]
pub struct Options {
  pub bracket_escapes  : bool,        //< disable escapes in bracket lists
  pub escape_character : Char,        //< escape character, or > 255 for none, '\\' default
  pub filenames        : Vec<String>, //< filenames for table emission (accepted, unused here)
  pub insensitive_case : bool,        //< case insensitive mode, also `(?i:X)`
  pub multiline        : bool,        //< multi-line mode, also `(?m:X)`
  pub name             : String,      //< pattern name
  pub optimize         : bool,        //< spend extra compile time on prefilter tables
  pub predict          : bool,        //< build the predict-match tables
  pub quote_with_x     : bool,        //< enable "X" quotation of verbatim content, `(?q:X)`
  pub raise_on_error   : bool,        //< raise syntax errors (always on; kept for letter compat)
  pub single_line      : bool,        //< single-line mode (dotall), also `(?s:X)`
  pub unicode          : bool,        //< permissive Unicode classes, also `(?u:X)`
  pub write_to_stderr  : bool,        //< write warnings to stderr
  pub x_freespacing    : bool,        //< free-spacing mode, also `(?x:X)`
  pub z_namespace      : String,      //< namespace (NAME1.NAME2.NAME3)

  /// Named macro substitutions applied to `{name}` uses in the regex.
  pub macros: HashMap<String, String>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      bracket_escapes: false,
      escape_character: '\\'.into(),
      filenames: vec![],
      insensitive_case: false,
      multiline: false,
      name: String::new(),
      optimize: false,
      predict: false,
      quote_with_x: false,
      raise_on_error: false,
      single_line: false,
      unicode: false,
      write_to_stderr: false,
      x_freespacing: false,
      z_namespace: String::new(),
      macros: HashMap::new(),
    }
  }
}

impl Display for Options {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let mut letters = String::new();
    for (flag, letter) in [
      (self.bracket_escapes, 'b'),
      (self.insensitive_case, 'i'),
      (self.multiline, 'm'),
      (self.optimize, 'o'),
      (self.predict, 'p'),
      (self.quote_with_x, 'q'),
      (self.raise_on_error, 'r'),
      (self.single_line, 's'),
      (self.unicode, 'u'),
      (self.write_to_stderr, 'w'),
      (self.x_freespacing, 'x'),
    ]
    .iter()
    {
      if *flag {
        letters.push(*letter);
      }
    }
    write!(f, "{}", letters)
  }
}

impl Options {

  pub fn new(options_string: &str) -> Result<Self> {
    let mut options: Self = Self::default();
    options.parse_options(options_string)?;
    Ok(options)
  }

  /// Registers a `{name}` macro substitution.
  pub fn define_macro(&mut self, name: &str, replacement: &str) -> &mut Self {
    self.macros.insert(name.to_string(), replacement.to_string());
    self
  }

  pub fn parse_options(&mut self, option_string: &str) -> Result<()> {
    // We can index into a byte slice but not a `&str`.
    let option_bytes = option_string.as_bytes();

    // Cannot use iterator/`for` syntax, because we modify `option_index`
    // within the loop.
    let mut option_index = 0;
    while option_index < option_bytes.len() {
      let c = option_bytes[option_index];
      match c {
        b'b' => {
          self.bracket_escapes = true;
        }
        b'i' => {
          self.insensitive_case = true;
        }
        b'm' => {
          self.multiline = true;
        }
        b'o' => {
          self.optimize = true;
        }
        b'p' => {
          self.predict = true;
        }
        b'q' => {
          self.quote_with_x = true;
        }
        b'r' => {
          self.raise_on_error = true;
        }
        b's' => {
          self.single_line = true;
        }
        b'u' => {
          self.unicode = true;
        }
        b'w' => {
          self.write_to_stderr = true;
        }
        b'x' => {
          self.x_freespacing = true;
        }
        b'e' => {
          if option_index + 1 != option_bytes.len() && option_bytes[option_index + 1] == b'=' {
            option_index += 1;
          }
          self.escape_character =
            match option_index + 1 == option_bytes.len() || option_bytes[option_index + 1] == b';' {
              true => {
                Char(256) // no escape character
              }
              false => {
                option_index += 1;
                Char::from(option_bytes[option_index])
              }
            };
        }
        b'f' => {
          let values = parse_values(option_bytes, &mut option_index);
          self.filenames.extend(values);
        }
        b'n' => {
          if let Some(name) = parse_values(option_bytes, &mut option_index).pop() {
            self.name = name;
          }
        }
        b'z' => {
          if let Some(namespace) = parse_values(option_bytes, &mut option_index).pop() {
            self.z_namespace = namespace;
          }
        }
        b';' | b' ' | b',' => { /* separators */ }
        _ => {
          return Err(RegexError::new(ErrorKind::InvalidModifier, option_index as Index32));
        }
      }

      option_index += 1;
    }
    Ok(())
  }
}

/**
  Parse the value associated with an option of the form `x=value`. Note that
  the value can be a list. This function advances `start_index`. For example:

  ```text
    f=one.h, one.cpp, two.cpp, stdout;
  ```
*/
fn parse_values(opt_bytes: &[u8], start_index: &mut usize) -> Vec<String> {
  let mut values: Vec<String> = Vec::new();

  if *start_index + 1 < opt_bytes.len() && opt_bytes[*start_index + 1] == b'=' {
    *start_index += 1;
  }
  let mut end_index: usize = *start_index;

  // Sets start_index to one before the first char of the value after '=',
  // then increments end_index until it is one past the end of the value.
  while *start_index < opt_bytes.len() && opt_bytes[*start_index] != b';' {
    if end_index == opt_bytes.len()
      || opt_bytes[end_index] == b','
      || opt_bytes[end_index] == b';'
      || Char::from(opt_bytes[end_index]).is_whitespace()
    {
      if end_index > *start_index + 1 {
        values.push(String::from_utf8_lossy(&opt_bytes[(*start_index + 1)..end_index]).into_owned());
        // There may be a list of values; accumulate them all.
      }
      *start_index = end_index;
      if end_index >= opt_bytes.len() {
        break;
      }
    }
    end_index += 1;
  }

  values
}


#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_options() {
    let opt = Options::default();
    assert!(!opt.bracket_escapes);
    assert!(!opt.insensitive_case);
    assert!(!opt.multiline);
    assert!(!opt.optimize);
    assert!(!opt.predict);
    assert!(!opt.quote_with_x);
    assert!(!opt.raise_on_error);
    assert!(!opt.single_line);
    assert!(!opt.unicode);
    assert!(!opt.write_to_stderr);
    assert!(!opt.x_freespacing);

    assert_eq!(opt.escape_character, '\\');
    assert_eq!(opt.name, String::new());
    assert_eq!(opt.z_namespace, String::new());
    assert!(opt.filenames.is_empty());
  }

  #[test]
  fn binary_options() {
    let opt = Options::new("bimopqrsuwx").unwrap();
    assert!(opt.bracket_escapes);
    assert!(opt.insensitive_case);
    assert!(opt.multiline);
    assert!(opt.optimize);
    assert!(opt.predict);
    assert!(opt.quote_with_x);
    assert!(opt.raise_on_error);
    assert!(opt.single_line);
    assert!(opt.unicode);
    assert!(opt.write_to_stderr);
    assert!(opt.x_freespacing);
  }

  #[test]
  fn escape_character_option() {
    let opt = Options::new("e=%").unwrap();
    assert_eq!(opt.escape_character, '%');

    let opt = Options::new("e=;i").unwrap();
    assert_eq!(opt.escape_character, Char(256));
    assert!(opt.insensitive_case);
  }

  #[test]
  fn name_and_namespace() {
    let opt = Options::new("n=calc;z=one.two;m").unwrap();
    assert_eq!(opt.name, "calc");
    assert_eq!(opt.z_namespace, "one.two");
    assert!(opt.multiline);
  }

  #[test]
  fn filenames_options() {
    let opt = Options::new("bf=one.h, one.cpp, two.cpp, stdout;mo").unwrap();

    assert_eq!(opt.filenames.len(), 4);
    assert_eq!(opt.filenames[0], "one.h");
    assert_eq!(opt.filenames[1], "one.cpp");
    assert_eq!(opt.filenames[2], "two.cpp");
    assert_eq!(opt.filenames[3], "stdout");

    // Non-interference with other options.
    assert!(opt.bracket_escapes);
    assert!(opt.multiline);
    assert!(opt.optimize);
  }

  #[test]
  fn unknown_letter_is_invalid_modifier() {
    let err = Options::new("imk").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidModifier);
    assert_eq!(err.idx(), 2);
  }

  #[test]
  fn macro_definitions() {
    let mut opt = Options::default();
    opt.define_macro("digit", "[0-9]");
    assert_eq!(opt.macros.get("digit").map(String::as_str), Some("[0-9]"));
  }
}
