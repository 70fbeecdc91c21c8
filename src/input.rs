/*!
  The byte source a matcher consumes. An `Input` either wraps an owned byte
  buffer (strings, vectors) or a boxed `std::io::Read`. Read errors are
  deliberately indistinguishable from end of input: the matcher drains what
  it has and terminates, per the engine's no-runtime-errors contract.
*/

use std::io::Read;

pub struct Input {
  src: Source,
}

enum Source {
  Empty,
  Bytes { data: Vec<u8>, at: usize },
  Reader(Box<dyn Read>),
}

impl Input {

  pub fn empty() -> Input {
    Input { src: Source::Empty }
  }

  pub fn from_reader<R: Read + 'static>(reader: R) -> Input {
    Input { src: Source::Reader(Box::new(reader)) }
  }

  /// Fills `buf` with the next bytes of input, returning the count; 0 means
  /// end of input. Read failures surface as end of input.
  pub fn read(&mut self, buf: &mut [u8]) -> usize {
    match &mut self.src {
      Source::Empty => 0,
      Source::Bytes { data, at } => {
        let n = (data.len() - *at).min(buf.len());
        buf[..n].copy_from_slice(&data[*at..*at + n]);
        *at += n;
        n
      }
      Source::Reader(reader) => reader.read(buf).unwrap_or(0),
    }
  }

  /// True when the source can never produce more bytes without `read`
  /// being attempted (used only as a hint).
  pub fn is_empty_source(&self) -> bool {
    match &self.src {
      Source::Empty => true,
      Source::Bytes { data, at } => *at >= data.len(),
      Source::Reader(_) => false,
    }
  }
}

impl Default for Input {
  fn default() -> Input {
    Input::empty()
  }
}

impl From<&str> for Input {
  fn from(s: &str) -> Input {
    Input { src: Source::Bytes { data: s.as_bytes().to_vec(), at: 0 } }
  }
}

impl From<String> for Input {
  fn from(s: String) -> Input {
    Input { src: Source::Bytes { data: s.into_bytes(), at: 0 } }
  }
}

impl From<&[u8]> for Input {
  fn from(b: &[u8]) -> Input {
    Input { src: Source::Bytes { data: b.to_vec(), at: 0 } }
  }
}

impl From<Vec<u8>> for Input {
  fn from(b: Vec<u8>) -> Input {
    Input { src: Source::Bytes { data: b, at: 0 } }
  }
}


#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn reads_bytes_in_chunks() {
    let mut input = Input::from("hello world");
    let mut buf = [0u8; 4];
    assert_eq!(input.read(&mut buf), 4);
    assert_eq!(&buf, b"hell");
    assert_eq!(input.read(&mut buf), 4);
    assert_eq!(&buf, b"o wo");
    assert_eq!(input.read(&mut buf), 3);
    assert_eq!(&buf[..3], b"rld");
    assert_eq!(input.read(&mut buf), 0);
  }

  #[test]
  fn reader_source() {
    let cursor = std::io::Cursor::new(b"abc".to_vec());
    let mut input = Input::from_reader(cursor);
    let mut buf = [0u8; 8];
    assert_eq!(input.read(&mut buf), 3);
    assert_eq!(&buf[..3], b"abc");
    assert_eq!(input.read(&mut buf), 0);
  }

  #[test]
  fn empty_source() {
    let mut input = Input::empty();
    let mut buf = [0u8; 8];
    assert_eq!(input.read(&mut buf), 0);
    assert!(input.is_empty_source());
  }
}
