//! Named-pipe plumbing for the batch rendezvous protocol.
//!
//! All FIFOs are created with owner read/write permissions. Opening a FIFO
//! for reading blocks until a writer connects and vice versa; the server
//! relies on this for back-pressure against the driver.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::errors::TargetedBfsError;

pub fn make_pipe(path: &Path) -> Result<(), TargetedBfsError> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| TargetedBfsError::Io(io::Error::from_raw_os_error(e as i32)))
}

/// Write the single-byte acknowledgement token. Blocks until the peer has
/// the pipe open for reading.
pub fn confirm_pipe(path: &Path) -> Result<(), TargetedBfsError> {
    let mut pipe = OpenOptions::new().write(true).open(path)?;
    pipe.write_all(b"1\n")?;
    Ok(())
}

/// Open a FIFO and read one whitespace-terminated token from it. Returns an
/// empty string if the writer closes without sending one.
pub fn read_token(path: &Path) -> Result<String, TargetedBfsError> {
    let mut tokens = Tokens::new(BufReader::new(File::open(path)?));
    Ok(tokens.next_token()?.unwrap_or_default())
}

/// Streaming whitespace-separated token reader. Line breaks carry no
/// meaning; tokens are recovered purely positionally.
pub struct Tokens<R: BufRead> {
    reader: R,
}

impl<R: BufRead> Tokens<R> {
    pub fn new(reader: R) -> Self {
        Tokens { reader }
    }

    pub fn next_token(&mut self) -> io::Result<Option<String>> {
        let mut token: Vec<u8> = Vec::new();
        loop {
            let (consumed, stop) = {
                let buf = self.reader.fill_buf()?;
                let mut consumed = 0;
                let mut stop = buf.is_empty();
                for &b in buf {
                    consumed += 1;
                    if b.is_ascii_whitespace() {
                        if !token.is_empty() {
                            stop = true;
                            break;
                        }
                    } else {
                        token.push(b);
                    }
                }
                (consumed, stop)
            };
            self.reader.consume(consumed);
            if stop || consumed == 0 {
                break;
            }
        }
        if token.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&token).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str) -> Vec<String> {
        let mut tokens = Tokens::new(Cursor::new(input.as_bytes().to_vec()));
        let mut out = Vec::new();
        while let Some(t) = tokens.next_token().unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn splits_on_any_whitespace() {
        assert_eq!(collect("a b\tc\nd\n\n e"), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(collect("").is_empty());
        assert!(collect(" \n\t ").is_empty());
    }

    #[test]
    fn final_token_without_trailing_whitespace() {
        assert_eq!(collect("one two"), vec!["one", "two"]);
    }
}
