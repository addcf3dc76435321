//! Newline-delimited JSON framing over blocking streams.

use std::io::{self, BufRead, Write};

use serde::{Serialize, de::DeserializeOwned};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reads the next non-empty line, without its terminator.
///
/// Returns `Ok(None)` once the peer has closed the stream.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

pub fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: BufRead,
    T: DeserializeOwned,
{
    match read_frame(reader)? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded)?;
    writer.flush()
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::command::Reply;

    #[test]
    fn skips_blank_lines_and_stops_at_eof() {
        let mut input = Cursor::new("\n\r\n{\"status\":\"ok\",\"key\":\"k\"}\r\n");
        let reply: Option<Reply> = read_message(&mut input).unwrap();
        assert_eq!(reply, Some(Reply::ok("k")));
        let next: Option<Reply> = read_message(&mut input).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn writes_one_line_per_message() {
        let mut out = Vec::new();
        write_message(&mut out, &Reply::failed("k")).unwrap();
        write_message(&mut out, &Reply::malformed()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"status\":\"failed\",\"key\":\"k\"}\n{\"status\":\"failed\"}\n"
        );
    }
}
