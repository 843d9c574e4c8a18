//! `Content-Range` and `multipart/byteranges` (RFC 9110 §14.6) parsing.

use bytes::Bytes;
use seekpull_core::{Region, SeekpullError, SeekpullResult};

/// Bytes for one region, as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub region: Region,
    pub data: Bytes,
}

/// Parse `bytes <start>-<end>/<total|*>`.
pub fn parse_content_range(value: &str) -> SeekpullResult<(Region, Option<u64>)> {
    let invalid = || SeekpullError::protocol(format!("invalid Content-Range: {value}"));
    let value = value.trim();
    let (unit, spec) = value.split_once(char::is_whitespace).ok_or_else(invalid)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return Err(invalid());
    }
    let (range, total) = spec.trim().split_once('/').ok_or_else(invalid)?;
    let total = match total {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| invalid())?),
    };
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.parse().map_err(|_| invalid())?;
    let end: u64 = end.parse().map_err(|_| invalid())?;
    if end < start || total.is_some_and(|t| end >= t) {
        return Err(invalid());
    }
    Ok((Region::new(start, end), total))
}

/// The `boundary` parameter of a `multipart/*` content type.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Iterator over the parts of a `multipart/byteranges` body.
///
/// Each part's length comes from its own `Content-Range`; a body that is
/// shorter, or whose next delimiter does not follow where expected, ends the
/// iteration with an error. Not restartable.
pub struct MultipartParts {
    body: Bytes,
    delimiter: Vec<u8>,
    object_size: u64,
    pos: usize,
    started: bool,
    done: bool,
}

impl MultipartParts {
    pub fn new(body: Bytes, boundary: &str, object_size: u64) -> Self {
        MultipartParts {
            body,
            delimiter: format!("--{boundary}").into_bytes(),
            object_size,
            pos: 0,
            started: false,
            done: false,
        }
    }

    fn rest(&self) -> &[u8] {
        &self.body[self.pos..]
    }

    fn skip_newline(&mut self) -> bool {
        if self.rest().starts_with(b"\r\n") {
            self.pos += 2;
            true
        } else if self.rest().starts_with(b"\n") {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn read_line(&mut self) -> SeekpullResult<&str> {
        let rest = &self.body[self.pos..];
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| SeekpullError::protocol("unterminated multipart header"))?;
        let line = rest[..nl].strip_suffix(b"\r").unwrap_or(&rest[..nl]);
        self.pos += nl + 1;
        std::str::from_utf8(line)
            .map_err(|_| SeekpullError::protocol("multipart header is not UTF-8"))
    }

    fn next_part(&mut self) -> SeekpullResult<Option<Part>> {
        if !self.started {
            let at = self
                .body
                .windows(self.delimiter.len())
                .position(|w| w == self.delimiter.as_slice())
                .ok_or_else(|| SeekpullError::protocol("multipart body has no boundary"))?;
            self.pos = at + self.delimiter.len();
            self.started = true;
        }

        if self.rest().starts_with(b"--") {
            return Ok(None);
        }
        while self.rest().first().is_some_and(|&b| b == b' ' || b == b'\t') {
            self.pos += 1;
        }
        if !self.skip_newline() {
            return Err(SeekpullError::protocol("malformed multipart delimiter line"));
        }

        let mut content_range = None;
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    content_range = Some(value.trim().to_string());
                }
            }
        }
        let content_range = content_range
            .ok_or_else(|| SeekpullError::protocol("multipart part without Content-Range"))?;
        let (region, total) = parse_content_range(&content_range)?;
        if total.is_some_and(|t| t != self.object_size) || region.end >= self.object_size {
            return Err(SeekpullError::protocol(format!(
                "part {content_range} does not fit object of {} bytes",
                self.object_size
            )));
        }

        let len = region.size() as usize;
        let available = self.body.len() - self.pos;
        if available < len {
            return Err(SeekpullError::ShortRead {
                expected: len as u64,
                actual: available as u64,
            });
        }
        let data = self.body.slice(self.pos..self.pos + len);
        self.pos += len;

        if !self.skip_newline() || !self.rest().starts_with(&self.delimiter) {
            return Err(SeekpullError::protocol(format!(
                "part {content_range} is not followed by a boundary"
            )));
        }
        self.pos += self.delimiter.len();
        Ok(Some(Part { region, data }))
    }
}

impl Iterator for MultipartParts {
    type Item = SeekpullResult<Part>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_part() {
            Ok(Some(part)) => Some(Ok(part)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
