//! gzip member framing (RFC 1952) around the DEFLATE stream.

use std::io::{ErrorKind, Read};

use seekpull_core::{SeekpullError, SeekpullResult};

const ID1: u8 = 0x1f;
const ID2: u8 = 0x8b;
const CM_DEFLATE: u8 = 8;

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;
const FRESERVED: u8 = 0xe0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipHeader {
    pub mtime: u32,
    pub os: u8,
    pub name: Option<String>,
    /// Offset of the first DEFLATE byte
    pub len: u64,
}

/// Parse the member header straight off `input`, leaving it at the first
/// DEFLATE byte.
pub(crate) fn read_header<R: Read>(input: &mut R) -> SeekpullResult<GzipHeader> {
    let mut len = 0u64;
    let mut fixed = [0u8; 10];
    read_exact(input, &mut fixed, &mut len)?;
    if fixed[0] != ID1 || fixed[1] != ID2 {
        return Err(SeekpullError::decode("not a gzip stream"));
    }
    if fixed[2] != CM_DEFLATE {
        return Err(SeekpullError::decode(format!(
            "unsupported gzip compression method {}",
            fixed[2]
        )));
    }
    let flags = fixed[3];
    if flags & FRESERVED != 0 {
        return Err(SeekpullError::decode("reserved gzip header flags set"));
    }

    if flags & FEXTRA != 0 {
        let mut xlen = [0u8; 2];
        read_exact(input, &mut xlen, &mut len)?;
        let mut extra = vec![0u8; u16::from_le_bytes(xlen) as usize];
        read_exact(input, &mut extra, &mut len)?;
    }
    let name = if flags & FNAME != 0 {
        Some(zero_terminated(input, &mut len)?)
    } else {
        None
    };
    if flags & FCOMMENT != 0 {
        zero_terminated(input, &mut len)?;
    }
    if flags & FHCRC != 0 {
        read_exact(input, &mut [0u8; 2], &mut len)?;
    }

    Ok(GzipHeader {
        mtime: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
        os: fixed[9],
        name,
        len,
    })
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8], len: &mut u64) -> SeekpullResult<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => SeekpullError::decode("truncated gzip header"),
        _ => SeekpullError::Io(e),
    })?;
    *len += buf.len() as u64;
    Ok(())
}

fn zero_terminated<R: Read>(input: &mut R, len: &mut u64) -> SeekpullResult<String> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        read_exact(input, &mut byte, len)?;
        match byte[0] {
            0 => break,
            b => raw.push(b),
        }
    }
    // RFC 1952 says ISO 8859-1
    Ok(raw.into_iter().map(char::from).collect())
}

/// CRC-32 and ISIZE from the 8-byte member trailer.
pub(crate) fn parse_trailer(trailer: [u8; 8]) -> (u32, u32) {
    (
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]),
        u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::{Compression, GzBuilder};
    use std::io::Write;

    #[test]
    fn plain_header() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello").unwrap();
        let gz = enc.finish().unwrap();

        let mut input = gz.as_slice();
        let header = read_header(&mut input).unwrap();
        assert_eq!(header.len, 10);
        assert_eq!(header.name, None);
    }

    #[test]
    fn header_with_name_comment_and_extra() {
        let mut enc = GzBuilder::new()
            .filename("layer.tar")
            .comment("built for tests")
            .extra(vec![1, 2, 3, 4])
            .mtime(1_700_000_000)
            .write(Vec::new(), Compression::default());
        enc.write_all(b"payload").unwrap();
        let gz = enc.finish().unwrap();

        let mut input = gz.as_slice();
        let header = read_header(&mut input).unwrap();
        assert_eq!(header.name.as_deref(), Some("layer.tar"));
        assert_eq!(header.mtime, 1_700_000_000);
        // 10 fixed + 2+4 extra + name\0 + comment\0
        assert_eq!(header.len, 10 + 6 + 10 + 16);
    }

    #[test]
    fn rejects_non_gzip() {
        let mut input = &b"PK\x03\x04 definitely a zip"[..];
        assert!(matches!(
            read_header(&mut input),
            Err(SeekpullError::Decode(_))
        ));
    }

    #[test]
    fn rejects_short_header() {
        let mut input = &[0x1f_u8, 0x8b, 8][..];
        assert!(matches!(
            read_header(&mut input),
            Err(SeekpullError::Decode(_))
        ));
    }
}
