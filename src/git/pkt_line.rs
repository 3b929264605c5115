//! Git pkt-line framing and the protocol v2 commands built on top of it.
//!
//! Each line is prefixed with its total length as 4 lowercase hex digits;
//! lengths below 4 are structural markers with no payload.
//! See: https://git-scm.com/docs/protocol-common#_pkt_line_format

use crate::git::{
    any_git_object::Sha,
    error::{GitError, PktLineError, ProtocolError},
};
use bytes::{Bytes, BytesMut};
use strum::EnumTryAs;
use tracing::{debug, trace};

const PKT_LEN_SIZE: usize = 4;
/// Largest value a 4-hex-digit length can declare.
const MAX_PKT_LEN: usize = 0xffff;
const FLUSH_PKT: &[u8] = b"0000";
const DELIM_PKT: &[u8] = b"0001";

/// Sideband channel carrying packfile data.
const BAND_PACK_DATA: u8 = 0x01;
const BAND_PROGRESS: u8 = 0x02;
const BAND_ERROR: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, EnumTryAs)]
pub enum PktLine {
    Data(Bytes),
    /// `0000`
    Flush,
    /// `0001`
    Delimiter,
    /// `0002`, or the unused `0003`
    ResponseEnd,
}

impl PktLine {
    /// Returns the payload, or `None` for markers.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        self.data().is_none()
    }
}

/// Frames `lines` for a request body. An empty line becomes a delimiter
/// packet; every other line is sent verbatim, so callers include their own
/// trailing `\n`. A flush packet closes the body.
pub fn encode<S: AsRef<str>>(lines: &[S]) -> Result<Bytes, PktLineError> {
    let mut buf = BytesMut::new();
    for line in lines {
        let line = line.as_ref();
        if line.is_empty() {
            buf.extend_from_slice(DELIM_PKT);
            continue;
        }
        let len = line.len() + PKT_LEN_SIZE;
        if len > MAX_PKT_LEN {
            return Err(PktLineError::LineTooLong(line.len()));
        }
        buf.extend_from_slice(format!("{len:04x}").as_bytes());
        buf.extend_from_slice(line.as_bytes());
    }
    buf.extend_from_slice(FLUSH_PKT);
    Ok(buf.freeze())
}

/// Splits a response buffer into lines and markers.
pub fn decode(buffer: Bytes) -> Result<Vec<PktLine>, PktLineError> {
    PktLineIter::new(buffer).collect()
}

/// Lazily reads pkt-lines from a buffer. Stops after the first error.
pub struct PktLineIter {
    buffer: Bytes,
    pos: usize,
    failed: bool,
}

impl PktLineIter {
    pub fn new(buffer: Bytes) -> Self {
        Self {
            buffer,
            pos: 0,
            failed: false,
        }
    }

    fn read(&mut self) -> Result<PktLine, PktLineError> {
        let remaining = self.buffer.len() - self.pos;
        let header = self
            .buffer
            .get(self.pos..self.pos + PKT_LEN_SIZE)
            .ok_or(PktLineError::TruncatedHeader { remaining })?;
        let declared = parse_pkt_len(header)?;

        if declared < PKT_LEN_SIZE {
            self.pos += PKT_LEN_SIZE;
            return Ok(match declared {
                0 => PktLine::Flush,
                1 => PktLine::Delimiter,
                _ => PktLine::ResponseEnd,
            });
        }

        // A frame that ends exactly at the end of the buffer is valid.
        if declared > remaining {
            return Err(PktLineError::LengthExceedsBuffer {
                declared,
                remaining,
            });
        }
        let data = self
            .buffer
            .slice(self.pos + PKT_LEN_SIZE..self.pos + declared);
        self.pos += declared;
        Ok(PktLine::Data(data))
    }
}

impl Iterator for PktLineIter {
    type Item = Result<PktLine, PktLineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buffer.len() {
            return None;
        }
        let line = self.read();
        self.failed = line.is_err();
        Some(line)
    }
}

fn parse_pkt_len(header: &[u8]) -> Result<usize, PktLineError> {
    let invalid = || PktLineError::InvalidLengthHeader(String::from_utf8_lossy(header).into_owned());
    // from_str_radix would also accept a leading '+'
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(header).map_err(|_| invalid())?;
    usize::from_str_radix(digits, 16).map_err(|_| invalid())
}

/// A reference advertised by `ls-refs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub object_id: Sha,
    pub name: String,
    /// Target of a symbolic ref such as `HEAD`, when the server reports it.
    pub symref_target: Option<String>,
    /// Object an annotated tag peels to, when the server reports it.
    pub peeled: Option<Sha>,
}

impl GitRef {
    /// Parses `"<hex> <name>[ <attribute>...]\n"`.
    pub fn read(line: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedRef(String::from_utf8_lossy(line).into_owned());
        let text = std::str::from_utf8(line).map_err(|_| malformed())?;
        let mut parts = text.trim_end_matches('\n').split(' ');

        let object_id = parts
            .next()
            .and_then(|hex_str| Sha::from_hex(hex_str).ok())
            .ok_or_else(malformed)?;
        let name = parts
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(malformed)?
            .to_owned();

        let mut git_ref = Self {
            object_id,
            name,
            symref_target: None,
            peeled: None,
        };
        for attribute in parts {
            if let Some(target) = attribute.strip_prefix("symref-target:") {
                git_ref.symref_target = Some(target.to_owned());
            } else if let Some(peeled) = attribute.strip_prefix("peeled:") {
                git_ref.peeled = Some(Sha::from_hex(peeled).map_err(|_| malformed())?);
            }
        }
        Ok(git_ref)
    }
}

fn command_header(command: &str) -> Vec<String> {
    vec![
        format!("command={command}\n"),
        "object-format=sha1\n".to_owned(),
        String::new(),
    ]
}

fn fetch_arguments() -> Vec<String> {
    let mut lines = command_header("fetch");
    lines.extend(
        ["thin-pack\n", "no-progress\n", "ofs-delta\n", "deepen 1\n", "filter blob:none\n"]
            .map(str::to_owned),
    );
    lines
}

pub fn ls_refs_command() -> Result<Bytes, PktLineError> {
    let mut lines = command_header("ls-refs");
    lines.push("symrefs\n".to_owned());
    lines.push("peel\n".to_owned());
    encode(&lines)
}

/// Shallow single-commit fetch of the tree behind `want` (a ref or object id), without blobs.
pub fn fetch_tree_command(want: &str) -> Result<Bytes, PktLineError> {
    let mut lines = fetch_arguments();
    lines.push(format!("want {want}\n"));
    lines.push("done\n".to_owned());
    encode(&lines)
}

/// Fetches specific blobs by id on top of a shallow `branch`.
pub fn fetch_blobs_command(shallow: &str, wants: &[Sha]) -> Result<Bytes, PktLineError> {
    let mut lines = fetch_arguments();
    lines.push(format!("shallow {shallow}\n"));
    lines.extend(wants.iter().map(|want| format!("want {want}\n")));
    lines.push("done\n".to_owned());
    encode(&lines)
}

/// Parses an `ls-refs` response body.
pub fn parse_ls_refs(response: Bytes) -> Result<Vec<GitRef>, GitError> {
    let mut refs = vec![];
    for line in PktLineIter::new(response) {
        match line? {
            PktLine::Data(data) => {
                check_remote_error(&data)?;
                refs.push(GitRef::read(&data)?);
            }
            PktLine::Flush => break,
            PktLine::Delimiter | PktLine::ResponseEnd => {}
        }
    }
    debug!(count = refs.len(), "parsed ls-refs response");
    Ok(refs)
}

/// Extracts the packfile stream from a `fetch` response: everything after
/// the `packfile` section header, band byte stripped, concatenated.
pub fn extract_packfile(response: Bytes) -> Result<Bytes, GitError> {
    let mut lines = PktLineIter::new(response);

    loop {
        match lines.next().transpose()? {
            Some(PktLine::Data(data)) => {
                check_remote_error(&data)?;
                if &data[..] == b"packfile\n" {
                    break;
                }
                trace!(line = %String::from_utf8_lossy(&data).trim_end(), "skipping section line");
            }
            Some(_) => {}
            None => return Err(ProtocolError::MissingPackfile.into()),
        }
    }

    let mut pack = BytesMut::new();
    for line in lines {
        let data = match line? {
            PktLine::Data(data) => data,
            PktLine::Flush | PktLine::ResponseEnd => break,
            PktLine::Delimiter => continue,
        };
        match data.first() {
            Some(&BAND_PACK_DATA) => pack.extend_from_slice(&data[1..]),
            Some(&BAND_PROGRESS) => {
                debug!(progress = %String::from_utf8_lossy(&data[1..]).trim_end(), "remote progress")
            }
            Some(&BAND_ERROR) => {
                return Err(ProtocolError::RemoteError(
                    String::from_utf8_lossy(&data[1..]).trim_end().to_owned(),
                )
                .into())
            }
            _ => {
                return Err(ProtocolError::UnexpectedLine(
                    String::from_utf8_lossy(&data).into_owned(),
                )
                .into())
            }
        }
    }
    debug!(bytes = pack.len(), "extracted packfile stream");
    Ok(pack.freeze())
}

fn check_remote_error(data: &[u8]) -> Result<(), ProtocolError> {
    match data.strip_prefix(b"ERR ") {
        Some(message) => Err(ProtocolError::RemoteError(
            String::from_utf8_lossy(message).trim_end().to_owned(),
        )),
        None => Ok(()),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: decode(encode(lines)) gives back the non-empty lines, then a flush
        #[test]
        fn prop_pkt_line_roundtrip(lines in prop::collection::vec("[ -~]{0,200}\n?", 0..20)) {
            let decoded = decode(encode(&lines).unwrap()).unwrap();
            prop_assert_eq!(decoded.len(), lines.len() + 1);
            for (line, pkt) in lines.iter().zip(&decoded) {
                if line.is_empty() {
                    prop_assert_eq!(pkt, &PktLine::Delimiter);
                } else {
                    prop_assert_eq!(pkt.data(), Some(line.as_bytes()));
                }
            }
            prop_assert_eq!(decoded.last(), Some(&PktLine::Flush));
        }

        /// Property: arbitrary input never panics the decoder
        #[test]
        fn prop_decode_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode(Bytes::from(data));
        }
    }
}
