use crate::{
    git::{
        any_git_object::Sha,
        error::ObjectParseError,
        git_object_trait::{GitObject, GitObjectType},
    },
    utils::helpers::{from_utf8_with_context, parse_bytes, split_once_byte},
};
use std::{fmt, str::FromStr};

/// `name <email> timestamp timezone` as found on author/committer lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// Raw offset such as `+0200`; empty when the line carries none.
    pub timezone: String,
}

impl Signature {
    pub fn parse(input: &[u8]) -> Result<Self, ObjectParseError> {
        let invalid = || ObjectParseError::InvalidSignature(String::from_utf8_lossy(input).into_owned());

        let (name, rest) = split_once_byte(input, b'<').ok_or_else(invalid)?;
        let (email, rest) = split_once_byte(rest, b'>').ok_or_else(invalid)?;
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let (timestamp, timezone) = split_once_byte(rest, b' ').unwrap_or((rest, b""));

        Ok(Signature {
            name: String::from_utf8_lossy(name).trim_end().to_owned(),
            email: String::from_utf8_lossy(email).into_owned(),
            timestamp: parse_bytes(timestamp).ok_or_else(invalid)?,
            timezone: String::from_utf8_lossy(timezone).trim().to_owned(),
        })
    }
}

impl FromStr for Signature {
    type Err = ObjectParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.timestamp)?;
        if !self.timezone.is_empty() {
            write!(f, " {}", self.timezone)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: Sha,
    pub tree_hash: Sha,
    pub parent_hashes: Vec<Sha>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl Commit {
    pub fn new(
        tree_hash: Sha,
        parent_hashes: Vec<Sha>,
        author: Signature,
        committer: Signature,
        message: impl Into<String>,
    ) -> Self {
        let mut commit = Self {
            hash: Sha([0; 20]),
            tree_hash,
            parent_hashes,
            author,
            committer,
            message: message.into(),
        };
        commit.hash = commit.sha1();
        commit
    }

    /// Parses the header block up to the first blank line; the rest is the message.
    /// Unknown headers (and their continuation lines) are skipped.
    pub fn decode_body(hash: Sha, body: &[u8]) -> Result<Self, ObjectParseError> {
        let mut tree_hash = None;
        let mut parent_hashes = vec![];
        let mut author = None;
        let mut committer = None;

        let mut rest = body;
        let message = loop {
            let (line, tail) = split_once_byte(rest, b'\n').unwrap_or((rest, b""));
            if line.is_empty() {
                break tail;
            }
            rest = tail;
            if line.starts_with(b" ") {
                continue;
            }
            let (key, value) = split_once_byte(line, b' ').unwrap_or((line, b""));
            match key {
                b"tree" => tree_hash = Some(parse_hash(value)?),
                b"parent" => parent_hashes.push(parse_hash(value)?),
                b"author" => author = Some(Signature::parse(value)?),
                b"committer" => committer = Some(Signature::parse(value)?),
                _ => {}
            }
            if rest.is_empty() {
                break rest;
            }
        };

        let missing = |field| ObjectParseError::MissingField {
            kind: "commit",
            field,
        };
        Ok(Commit {
            hash,
            tree_hash: tree_hash.ok_or_else(|| missing("tree"))?,
            parent_hashes,
            author: author.ok_or_else(|| missing("author"))?,
            committer: committer.ok_or_else(|| missing("committer"))?,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

fn parse_hash(value: &[u8]) -> Result<Sha, ObjectParseError> {
    Sha::from_hex(from_utf8_with_context(value)?)
}

impl GitObject for Commit {
    fn get_type() -> GitObjectType {
        GitObjectType::Commit
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut buf = format!("tree {}\n", self.tree_hash);
        for parent_hash in &self.parent_hashes {
            buf.push_str(&format!("parent {parent_hash}\n"));
        }
        buf.push_str(&format!("author {}\n", self.author));
        buf.push_str(&format!("committer {}\n", self.committer));
        buf.push('\n');
        buf.push_str(&self.message);
        buf.into_bytes()
    }
}
