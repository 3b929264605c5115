use crate::git::{
    commits::Commit,
    error::ObjectParseError,
    git_blob::Blob,
    git_object_trait::GitObjectType,
    git_tree::Tree,
};
use bytes::Bytes;
use std::{fmt, str::FromStr};
use strum::EnumTryAs;

/// Binary SHA-1 object id. Displays as the 40-char lowercase hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha(pub [u8; 20]);

impl Sha {
    pub const LEN: usize = 20;

    pub fn from_hex(hex_str: &str) -> Result<Self, ObjectParseError> {
        let raw = hex::decode(hex_str)
            .map_err(|_| ObjectParseError::InvalidHash(hex_str.to_owned()))?;
        Self::from_slice(&raw).ok_or_else(|| ObjectParseError::InvalidHash(hex_str.to_owned()))
    }

    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(raw).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Sha {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for Sha {
    fn from(raw: [u8; 20]) -> Self {
        Self(raw)
    }
}

impl FromStr for Sha {
    type Err = ObjectParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha({})", self.to_hex())
    }
}

/// Annotated tag, kept as its raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub hash: Sha,
    pub body: Bytes,
}

/// A typed, hashed object as it comes out of a packfile.
#[derive(EnumTryAs, Debug, Clone)]
pub enum AnyGitObject {
    Commit(Commit),
    Tree(Tree),
    Blob(Blob),
    Tag(Tag),
}

impl AnyGitObject {
    /// Parses `body`, already hashed to `hash`, into its typed form. Blob
    /// content is kept only when `keep_content` is set.
    pub fn decode(
        kind: GitObjectType,
        hash: Sha,
        body: &Bytes,
        keep_content: bool,
    ) -> Result<Self, ObjectParseError> {
        Ok(match kind {
            GitObjectType::Commit => Self::Commit(Commit::decode_body(hash, body)?),
            GitObjectType::Tree => Self::Tree(Tree::decode_body(hash, body)?),
            GitObjectType::Blob => Self::Blob(Blob::decode_body(
                hash,
                body,
                keep_content,
            )),
            GitObjectType::Tag => Self::Tag(Tag {
                hash,
                body: body.clone(),
            }),
        })
    }

    pub fn hash(&self) -> Sha {
        match self {
            Self::Commit(commit) => commit.hash,
            Self::Tree(tree) => tree.hash,
            Self::Blob(blob) => blob.hash,
            Self::Tag(tag) => tag.hash,
        }
    }

    pub fn kind(&self) -> GitObjectType {
        match self {
            Self::Commit(_) => GitObjectType::Commit,
            Self::Tree(_) => GitObjectType::Tree,
            Self::Blob(_) => GitObjectType::Blob,
            Self::Tag(_) => GitObjectType::Tag,
        }
    }
}
