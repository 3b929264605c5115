use crate::git::any_git_object::Sha;
use bytes::Bytes;

/// A file's content object. Only hash and length are kept unless the
/// decoding session asked for content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub hash: Sha,
    pub size: usize,
    pub content: Option<Bytes>,
}

impl Blob {
    pub fn decode_body(hash: Sha, raw_content: &Bytes, keep_content: bool) -> Self {
        Blob {
            hash,
            size: raw_content.len(),
            content: keep_content.then(|| raw_content.clone()),
        }
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }
}
