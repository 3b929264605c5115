use crate::git::any_git_object::Sha;
use bytes::BytesMut;
use sha::{
    sha1::Sha1,
    utils::{Digest, DigestExt},
};
use strum::{AsRefStr, Display, EnumString};

/// The four content-addressed object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum GitObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

pub trait GitObject {
    fn get_type() -> GitObjectType;

    /// Serializes the object body (without the `<type> <len>\0` header).
    fn encode_body(&self) -> Vec<u8>;

    fn sha1(&self) -> Sha {
        hash_object(Self::get_type(), &self.encode_body())
    }
}

/// Git's object id: `sha1("<type> <decimal len>\0" + content)`.
pub fn hash_object(kind: GitObjectType, content: &[u8]) -> Sha {
    let mut hash_input = BytesMut::from(format!("{} {}\0", kind, content.len()).as_bytes());
    hash_input.extend_from_slice(content);
    Sha::from_hex(&sha1_hex(&hash_input)).expect("Sha1 digest is always 20 bytes")
}

pub fn sha1_hex(data: &[u8]) -> String {
    Sha1::default().digest(data).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_hash_matches_git() {
        assert_eq!(
            hash_object(GitObjectType::Blob, b"hello").to_hex(),
            "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0"
        );
    }

    #[test]
    fn empty_tree_hash_matches_git() {
        assert_eq!(
            hash_object(GitObjectType::Tree, b"").to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn hash_depends_on_type() {
        assert_ne!(
            hash_object(GitObjectType::Blob, b"x"),
            hash_object(GitObjectType::Tag, b"x")
        );
    }

    #[test]
    fn type_names_are_lowercase() {
        assert_eq!(GitObjectType::Commit.to_string(), "commit");
        assert_eq!("tree".parse::<GitObjectType>().unwrap(), GitObjectType::Tree);
        assert_eq!(GitObjectType::Blob.as_ref(), "blob");
    }
}
