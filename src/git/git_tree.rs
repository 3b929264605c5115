use crate::{
    git::{
        any_git_object::Sha,
        error::ObjectParseError,
        git_object_trait::{GitObject, GitObjectType},
    },
    utils::helpers::split_once_byte,
};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub hash: Sha,
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: String,
    pub hash: Sha,
}

#[derive(Debug, EnumString, AsRefStr, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    #[strum(serialize = "100644")]
    Regular,
    #[strum(serialize = "100755")]
    Executable,
    #[strum(serialize = "120000")]
    Symbolic,
    #[strum(serialize = "40000")]
    Directory,
    #[strum(serialize = "160000")]
    Submodule,
}

impl FileMode {
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl Tree {
    /// Builds a tree from entries in the given order and hashes it.
    pub fn from_entries(entries: Vec<TreeEntry>) -> Self {
        let mut tree = Self {
            hash: Sha([0; 20]),
            entries,
        };
        tree.hash = tree.sha1();
        tree
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Parses the binary `<mode> <name>\0<20 raw bytes>` sequence, keeping entry order.
    pub fn decode_body(hash: Sha, body: &[u8]) -> Result<Self, ObjectParseError> {
        let mut entries = vec![];
        let mut rest = body;
        while !rest.is_empty() {
            let offset = body.len() - rest.len();
            let (entry, tail) = TreeEntry::decode(rest)
                .ok_or(ObjectParseError::TruncatedTreeEntry(offset))??;
            entries.push(entry);
            rest = tail;
        }
        Ok(Tree { hash, entries })
    }
}

impl TreeEntry {
    pub fn new(mode: FileMode, name: impl Into<String>, hash: Sha) -> Self {
        Self {
            mode,
            name: name.into(),
            hash,
        }
    }

    /// Returns `None` when the entry is cut short, otherwise the entry and the
    /// remaining input.
    fn decode(input: &[u8]) -> Option<Result<(Self, &[u8]), ObjectParseError>> {
        let (header, tail) = split_once_byte(input, b'\0')?;
        let hash = Sha::from_slice(tail.get(..Sha::LEN)?)?;
        let tail = &tail[Sha::LEN..];

        let Some((mode, name)) = split_once_byte(header, b' ') else {
            return Some(Err(ObjectParseError::InvalidMode(
                String::from_utf8_lossy(header).into_owned(),
            )));
        };
        let mode = match std::str::from_utf8(mode).ok().and_then(|m| m.parse().ok()) {
            Some(mode) => mode,
            None => {
                return Some(Err(ObjectParseError::InvalidMode(
                    String::from_utf8_lossy(mode).into_owned(),
                )))
            }
        };

        let entry = TreeEntry {
            mode,
            name: String::from_utf8_lossy(name).into_owned(),
            hash,
        };
        Some(Ok((entry, tail)))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(self.mode.as_ref().as_bytes());
        encoded.push(b' ');
        encoded.extend_from_slice(self.name.as_bytes());
        encoded.push(b'\0');
        encoded.extend_from_slice(self.hash.as_ref());
        encoded
    }
}

impl GitObject for Tree {
    fn get_type() -> GitObjectType {
        GitObjectType::Tree
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body_buf = vec![];
        for entry in &self.entries {
            body_buf.extend_from_slice(&entry.encode());
        }
        body_buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_object_trait::hash_object;

    fn sha(byte: u8) -> Sha {
        Sha([byte; 20])
    }

    #[test]
    fn parses_entries_in_order() {
        let entries = vec![
            TreeEntry::new(FileMode::Regular, "zeta.txt", sha(1)),
            TreeEntry::new(FileMode::Directory, "alpha", sha(2)),
            TreeEntry::new(FileMode::Executable, "run.sh", sha(3)),
        ];
        let tree = Tree::from_entries(entries.clone());
        let body = tree.encode_body();

        let parsed = Tree::decode_body(tree.hash, &body).unwrap();
        assert_eq!(parsed.entries, entries);
        assert_eq!(parsed.hash, hash_object(GitObjectType::Tree, &body));
    }

    #[test]
    fn empty_body_is_empty_tree() {
        let tree = Tree::decode_body(sha(0), b"").unwrap();
        assert!(tree.entries().is_empty());
    }

    #[test]
    fn name_may_contain_spaces() {
        let entry = TreeEntry::new(FileMode::Regular, "my file.txt", sha(9));
        let parsed = Tree::decode_body(sha(0), &entry.encode()).unwrap();
        assert_eq!(parsed.entries[0].name, "my file.txt");
    }

    #[test]
    fn truncated_hash_is_rejected() {
        let mut body = TreeEntry::new(FileMode::Regular, "a", sha(1)).encode();
        body.truncate(body.len() - 1);
        assert_eq!(
            Tree::decode_body(sha(0), &body),
            Err(ObjectParseError::TruncatedTreeEntry(0))
        );
    }

    #[test]
    fn missing_nul_is_rejected_at_entry_offset() {
        let mut body = TreeEntry::new(FileMode::Regular, "a", sha(1)).encode();
        let first_len = body.len();
        body.extend_from_slice(b"100644 dangling");
        assert_eq!(
            Tree::decode_body(sha(0), &body),
            Err(ObjectParseError::TruncatedTreeEntry(first_len))
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut body = b"100600 a\0".to_vec();
        body.extend_from_slice(&[7; 20]);
        assert_eq!(
            Tree::decode_body(sha(0), &body),
            Err(ObjectParseError::InvalidMode("100600".to_owned()))
        );
    }

    #[test]
    fn directory_mode_has_no_leading_zero() {
        assert_eq!(FileMode::Directory.as_ref(), "40000");
        assert!(FileMode::Directory.is_directory());
        assert!(!FileMode::Submodule.is_directory());
    }
}
