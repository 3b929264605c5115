use crate::{
    git::{
        any_git_object::Sha,
        error::GitError,
        git_blob::Blob,
        git_tree::{FileMode, TreeEntry},
        packfile::Packfile,
    },
    Result,
};
use std::slice;

#[derive(Debug)]
pub enum WalkEntry<'p> {
    Tree {
        path: String,
        hash: Sha,
        entries: TreeWalk<'p>,
    },
    Blob {
        path: String,
        hash: Sha,
        mode: FileMode,
        /// `None` when the blob was filtered out of the fetch.
        blob: Option<&'p Blob>,
    },
    /// A gitlink; the commit lives in another repository.
    Submodule { path: String, hash: Sha },
}

impl WalkEntry<'_> {
    pub fn path(&self) -> &str {
        match self {
            Self::Tree { path, .. } | Self::Blob { path, .. } | Self::Submodule { path, .. } => path,
        }
    }

    pub fn hash(&self) -> Sha {
        match self {
            Self::Tree { hash, .. } | Self::Blob { hash, .. } | Self::Submodule { hash, .. } => *hash,
        }
    }
}

/// Entries of one tree in their stored order. Paths are relative to the walk's
/// starting tree and use `/` without a trailing separator. Nothing below a
/// directory is visited until its nested walk is pulled.
#[derive(Debug)]
pub struct TreeWalk<'p> {
    packfile: &'p Packfile,
    prefix: String,
    entries: slice::Iter<'p, TreeEntry>,
}

impl<'p> TreeWalk<'p> {
    fn new(packfile: &'p Packfile, tree: Sha, prefix: String) -> Result<Self> {
        let tree = packfile
            .trees
            .get(&tree)
            .ok_or_else(|| GitError::ObjectNotFound(tree.to_hex()))?;
        Ok(Self {
            packfile,
            prefix,
            entries: tree.entries().iter(),
        })
    }
}

impl<'p> Iterator for TreeWalk<'p> {
    type Item = Result<WalkEntry<'p>>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        let path = format!("{}{}", self.prefix, entry.name);
        Some(match entry.mode {
            FileMode::Directory => TreeWalk::new(self.packfile, entry.hash, format!("{path}/"))
                .map(|entries| WalkEntry::Tree {
                    path,
                    hash: entry.hash,
                    entries,
                }),
            FileMode::Submodule => Ok(WalkEntry::Submodule {
                path,
                hash: entry.hash,
            }),
            mode => Ok(WalkEntry::Blob {
                path,
                hash: entry.hash,
                mode,
                blob: self.packfile.blobs.get(&entry.hash),
            }),
        })
    }
}

pub fn walk_tree(packfile: &Packfile, tree: Sha) -> Result<TreeWalk<'_>> {
    TreeWalk::new(packfile, tree, String::new())
}

/// Walks the root tree of `commit`.
pub fn walk_commit(packfile: &Packfile, commit: Sha) -> Result<TreeWalk<'_>> {
    let commit = packfile
        .commits
        .get(&commit)
        .ok_or_else(|| GitError::ObjectNotFound(commit.to_hex()))?;
    walk_tree(packfile, commit.tree_hash)
}
