//! A minimal Git smart HTTP (protocol v2) client.
//!
//! [`GitClient`] lists refs and fetches shallow, blob-less packs; the pieces
//! underneath (pkt-line framing, packfile and delta decoding, object parsing,
//! tree assembly) are usable on their own against in-memory buffers.

pub mod git;
pub mod utils;

pub use git::{
    any_git_object::{AnyGitObject, Sha, Tag},
    commits::{Commit, Signature},
    delta::{apply_delta, encode_delta, DeltaInstruction},
    error::{DeltaError, GitError, ObjectParseError, PackfileError, PktLineError, ProtocolError},
    file_tree::{AssemblyWarning, FileTree, Node, TreeAssembler, TreeListing},
    git_blob::Blob,
    git_client::{ClientOptions, GitClient, HttpTransport, Transport},
    git_object_trait::{hash_object, GitObject, GitObjectType},
    git_tree::{FileMode, Tree, TreeEntry},
    packfile::{decode_packfile, PackBuilder, PackLimits, Packfile, PackfileDecoder},
    pkt_line::{GitRef, PktLine},
    tree_walk::{walk_commit, walk_tree, TreeWalk, WalkEntry},
};

pub type Result<T> = std::result::Result<T, GitError>;
