pub mod any_git_object;
pub mod commits;
pub mod compression;
pub mod delta;
pub mod error;
pub mod file_tree;
pub mod git_blob;
pub mod git_client;
pub mod git_object_trait;
pub mod git_tree;
pub mod packfile;
pub mod pkt_line;
pub mod tree_walk;
