use crate::git::{
    any_git_object::Sha,
    git_tree::{Tree, TreeEntry},
    packfile::Packfile,
};
use std::{collections::HashMap, fmt, vec};
use tracing::{debug, warn};

/// Nesting beyond this is cut off with [`AssemblyWarning::DepthLimit`].
pub const DEFAULT_MAX_DEPTH: usize = 4096;

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub hash: Sha,
    pub is_folder: bool,
    /// Children are in the shared table under `hash`, not in `children`.
    pub is_shared: bool,
    pub children: Option<Vec<Node>>,
}

impl Node {
    fn folder(name: impl Into<String>, hash: Sha, children: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            hash,
            is_folder: true,
            is_shared: false,
            children: Some(children),
        }
    }

    fn file(name: impl Into<String>, hash: Sha) -> Self {
        Self {
            name: name.into(),
            hash,
            is_folder: false,
            is_shared: false,
            children: None,
        }
    }

    /// A folder whose children live in the shared table, or nowhere when
    /// its tree is missing.
    fn childless_folder(name: impl Into<String>, hash: Sha, is_shared: bool) -> Self {
        Self {
            name: name.into(),
            hash,
            is_folder: true,
            is_shared,
            children: None,
        }
    }
}

/// Nesting can be thousands of levels deep; unlink it one level at a time.
impl Drop for Node {
    fn drop(&mut self) {
        let mut stack = self.children.take().unwrap_or_default();
        while let Some(mut node) = stack.pop() {
            stack.extend(node.children.take().unwrap_or_default());
        }
    }
}

/// Structural oddities that do not stop assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyWarning {
    /// The same tree was supplied more than once; the first copy is kept.
    DuplicateTreeAssignment(Sha),
    /// More than one tree is referenced by no other tree.
    MultipleRoots { kept: Sha, ignored: Sha },
    /// A directory entry points at a tree that was not decoded.
    MissingSubtree(Sha),
    /// Nesting under this tree exceeded the depth limit.
    DepthLimit(Sha),
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTreeAssignment(hash) => write!(f, "tree {hash} assigned twice"),
            Self::MultipleRoots { kept, ignored } => {
                write!(f, "multiple root trees: kept {kept}, ignored {ignored}")
            }
            Self::MissingSubtree(hash) => write!(f, "subtree {hash} missing from pack"),
            Self::DepthLimit(hash) => write!(f, "tree nesting too deep below {hash}"),
        }
    }
}

/// An assembled hierarchy. Directories whose tree is referenced from more
/// than one parent are flagged shared, and their children live once in
/// `shared`.
#[derive(Debug, Default)]
pub struct FileTree {
    /// `None` when no trees were supplied.
    pub root: Option<Node>,
    pub shared: HashMap<Sha, Vec<Node>>,
    pub warnings: Vec<AssemblyWarning>,
}

impl FileTree {
    pub fn assemble<'t>(trees: impl IntoIterator<Item = &'t Tree>) -> Self {
        TreeAssembler::new().assemble(trees)
    }

    pub fn from_packfile(packfile: &Packfile) -> Self {
        Self::assemble(packfile.trees_in_order())
    }

    /// Children of `node`, looked up in the shared table for shared nodes.
    pub fn children_of<'a>(&'a self, node: &'a Node) -> &'a [Node] {
        if node.is_shared {
            self.shared.get(&node.hash).map(Vec::as_slice).unwrap_or_default()
        } else {
            node.children.as_deref().unwrap_or_default()
        }
    }

    /// Depth-first `(path, hash)` listing. Folders carry a trailing `/`; the
    /// root itself is not listed.
    pub fn flatten(&self) -> Vec<(String, Sha)> {
        let mut listing = vec![];
        let Some(root) = &self.root else {
            return listing;
        };

        let mut stack = vec![(String::new(), self.children_of(root).iter())];
        while let Some((prefix, children)) = stack.last_mut() {
            let Some(node) = children.next() else {
                stack.pop();
                continue;
            };
            if node.is_folder {
                let path = format!("{prefix}{}/", node.name);
                listing.push((path.clone(), node.hash));
                stack.push((path, self.children_of(node).iter()));
            } else {
                listing.push((format!("{prefix}{}", node.name), node.hash));
            }
        }
        listing
    }
}

#[derive(Debug, Clone)]
pub struct TreeAssembler {
    max_depth: usize,
}

impl Default for TreeAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeAssembler {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn assemble<'t>(&self, trees: impl IntoIterator<Item = &'t Tree>) -> FileTree {
        let mut session = AssemblySession {
            trees: HashMap::new(),
            order: vec![],
            refs: HashMap::new(),
            max_depth: self.max_depth,
            shared: HashMap::new(),
            warnings: vec![],
        };

        for tree in trees {
            if session.trees.contains_key(&tree.hash) {
                session.warn(AssemblyWarning::DuplicateTreeAssignment(tree.hash));
                continue;
            }
            for entry in tree.entries.iter().filter(|entry| entry.mode.is_directory()) {
                *session.refs.entry(entry.hash).or_default() += 1;
            }
            session.order.push(tree.hash);
            session.trees.insert(tree.hash, tree);
        }

        let mut roots = session
            .order
            .iter()
            .copied()
            .filter(|hash| !session.refs.contains_key(hash))
            .collect::<Vec<_>>()
            .into_iter();
        let root = roots.next();
        let root = root.map(|kept| {
            for ignored in roots {
                session.warn(AssemblyWarning::MultipleRoots { kept, ignored });
            }
            Node::folder("", kept, session.children(kept))
        });

        debug!(
            trees = session.order.len(),
            shared = session.shared.len(),
            warnings = session.warnings.len(),
            "assembled file tree"
        );
        FileTree {
            root,
            shared: session.shared,
            warnings: session.warnings,
        }
    }
}

struct AssemblySession<'t> {
    trees: HashMap<Sha, &'t Tree>,
    order: Vec<Sha>,
    /// How many directory entries point at each tree hash.
    refs: HashMap<Sha, usize>,
    max_depth: usize,
    shared: HashMap<Sha, Vec<Node>>,
    warnings: Vec<AssemblyWarning>,
}

impl<'t> AssemblySession<'t> {
    fn warn(&mut self, warning: AssemblyWarning) {
        warn!(%warning, "tree assembly");
        self.warnings.push(warning);
    }

    /// Opens tree `hash` for expansion at `depth`. Past the depth limit, or
    /// when the tree is absent, the frame has nothing to expand.
    fn open(&mut self, hash: Sha, depth: usize, finish: Finish) -> Frame<'t> {
        let mut entries = vec![];
        if depth >= self.max_depth {
            self.warn(AssemblyWarning::DepthLimit(hash));
        } else if let Some(tree) = self.trees.get(&hash).copied() {
            entries = tree.entries.iter().collect();
            entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        }
        Frame {
            entries: entries.into_iter(),
            children: vec![],
            depth,
            finish,
        }
    }

    /// Builds the sorted children of tree `hash` with an explicit stack of
    /// open directories.
    fn children(&mut self, hash: Sha) -> Vec<Node> {
        let mut stack = vec![self.open(hash, 0, Finish::Root)];
        loop {
            let Some(frame) = stack.last_mut() else {
                return vec![];
            };
            let depth = frame.depth;
            let Some(entry) = frame.entries.next() else {
                let Some(done) = stack.pop() else {
                    return vec![];
                };
                let children = done.children;
                let parent = match stack.last_mut() {
                    Some(parent) => &mut parent.children,
                    None => return children,
                };
                match done.finish {
                    Finish::Root => {}
                    Finish::Folder { name, hash } => parent.push(Node::folder(name, hash, children)),
                    Finish::Shared(hash) => {
                        self.shared.insert(hash, children);
                    }
                }
                continue;
            };

            if !entry.mode.is_directory() {
                frame.children.push(Node::file(&entry.name, entry.hash));
                continue;
            }
            if !self.trees.contains_key(&entry.hash) {
                frame
                    .children
                    .push(Node::childless_folder(&entry.name, entry.hash, false));
                self.warn(AssemblyWarning::MissingSubtree(entry.hash));
                continue;
            }

            if self.refs.get(&entry.hash).copied().unwrap_or_default() > 1 {
                frame
                    .children
                    .push(Node::childless_folder(&entry.name, entry.hash, true));
                if !self.shared.contains_key(&entry.hash) {
                    // placeholder first so a self-referencing chain terminates
                    self.shared.insert(entry.hash, vec![]);
                    let next = self.open(entry.hash, depth + 1, Finish::Shared(entry.hash));
                    stack.push(next);
                }
            } else {
                let finish = Finish::Folder {
                    name: entry.name.clone(),
                    hash: entry.hash,
                };
                let next = self.open(entry.hash, depth + 1, finish);
                stack.push(next);
            }
        }
    }
}

/// Where a directory's children go once all of its entries are built.
enum Finish {
    Root,
    Folder { name: String, hash: Sha },
    Shared(Sha),
}

/// A directory being expanded.
struct Frame<'t> {
    entries: vec::IntoIter<&'t TreeEntry>,
    children: Vec<Node>,
    depth: usize,
    finish: Finish,
}

/// The flattened listing as two parallel columns, tagged with where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeListing {
    pub source: String,
    pub bytes_read: usize,
    pub paths: Vec<String>,
    pub hashes: Vec<String>,
}

impl TreeListing {
    pub fn new(source: impl Into<String>, bytes_read: usize, listing: Vec<(String, Sha)>) -> Self {
        let (paths, hashes) = listing
            .into_iter()
            .map(|(path, hash)| (path, hash.to_hex()))
            .unzip();
        Self {
            source: source.into(),
            bytes_read,
            paths,
            hashes,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.paths
            .iter()
            .map(String::as_str)
            .zip(self.hashes.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{
        git_object_trait::{hash_object, GitObject, GitObjectType},
        git_tree::{FileMode, TreeEntry},
        packfile::{decode_packfile, PackBuilder},
    };

    fn blob(content: &str) -> Sha {
        hash_object(GitObjectType::Blob, content.as_bytes())
    }

    fn file(name: &str) -> TreeEntry {
        TreeEntry::new(FileMode::Regular, name, blob(name))
    }

    fn dir(name: &str, tree: &Tree) -> TreeEntry {
        TreeEntry::new(FileMode::Directory, name, tree.hash)
    }

    fn paths(tree: &FileTree) -> Vec<String> {
        tree.flatten().into_iter().map(|(path, _)| path).collect()
    }

    #[test]
    fn end_to_end_three_object_pack() {
        let file_blob = b"file contents\n";
        let subdir = Tree::from_entries(vec![TreeEntry::new(
            FileMode::Regular,
            "file.txt",
            hash_object(GitObjectType::Blob, file_blob),
        )]);
        let root = Tree::from_entries(vec![dir("subdir", &subdir)]);

        let mut builder = PackBuilder::new();
        builder.add(GitObjectType::Tree, root.encode_body());
        builder.add(GitObjectType::Tree, subdir.encode_body());
        builder.add(GitObjectType::Blob, file_blob.to_vec());
        let packfile = decode_packfile(&builder.build().unwrap()).unwrap();

        let tree = FileTree::from_packfile(&packfile);
        let root_node = tree.root.as_ref().unwrap();
        assert_eq!(root_node.hash, root.hash);
        let children = tree.children_of(root_node);
        assert_eq!(children.len(), 1);
        assert!(children[0].is_folder);
        assert_eq!(tree.children_of(&children[0]).len(), 1);
        assert!(tree.warnings.is_empty());

        assert_eq!(
            tree.flatten(),
            vec![
                ("subdir/".to_string(), subdir.hash),
                (
                    "subdir/file.txt".to_string(),
                    hash_object(GitObjectType::Blob, file_blob)
                ),
            ]
        );
    }

    #[test]
    fn identical_sibling_directories_share_children() {
        let common = Tree::from_entries(vec![file("x.txt"), file("y.txt")]);
        let root = Tree::from_entries(vec![dir("a", &common), dir("b", &common)]);

        let tree = FileTree::assemble([&root, &common]);
        let root_node = tree.root.as_ref().unwrap();
        let [a, b] = root_node.children.as_deref().unwrap() else {
            panic!("expected two children");
        };
        assert!(a.is_shared && b.is_shared);
        assert!(a.children.is_none() && b.children.is_none());
        assert_eq!(tree.shared.len(), 1);
        assert_eq!(tree.shared[&common.hash].len(), 2);
        assert!(std::ptr::eq(tree.children_of(a), tree.children_of(b)));

        assert_eq!(
            paths(&tree),
            vec!["a/", "a/x.txt", "a/y.txt", "b/", "b/x.txt", "b/y.txt"]
        );
    }

    #[test]
    fn shared_subtree_inside_shared_subtree() {
        let leaf = Tree::from_entries(vec![file("leaf.txt")]);
        let mid = Tree::from_entries(vec![dir("l1", &leaf), dir("l2", &leaf)]);
        let root = Tree::from_entries(vec![dir("m1", &mid), dir("m2", &mid)]);

        let tree = FileTree::assemble([&root, &mid, &leaf]);
        assert_eq!(tree.shared.len(), 2);
        assert_eq!(tree.flatten().len(), 2 * (1 + 2 * 2));
    }

    #[test]
    fn children_are_sorted_by_name_bytes() {
        let root = Tree::from_entries(vec![file("b"), file("B"), file("a.txt"), file("a")]);
        let tree = FileTree::assemble([&root]);
        assert_eq!(paths(&tree), vec!["B", "a", "a.txt", "b"]);
    }

    #[test]
    fn multiple_roots_keep_the_first() {
        let first = Tree::from_entries(vec![file("one")]);
        let second = Tree::from_entries(vec![file("two")]);
        let tree = FileTree::assemble([&first, &second]);

        assert_eq!(tree.root.as_ref().unwrap().hash, first.hash);
        assert_eq!(
            tree.warnings,
            vec![AssemblyWarning::MultipleRoots {
                kept: first.hash,
                ignored: second.hash
            }]
        );
        assert_eq!(paths(&tree), vec!["one"]);
    }

    #[test]
    fn duplicate_tree_is_reported() {
        let root = Tree::from_entries(vec![file("one")]);
        let tree = FileTree::assemble([&root, &root]);
        assert_eq!(
            tree.warnings,
            vec![AssemblyWarning::DuplicateTreeAssignment(root.hash)]
        );
        assert_eq!(paths(&tree), vec!["one"]);
    }

    #[test]
    fn missing_subtree_is_listed_without_children() {
        let absent = Tree::from_entries(vec![file("gone")]);
        let root = Tree::from_entries(vec![dir("lost", &absent), file("kept")]);
        let tree = FileTree::assemble([&root]);

        assert_eq!(
            tree.warnings,
            vec![AssemblyWarning::MissingSubtree(absent.hash)]
        );
        assert_eq!(paths(&tree), vec!["kept", "lost/"]);
    }

    #[test]
    fn depth_limit_cuts_deep_nesting() {
        let mut trees = vec![Tree::from_entries(vec![file("bottom")])];
        for level in 0..5 {
            let entry = dir(&format!("d{level}"), trees.last().unwrap());
            trees.push(Tree::from_entries(vec![entry]));
        }
        let tree = TreeAssembler::new()
            .with_max_depth(3)
            .assemble(trees.iter().rev());

        assert_eq!(tree.warnings.len(), 1);
        assert!(matches!(tree.warnings[0], AssemblyWarning::DepthLimit(_)));
        assert_eq!(paths(&tree), vec!["d4/", "d4/d3/", "d4/d3/d2/"]);
    }

    #[test]
    fn default_depth_limit_holds_on_a_small_stack() {
        let mut trees = vec![Tree::from_entries(vec![file("bottom")])];
        for _ in 0..DEFAULT_MAX_DEPTH + 4 {
            let entry = dir("d", trees.last().unwrap());
            trees.push(Tree::from_entries(vec![entry]));
        }
        let assembled = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let tree = FileTree::assemble(trees.iter().rev());
                (tree.warnings.clone(), tree.flatten().len())
            })
            .unwrap();

        let (warnings, listed) = assembled.join().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], AssemblyWarning::DepthLimit(_)));
        assert_eq!(listed, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn no_trees_gives_empty_listing() {
        let tree = FileTree::assemble(std::iter::empty());
        assert!(tree.root.is_none());
        assert!(tree.flatten().is_empty());
    }

    #[test]
    fn listing_columns() {
        let listing = TreeListing::new(
            "https://example.com/o/r.git/",
            42,
            vec![("a".to_string(), blob("a")), ("b/".to_string(), Sha([0; 20]))],
        );
        assert_eq!(listing.len(), 2);
        assert_eq!(listing.bytes_read, 42);
        assert_eq!(listing.paths, vec!["a", "b/"]);
        assert_eq!(listing.hashes[1], "0".repeat(40));
        assert_eq!(listing.iter().next(), Some(("a", blob("a").to_hex().as_str())));
    }
}
