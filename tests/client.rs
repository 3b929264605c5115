use bytes::Bytes;
use git_tree_fetch::{
    hash_object, walk_commit, ClientOptions, FileMode, GitClient, GitError, GitObject,
    GitObjectType, PackBuilder, PackLimits, PackfileError, ProtocolError, Sha, Transport, Tree,
    TreeEntry, WalkEntry,
};
use url::Url;
use std::{collections::VecDeque, sync::Mutex};

/// Answers requests from a queue and records what was sent.
#[derive(Default)]
struct MockTransport {
    responses: Mutex<VecDeque<Bytes>>,
    requests: Mutex<Vec<(String, Bytes)>>,
}

impl MockTransport {
    fn new(responses: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Bytes::from).collect()),
            requests: Mutex::default(),
        }
    }

    fn requests(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(url, body)| (url.clone(), String::from_utf8_lossy(body).into_owned()))
            .collect()
    }
}

impl Transport for &MockTransport {
    async fn upload_pack(&self, url: &Url, body: Bytes) -> anyhow::Result<Bytes> {
        self.requests.lock().unwrap().push((url.to_string(), body));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no response queued"))
    }
}

fn pkt(payload: &[u8]) -> Vec<u8> {
    let mut line = format!("{:04x}", payload.len() + 4).into_bytes();
    line.extend_from_slice(payload);
    line
}

fn ls_refs_response(head: Sha) -> Vec<u8> {
    let mut response = pkt(format!("{head} HEAD symref-target:refs/heads/main\n").as_bytes());
    response.extend(pkt(format!("{head} refs/heads/main\n").as_bytes()));
    response.extend(b"0000");
    response
}

fn fetch_response(pack: &[u8]) -> Vec<u8> {
    let mut response = pkt(b"shallow-info\n");
    response.extend(pkt(b"shallow 0000000000000000000000000000000000000000\n"));
    response.extend(b"0001");
    response.extend(pkt(b"packfile\n"));
    response.extend(pkt(b"\x02Enumerating objects: 3, done.\n"));
    for chunk in pack.chunks(1000) {
        let mut band = vec![1u8];
        band.extend_from_slice(chunk);
        response.extend(pkt(&band));
    }
    response.extend(b"0000");
    response
}

struct Repo {
    commit: Sha,
    src: Tree,
    readme: Vec<u8>,
    pack: Vec<u8>,
}

/// `README.md` and `src/main.rs`, blob content only for `README.md`.
fn repo() -> Repo {
    let readme = b"# demo\n".to_vec();
    let main_rs = b"fn main() {}\n";
    let src = Tree::from_entries(vec![TreeEntry::new(
        FileMode::Regular,
        "main.rs",
        hash_object(GitObjectType::Blob, main_rs),
    )]);
    let root = Tree::from_entries(vec![
        TreeEntry::new(
            FileMode::Regular,
            "README.md",
            hash_object(GitObjectType::Blob, &readme),
        ),
        TreeEntry::new(FileMode::Directory, "src", src.hash),
    ]);
    let commit_body = format!(
        "tree {}\nauthor Dev <dev@example.com> 1700000000 +0000\n\
         committer Dev <dev@example.com> 1700000000 +0000\n\ninitial\n",
        root.hash
    );

    let mut builder = PackBuilder::new();
    builder.add(GitObjectType::Commit, commit_body.clone().into_bytes());
    builder.add(GitObjectType::Tree, root.encode_body());
    builder.add(GitObjectType::Tree, src.encode_body());
    builder.add(GitObjectType::Blob, readme.clone());

    Repo {
        commit: hash_object(GitObjectType::Commit, commit_body.as_bytes()),
        src,
        readme,
        pack: builder.build().unwrap(),
    }
}

fn client(transport: &MockTransport) -> GitClient<&MockTransport> {
    GitClient::with_transport(
        "https://git.example.com/owner/demo",
        transport,
        ClientOptions::default(),
    )
    .unwrap()
}

fn git_error(err: &anyhow::Error) -> Option<&GitError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GitError>())
}

#[tokio::test]
async fn list_files_resolves_branch_then_fetches_tree() {
    let repo = repo();
    let response = fetch_response(&repo.pack);
    let response_len = response.len();
    let transport = MockTransport::new([ls_refs_response(repo.commit), response]);

    let listing = client(&transport).list_files("main").await.unwrap();

    assert_eq!(listing.paths, vec!["README.md", "src/", "src/main.rs"]);
    assert_eq!(listing.hashes[1], repo.src.hash.to_hex());
    assert_eq!(listing.source, "https://git.example.com/owner/demo.git/");
    assert_eq!(listing.bytes_read, response_len);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    for (url, _) in &requests {
        assert_eq!(url, "https://git.example.com/owner/demo.git/git-upload-pack");
    }
    assert!(requests[0].1.contains("command=ls-refs\n"));
    let fetch = &requests[1].1;
    assert!(fetch.contains("command=fetch\n"));
    assert!(fetch.contains("filter blob:none\n"));
    assert!(fetch.contains("deepen 1\n"));
    assert!(fetch.contains(&format!("want {}\n", repo.commit)));
    assert!(fetch.ends_with("done\n0000"));
}

#[tokio::test]
async fn fetch_tree_by_object_id_skips_ref_listing() {
    let repo = repo();
    let transport = MockTransport::new([fetch_response(&repo.pack)]);

    let packfile = client(&transport)
        .fetch_tree(&repo.commit.to_hex())
        .await
        .unwrap();

    assert_eq!(transport.requests().len(), 1);
    assert_eq!(packfile.commits.len(), 1);
    assert_eq!(packfile.trees.len(), 2);

    let paths = walk_commit(&packfile, repo.commit)
        .unwrap()
        .map(|entry| entry.unwrap().path().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(paths, vec!["README.md", "src"]);
}

#[tokio::test]
async fn walk_reaches_nested_blobs() {
    let repo = repo();
    let transport = MockTransport::new([fetch_response(&repo.pack)]);
    let packfile = client(&transport)
        .fetch_tree(&repo.commit.to_hex())
        .await
        .unwrap();

    let mut files = vec![];
    let mut pending = vec![walk_commit(&packfile, repo.commit).unwrap()];
    while let Some(walk) = pending.pop() {
        for entry in walk {
            match entry.unwrap() {
                WalkEntry::Tree { entries, .. } => pending.push(entries),
                WalkEntry::Blob { path, blob, .. } => files.push((path, blob.is_some())),
                WalkEntry::Submodule { .. } => unreachable!(),
            }
        }
    }
    files.sort();
    assert_eq!(
        files,
        vec![
            ("README.md".to_owned(), true),
            ("src/main.rs".to_owned(), false)
        ]
    );
}

#[tokio::test]
async fn fetch_blobs_returns_content() {
    let repo = repo();
    let readme_sha = hash_object(GitObjectType::Blob, &repo.readme);
    let transport = MockTransport::new([fetch_response(&repo.pack)]);

    let blobs = client(&transport)
        .fetch_blobs("main", &[readme_sha])
        .await
        .unwrap();

    assert_eq!(blobs.len(), 1);
    assert_eq!(&blobs[&readme_sha][..], &repo.readme[..]);
    let requests = transport.requests();
    let request = &requests[0].1;
    assert!(request.contains("shallow main\n"));
    assert!(request.contains(&format!("want {readme_sha}\n")));
}

#[tokio::test]
async fn fetch_blobs_without_wants_sends_nothing() {
    let transport = MockTransport::default();
    let blobs = client(&transport).fetch_blobs("main", &[]).await.unwrap();
    assert!(blobs.is_empty());
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn unknown_ref_is_an_error() {
    let repo = repo();
    let transport = MockTransport::new([ls_refs_response(repo.commit)]);
    let err = client(&transport).list_files("develop").await.unwrap_err();
    assert!(format!("{err:#}").contains("no ref named \"develop\""));
}

#[tokio::test]
async fn remote_error_line_surfaces() {
    let mut response = pkt(b"ERR upload-pack: not our ref\n");
    response.extend(b"0000");
    let transport = MockTransport::new([response]);

    let err = client(&transport)
        .fetch_tree(&"ab".repeat(20))
        .await
        .unwrap_err();
    assert_eq!(
        git_error(&err),
        Some(&GitError::Protocol(ProtocolError::RemoteError(
            "upload-pack: not our ref".to_owned()
        )))
    );
}

#[tokio::test]
async fn response_without_packfile_section() {
    let mut response = pkt(b"acknowledgments\n");
    response.extend(pkt(b"NAK\n"));
    response.extend(b"0000");
    let transport = MockTransport::new([response]);

    let err = client(&transport)
        .fetch_tree(&"ab".repeat(20))
        .await
        .unwrap_err();
    assert_eq!(
        git_error(&err),
        Some(&GitError::Protocol(ProtocolError::MissingPackfile))
    );
}

#[tokio::test]
async fn client_limits_reach_the_decoder() {
    let repo = repo();
    let transport = MockTransport::new([fetch_response(&repo.pack)]);
    let options = ClientOptions::default().with_limits(PackLimits {
        max_object_count: 2,
        ..PackLimits::default()
    });
    let client = GitClient::with_transport("git.example.com/owner/demo.git", &transport, options)
        .unwrap();

    let err = client.fetch_tree(&repo.commit.to_hex()).await.unwrap_err();
    assert_eq!(
        git_error(&err),
        Some(&GitError::Packfile(PackfileError::TooManyObjects {
            count: 4,
            max: 2
        }))
    );
}

#[tokio::test]
async fn empty_repository_lists_nothing() {
    let transport = MockTransport::new([fetch_response(&[])]);
    let listing = client(&transport)
        .list_files(&"cd".repeat(20))
        .await
        .unwrap();
    assert!(listing.is_empty());
}
