use crate::git::{
    any_git_object::Sha,
    file_tree::{FileTree, TreeListing},
    packfile::{PackLimits, Packfile, PackfileDecoder},
    pkt_line::{
        extract_packfile, fetch_blobs_command, fetch_tree_command, ls_refs_command, parse_ls_refs,
        GitRef,
    },
};
use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::{collections::HashMap, future::Future, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

const UPLOAD_PACK_REQUEST_CONTENT_TYPE: &str = "application/x-git-upload-pack-request";
const UPLOAD_PACK_RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";
const GIT_PROTOCOL_HEADER: &str = "Git-Protocol";
const GIT_PROTOCOL_V2: &str = "version=2";

/// Performs one `git-upload-pack` exchange.
pub trait Transport {
    fn upload_pack(&self, url: &Url, body: Bytes) -> impl Future<Output = Result<Bytes>> + Send;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub timeout: Duration,
    /// The response body is abandoned once it grows past this.
    pub max_response_bytes: usize,
    pub limits: PackLimits,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let limits = PackLimits::default();
        Self {
            user_agent: concat!("git/2.0 (git-tree-fetch/", env!("CARGO_PKG_VERSION"), ")").to_owned(),
            timeout: Duration::from_secs(60),
            max_response_bytes: limits.max_pack_bytes,
            limits,
        }
    }
}

impl ClientOptions {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    pub fn with_limits(mut self, limits: PackLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// [`Transport`] over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_response_bytes: usize,
}

impl HttpTransport {
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&options.user_agent)
            .timeout(options.timeout)
            .build()
            .with_context(|| "HttpTransport::new: failed to build HTTP client")?;
        Ok(Self {
            client,
            max_response_bytes: options.max_response_bytes,
        })
    }
}

impl Transport for HttpTransport {
    async fn upload_pack(&self, url: &Url, body: Bytes) -> Result<Bytes> {
        let mut response = self
            .client
            .post(url.clone())
            .header(GIT_PROTOCOL_HEADER, GIT_PROTOCOL_V2)
            .header("Content-Type", UPLOAD_PACK_REQUEST_CONTENT_TYPE)
            .header("Accept", UPLOAD_PACK_RESULT_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .with_context(|| "HttpTransport::upload_pack: failed to send request")?
            .error_for_status()
            .with_context(|| "HttpTransport::upload_pack: HTTP status")?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| "HttpTransport::upload_pack: failed to read response body")?
        {
            if buf.len() + chunk.len() > self.max_response_bytes {
                bail!(
                    "HttpTransport::upload_pack: response exceeds {} bytes",
                    self.max_response_bytes
                );
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

pub struct GitClient<T = HttpTransport> {
    url: Url,
    transport: T,
    options: ClientOptions,
}

impl GitClient<HttpTransport> {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_options(url, ClientOptions::default())
    }

    pub fn with_options(url: &str, options: ClientOptions) -> Result<Self> {
        let transport = HttpTransport::new(&options)
            .with_context(|| "GitClient::with_options: failed to create transport")?;
        GitClient::with_transport(url, transport, options)
    }
}

impl<T: Transport> GitClient<T> {
    pub fn with_transport(url: &str, transport: T, options: ClientOptions) -> Result<Self> {
        let url = normalize_url(url)
            .with_context(|| format!("GitClient::with_transport: invalid repository URL {url:?}"))?;
        Ok(Self {
            url,
            transport,
            options,
        })
    }

    /// Repository base, always ending in `.git/`.
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn upload_pack(&self, body: Bytes) -> Result<Bytes> {
        let url = self
            .url
            .join("git-upload-pack")
            .with_context(|| "GitClient::upload_pack: failed to get upload pack URL")?;
        debug!(%url, bytes = body.len(), "sending upload-pack request");
        self.transport.upload_pack(&url, body).await
    }

    pub async fn ls_refs(&self) -> Result<Vec<GitRef>> {
        let body = ls_refs_command().with_context(|| "GitClient::ls_refs: failed to encode command")?;
        let response = self
            .upload_pack(body)
            .await
            .with_context(|| "GitClient::ls_refs: request failed")?;
        parse_ls_refs(response).with_context(|| "GitClient::ls_refs: failed to parse response")
    }

    /// Resolves `reference` (an object id, a full ref name, a branch or tag
    /// name, or `HEAD`) to the object id the remote advertises for it.
    pub async fn resolve(&self, reference: &str) -> Result<Sha> {
        if let Ok(sha) = reference.parse::<Sha>() {
            return Ok(sha);
        }
        let refs = self
            .ls_refs()
            .await
            .with_context(|| format!("GitClient::resolve: failed to list refs for {reference:?}"))?;
        let candidates = [
            reference.to_owned(),
            format!("refs/heads/{reference}"),
            format!("refs/tags/{reference}"),
        ];
        candidates
            .iter()
            .find_map(|name| refs.iter().find(|git_ref| &git_ref.name == name))
            .map(|git_ref| git_ref.peeled.unwrap_or(git_ref.object_id))
            .ok_or_else(|| anyhow!("GitClient::resolve: remote has no ref named {reference:?}"))
    }

    /// Fetches the commit behind `reference` with its trees but without blobs.
    pub async fn fetch_tree(&self, reference: &str) -> Result<Packfile> {
        let commit = self
            .resolve(reference)
            .await
            .with_context(|| "GitClient::fetch_tree: failed to resolve reference")?;
        let body = fetch_tree_command(&commit.to_hex())
            .with_context(|| "GitClient::fetch_tree: failed to encode command")?;
        let (packfile, _) = self
            .fetch_pack(body, PackfileDecoder::new())
            .await
            .with_context(|| format!("GitClient::fetch_tree: failed to fetch {commit}"))?;
        Ok(packfile)
    }

    /// Lists every path in the tree behind `reference`.
    pub async fn list_files(&self, reference: &str) -> Result<TreeListing> {
        let commit = self
            .resolve(reference)
            .await
            .with_context(|| "GitClient::list_files: failed to resolve reference")?;
        let body = fetch_tree_command(&commit.to_hex())
            .with_context(|| "GitClient::list_files: failed to encode command")?;
        let (packfile, bytes_read) = self
            .fetch_pack(body, PackfileDecoder::new())
            .await
            .with_context(|| format!("GitClient::list_files: failed to fetch {commit}"))?;

        let tree = FileTree::from_packfile(&packfile);
        let listing = TreeListing::new(self.url.as_str(), bytes_read, tree.flatten());
        info!(
            url = %self.url,
            %commit,
            paths = listing.len(),
            bytes_read,
            warnings = tree.warnings.len(),
            "listed repository tree"
        );
        Ok(listing)
    }

    /// Fetches the content of `wants` on top of the shallow `branch`.
    pub async fn fetch_blobs(&self, branch: &str, wants: &[Sha]) -> Result<HashMap<Sha, Bytes>> {
        if wants.is_empty() {
            return Ok(HashMap::new());
        }
        let body = fetch_blobs_command(branch, wants)
            .with_context(|| "GitClient::fetch_blobs: failed to encode command")?;
        let mut contents = HashMap::with_capacity(wants.len());
        let decoder = PackfileDecoder::new().on_blob(|sha, content| {
            contents.insert(*sha, Bytes::copy_from_slice(content));
        });
        self.fetch_pack(body, decoder)
            .await
            .with_context(|| "GitClient::fetch_blobs: failed to fetch blobs")?;

        let missing = wants.iter().filter(|sha| !contents.contains_key(sha)).count();
        if missing > 0 {
            warn!(missing, requested = wants.len(), "remote did not send every requested blob");
        }
        Ok(contents)
    }

    /// Sends a fetch command and decodes the packfile it returns. Also reports
    /// the size of the whole response body.
    async fn fetch_pack(&self, body: Bytes, decoder: PackfileDecoder<'_>) -> Result<(Packfile, usize)> {
        let response = self
            .upload_pack(body)
            .await
            .with_context(|| "GitClient::fetch_pack: request failed")?;
        let bytes_read = response.len();
        let pack = extract_packfile(response)
            .with_context(|| "GitClient::fetch_pack: failed to read fetch response")?;
        let packfile = decoder
            .with_limits(self.options.limits)
            .decode(&pack)
            .with_context(|| "GitClient::fetch_pack: failed to decode packfile")?;
        Ok((packfile, bytes_read))
    }
}

/// `host/owner/repo`, `repo.git`, `repo.git/` and `repo/` all become `repo.git/`.
fn normalize_url(url: &str) -> Result<Url> {
    let url = if url.ends_with(".git/") {
        url.to_string()
    } else if let Some(stripped) = url.strip_suffix(".git") {
        format!("{stripped}.git/")
    } else if let Some(stripped) = url.strip_suffix('/') {
        format!("{stripped}.git/")
    } else {
        format!("{url}.git/")
    };
    let url = if url.contains("://") {
        url
    } else {
        format!("https://{url}")
    };
    Url::parse(&url).map_err(|err| anyhow!(err).context("normalize_url: failed to parse URL"))
}
