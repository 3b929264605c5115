//! Git packfile decoding.
//!
//! A pack is `"PACK"`, a version, an object count, the object records and a
//! SHA-1 trailer over everything before it. Records are zlib-compressed and
//! may be deltas against an earlier record (by offset) or any object (by id).
//! See: https://git-scm.com/docs/pack-format

use crate::{
    git::{
        any_git_object::{AnyGitObject, Sha, Tag},
        commits::Commit,
        compression::{compress, decompress_slice},
        delta::{apply_delta, delta_sizes},
        error::{DeltaError, PackfileError},
        git_blob::Blob,
        git_object_trait::{hash_object, sha1_hex, GitObjectType},
        git_tree::Tree,
    },
    Result,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const PACK_HEADER_LEN: usize = 12;
const PACK_TRAILER_LEN: usize = 20;

const VARINT_ENCODING_BITS: u32 = 7;
const VARINT_CONTINUE_FLAG: u8 = 1 << VARINT_ENCODING_BITS;
const VARINT_OBJ_TYPE_FLAG: u8 = 0b0111_0000;
const VARINT_FIRST_BYTE_ENCODING_BITS: u32 = 4;

/// Resource ceilings applied before any work proportional to the claimed sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    pub max_object_count: u32,
    pub max_object_size: u64,
    pub max_pack_bytes: usize,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_object_count: 1_000_000,
            max_object_size: 4 * 1024 * 1024 * 1024,
            max_pack_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Record type tag from the pack's type/size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
    OffsetDelta,
    RefDelta,
}

impl TryFrom<u8> for PackObjectType {
    type Error = PackfileError;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::Commit,
            2 => Self::Tree,
            3 => Self::Blob,
            4 => Self::Tag,
            6 => Self::OffsetDelta,
            7 => Self::RefDelta,
            other => return Err(PackfileError::UnsupportedObjectType(other)),
        })
    }
}

impl PackObjectType {
    fn tag(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OffsetDelta => 6,
            Self::RefDelta => 7,
        }
    }
}

impl From<GitObjectType> for PackObjectType {
    fn from(kind: GitObjectType) -> Self {
        match kind {
            GitObjectType::Commit => Self::Commit,
            GitObjectType::Tree => Self::Tree,
            GitObjectType::Blob => Self::Blob,
            GitObjectType::Tag => Self::Tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u32,
    pub object_count: u32,
}

/// The typed result of one decode session.
#[derive(Debug, Default, Clone)]
pub struct Packfile {
    pub version: u32,
    pub commits: HashMap<Sha, Commit>,
    pub trees: HashMap<Sha, Tree>,
    pub blobs: HashMap<Sha, Blob>,
    pub tags: HashMap<Sha, Tag>,
    /// Bytes consumed from the stream, trailer included.
    pub bytes_read: usize,
    tree_order: Vec<Sha>,
}

impl Packfile {
    /// Trees in the order they were decoded.
    pub fn trees_in_order(&self) -> impl Iterator<Item = &Tree> {
        self.tree_order.iter().filter_map(|sha| self.trees.get(sha))
    }

    pub fn object_count(&self) -> usize {
        self.commits.len() + self.trees.len() + self.blobs.len() + self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_count() == 0
    }

    fn insert(&mut self, object: AnyGitObject) {
        match object {
            AnyGitObject::Commit(commit) => {
                self.commits.insert(commit.hash, commit);
            }
            AnyGitObject::Tree(tree) => {
                self.tree_order.push(tree.hash);
                self.trees.insert(tree.hash, tree);
            }
            AnyGitObject::Blob(blob) => {
                self.blobs.insert(blob.hash, blob);
            }
            AnyGitObject::Tag(tag) => {
                self.tags.insert(tag.hash, tag);
            }
        }
    }
}

/// Reads the 12-byte pack header. `Ok(None)` means the stream is empty,
/// which is how an empty repository answers.
pub fn read_header(data: &[u8], limits: &PackLimits) -> std::result::Result<Option<PackHeader>, PackfileError> {
    if data.is_empty() {
        return Ok(None);
    }
    let magic = data.get(..4).ok_or(PackfileError::Truncated("pack header"))?;
    if magic != PACK_SIGNATURE {
        return Err(PackfileError::InvalidPackHeader);
    }
    let header = data
        .get(4..PACK_HEADER_LEN)
        .ok_or(PackfileError::Truncated("pack header"))?;
    let version = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if version != 2 && version != 3 {
        return Err(PackfileError::UnsupportedVersion(version));
    }
    let object_count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if object_count > limits.max_object_count {
        return Err(PackfileError::TooManyObjects {
            count: object_count,
            max: limits.max_object_count,
        });
    }
    Ok(Some(PackHeader {
        version,
        object_count,
    }))
}

type BlobCallback<'a> = Box<dyn FnMut(&Sha, &[u8]) + Send + 'a>;

/// Decodes packfiles into typed object tables.
pub struct PackfileDecoder<'a> {
    limits: PackLimits,
    on_blob: Option<BlobCallback<'a>>,
}

impl Default for PackfileDecoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> PackfileDecoder<'a> {
    pub fn new() -> Self {
        Self {
            limits: PackLimits::default(),
            on_blob: None,
        }
    }

    pub fn with_limits(mut self, limits: PackLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Receives the content of every blob decoded; blobs also keep their
    /// content in the resulting table while a callback is installed.
    pub fn on_blob(mut self, callback: impl FnMut(&Sha, &[u8]) + Send + 'a) -> Self {
        self.on_blob = Some(Box::new(callback));
        self
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Packfile> {
        if data.len() > self.limits.max_pack_bytes {
            return Err(PackfileError::PackTooLarge {
                size: data.len(),
                max: self.limits.max_pack_bytes,
            }
            .into());
        }
        let Some(header) = read_header(data, &self.limits)? else {
            debug!("empty pack stream, treating as empty repository");
            return Ok(Packfile::default());
        };
        debug!(
            version = header.version,
            objects = header.object_count,
            bytes = data.len(),
            "decoding packfile"
        );

        let body_len = data
            .len()
            .checked_sub(PACK_TRAILER_LEN)
            .filter(|len| *len >= PACK_HEADER_LEN)
            .ok_or(PackfileError::Truncated("pack trailer"))?;
        let (body, trailer) = data.split_at(body_len);
        let actual = sha1_hex(body);
        let expected = hex::encode(trailer);
        if actual != expected {
            return Err(PackfileError::ChecksumMismatch { expected, actual }.into());
        }

        let mut session = DecodeSession {
            body,
            pos: PACK_HEADER_LEN,
            limits: self.limits,
            on_blob: self.on_blob.as_mut(),
            raw: HashMap::new(),
            by_offset: HashMap::new(),
            pending: HashMap::new(),
            pending_offsets: HashSet::new(),
            packfile: Packfile {
                version: header.version,
                ..Packfile::default()
            },
        };

        for _ in 0..header.object_count {
            session.read_record()?;
        }
        session.resolve_pending()?;

        if session.pos != body.len() {
            return Err(PackfileError::TrailingBytes(body.len() - session.pos).into());
        }

        let mut packfile = session.packfile;
        packfile.bytes_read = data.len();
        debug!(
            commits = packfile.commits.len(),
            trees = packfile.trees.len(),
            blobs = packfile.blobs.len(),
            tags = packfile.tags.len(),
            "decoded packfile"
        );
        Ok(packfile)
    }
}

/// Decodes with default limits and no blob callback.
pub fn decode_packfile(data: &[u8]) -> Result<Packfile> {
    PackfileDecoder::new().decode(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeltaBase {
    Hash(Sha),
    Offset(usize),
}

impl DeltaBase {
    fn describe(self) -> String {
        match self {
            Self::Hash(sha) => sha.to_hex(),
            Self::Offset(position) => format!("record at offset {position}"),
        }
    }
}

/// A delta whose base had not been decoded when the record was read.
#[derive(Debug)]
struct PendingDelta {
    position: usize,
    delta: Vec<u8>,
}

/// Decoded object bytes kept for the session so later deltas can use them as a base.
struct RawObject {
    kind: GitObjectType,
    data: Bytes,
}

/// Per-decode arena: the object tables and the position index live only as
/// long as one `decode` call.
struct DecodeSession<'s, 'a> {
    body: &'s [u8],
    pos: usize,
    limits: PackLimits,
    on_blob: Option<&'s mut BlobCallback<'a>>,
    raw: HashMap<Sha, RawObject>,
    by_offset: HashMap<usize, Sha>,
    /// Deferred deltas keyed by the base they wait for.
    pending: HashMap<DeltaBase, Vec<PendingDelta>>,
    pending_offsets: HashSet<usize>,
    packfile: Packfile,
}

impl DecodeSession<'_, '_> {
    fn next_byte(&mut self, what: &'static str) -> std::result::Result<u8, PackfileError> {
        let byte = *self.body.get(self.pos).ok_or(PackfileError::Truncated(what))?;
        self.pos += 1;
        Ok(byte)
    }

    /// First byte: continuation bit, 3-bit type, low 4 size bits. Each
    /// continuation byte adds the next 7 size bits.
    fn read_type_and_size(&mut self) -> std::result::Result<(PackObjectType, u64), PackfileError> {
        let first = self.next_byte("object header")?;
        let obj_type = PackObjectType::try_from((first & VARINT_OBJ_TYPE_FLAG) >> VARINT_FIRST_BYTE_ENCODING_BITS)?;
        let mut size = u64::from(first & 0x0f);
        let mut shift = VARINT_FIRST_BYTE_ENCODING_BITS;
        let mut byte = first;
        while byte & VARINT_CONTINUE_FLAG != 0 {
            byte = self.next_byte("object size")?;
            if shift >= u64::BITS {
                return Err(PackfileError::VarintOverflow("object size"));
            }
            size |= u64::from(byte & !VARINT_CONTINUE_FLAG) << shift;
            shift += VARINT_ENCODING_BITS;
        }
        Ok((obj_type, size))
    }

    /// Offset encoding for ofs-delta: big-endian base-128 where every
    /// continuation adds one before shifting.
    fn read_base_offset(&mut self) -> std::result::Result<usize, PackfileError> {
        let mut byte = self.next_byte("delta offset")?;
        let mut offset = usize::from(byte & !VARINT_CONTINUE_FLAG);
        while byte & VARINT_CONTINUE_FLAG != 0 {
            byte = self.next_byte("delta offset")?;
            offset = offset
                .checked_add(1)
                .and_then(|o| o.checked_mul(1 << VARINT_ENCODING_BITS))
                .ok_or(PackfileError::VarintOverflow("delta offset"))?
                | usize::from(byte & !VARINT_CONTINUE_FLAG);
        }
        Ok(offset)
    }

    fn inflate(&mut self, size: u64) -> std::result::Result<Vec<u8>, PackfileError> {
        let (data, consumed) = decompress_slice(&self.body[self.pos..], size)?;
        self.pos += consumed;
        Ok(data)
    }

    fn check_size(&self, size: u64) -> std::result::Result<(), PackfileError> {
        if size > self.limits.max_object_size {
            return Err(PackfileError::ObjectTooLarge {
                size,
                max: self.limits.max_object_size,
            });
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<()> {
        let position = self.pos;
        let (obj_type, size) = self.read_type_and_size()?;
        self.check_size(size)?;
        trace!(position, ?obj_type, size, "object record");

        match obj_type {
            PackObjectType::Commit => self.store_inflated(GitObjectType::Commit, size, position),
            PackObjectType::Tree => self.store_inflated(GitObjectType::Tree, size, position),
            PackObjectType::Blob => self.store_inflated(GitObjectType::Blob, size, position),
            PackObjectType::Tag => self.store_inflated(GitObjectType::Tag, size, position),
            PackObjectType::RefDelta => {
                let raw_base = self
                    .body
                    .get(self.pos..self.pos + Sha::LEN)
                    .ok_or(PackfileError::Truncated("delta base id"))?;
                let base = Sha::from_slice(raw_base).ok_or(PackfileError::Truncated("delta base id"))?;
                self.pos += Sha::LEN;
                let delta = self.inflate(size)?;
                self.resolve_or_defer(position, DeltaBase::Hash(base), delta)
            }
            PackObjectType::OffsetDelta => {
                // Offsets count back from the first byte of this record's
                // type/size header, not from the offset bytes themselves.
                let offset = self.read_base_offset()?;
                let base_position = position
                    .checked_sub(offset)
                    .filter(|_| offset > 0)
                    .ok_or_else(|| DeltaError::DanglingBase(format!("offset -{offset} from {position}")))?;
                let delta = self.inflate(size)?;
                self.resolve_or_defer(position, DeltaBase::Offset(base_position), delta)
            }
        }
    }

    fn store_inflated(&mut self, kind: GitObjectType, size: u64, position: usize) -> Result<()> {
        let data = self.inflate(size)?;
        self.store(kind, data, position)?;
        Ok(())
    }

    fn lookup_base(&self, base: DeltaBase) -> Option<Sha> {
        match base {
            DeltaBase::Hash(sha) => self.raw.contains_key(&sha).then_some(sha),
            DeltaBase::Offset(position) => self.by_offset.get(&position).copied(),
        }
    }

    fn resolve_or_defer(&mut self, position: usize, base: DeltaBase, delta: Vec<u8>) -> Result<()> {
        // The delta header states the patched size; refuse it before any
        // copy instruction gets to expand it.
        let (_, target_size) = delta_sizes(&delta)?;
        self.check_size(target_size)?;

        if let Some(base_sha) = self.lookup_base(base) {
            let (kind, data) = self.patch(base_sha, &delta)?;
            self.store(kind, data, position)?;
            return Ok(());
        }
        match base {
            DeltaBase::Offset(base_position) if !self.pending_offsets.contains(&base_position) => {
                Err(DeltaError::DanglingBase(base.describe()).into())
            }
            _ => {
                trace!(position, ?base, "deferring delta with undecoded base");
                self.pending_offsets.insert(position);
                self.pending
                    .entry(base)
                    .or_default()
                    .push(PendingDelta { position, delta });
                Ok(())
            }
        }
    }

    fn patch(&self, base_sha: Sha, delta: &[u8]) -> Result<(GitObjectType, Vec<u8>)> {
        let base = self
            .raw
            .get(&base_sha)
            .ok_or_else(|| DeltaError::DanglingBase(base_sha.to_hex()))?;
        Ok((base.kind, apply_delta(&base.data, delta)?))
    }

    /// Deltas waiting on the object just stored at `position` under `hash`.
    fn take_waiting(&mut self, hash: Sha, position: usize) -> Vec<(Sha, PendingDelta)> {
        [DeltaBase::Hash(hash), DeltaBase::Offset(position)]
            .into_iter()
            .filter_map(|base| self.pending.remove(&base))
            .flatten()
            .map(|pending| (hash, pending))
            .collect()
    }

    /// Resolves deferred deltas once the main pass is over. Every delta whose
    /// base is now known seeds a worklist; each object it produces releases
    /// the deltas waiting on it in turn. Anything left references an object
    /// this pack does not contain.
    fn resolve_pending(&mut self) -> Result<()> {
        let mut ready = VecDeque::new();
        let mut seeds = self
            .pending
            .keys()
            .filter_map(|base| self.lookup_base(*base).map(|sha| (*base, sha)))
            .collect::<Vec<_>>();
        seeds.sort_by_key(|(base, _)| self.pending[base].iter().map(|p| p.position).min());
        for (base, sha) in seeds {
            if let Some(waiting) = self.pending.remove(&base) {
                ready.extend(waiting.into_iter().map(|pending| (sha, pending)));
            }
        }

        while let Some((base_sha, pending)) = ready.pop_front() {
            self.pending_offsets.remove(&pending.position);
            let (kind, data) = self.patch(base_sha, &pending.delta)?;
            let hash = self.store(kind, data, pending.position)?;
            ready.extend(self.take_waiting(hash, pending.position));
        }

        let Some((base, first)) = self
            .pending
            .iter()
            .flat_map(|(base, waiting)| waiting.iter().map(move |p| (*base, p.position)))
            .min_by_key(|(_, position)| *position)
        else {
            return Ok(());
        };
        warn!(
            count = self.pending.values().map(Vec::len).sum::<usize>(),
            ?base,
            position = first,
            "unresolvable deltas left in pack"
        );
        Err(DeltaError::DanglingBase(base.describe()).into())
    }

    fn store(&mut self, kind: GitObjectType, data: Vec<u8>, position: usize) -> Result<Sha> {
        let data = Bytes::from(data);
        let hash = hash_object(kind, &data);
        self.by_offset.insert(position, hash);
        if self.raw.contains_key(&hash) {
            trace!(%hash, "duplicate object in pack");
            return Ok(hash);
        }

        let keep_content = self.on_blob.is_some();
        if kind == GitObjectType::Blob {
            if let Some(on_blob) = self.on_blob.as_mut() {
                on_blob(&hash, &data);
            }
        }
        let object = AnyGitObject::decode(kind, hash, &data, keep_content)?;
        self.packfile.insert(object);
        self.raw.insert(hash, RawObject { kind, data });
        Ok(hash)
    }
}

/// One record queued in a [`PackBuilder`].
#[derive(Debug, Clone)]
enum PackEntry {
    Full(GitObjectType, Vec<u8>),
    RefDelta(Sha, Vec<u8>),
    OffsetDelta(usize, Vec<u8>),
}

/// Writes packs record by record: whole objects and either delta form.
#[derive(Debug, Default, Clone)]
pub struct PackBuilder {
    entries: Vec<PackEntry>,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a whole object and returns its record index.
    pub fn add(&mut self, kind: GitObjectType, data: impl Into<Vec<u8>>) -> usize {
        self.entries.push(PackEntry::Full(kind, data.into()));
        self.entries.len() - 1
    }

    pub fn add_ref_delta(&mut self, base: Sha, delta: Vec<u8>) -> usize {
        self.entries.push(PackEntry::RefDelta(base, delta));
        self.entries.len() - 1
    }

    /// Adds a delta against the record at index `base`, which must come earlier.
    pub fn add_ofs_delta(&mut self, base: usize, delta: Vec<u8>) -> usize {
        self.entries.push(PackEntry::OffsetDelta(base, delta));
        self.entries.len() - 1
    }

    pub fn build(&self) -> std::result::Result<Vec<u8>, PackfileError> {
        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        let mut positions = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let position = pack.len();
            positions.push(position);
            let (obj_type, data) = match entry {
                PackEntry::Full(kind, data) => (PackObjectType::from(*kind), data),
                PackEntry::RefDelta(_, data) => (PackObjectType::RefDelta, data),
                PackEntry::OffsetDelta(_, data) => (PackObjectType::OffsetDelta, data),
            };
            write_type_and_size(&mut pack, obj_type, data.len() as u64);
            match entry {
                PackEntry::RefDelta(base, _) => pack.extend_from_slice(base.as_ref()),
                PackEntry::OffsetDelta(base, _) => {
                    let base_position = *positions
                        .get(*base)
                        .filter(|_| *base < positions.len() - 1)
                        .ok_or(PackfileError::Truncated("ofs-delta base index"))?;
                    write_base_offset(&mut pack, position - base_position);
                }
                PackEntry::Full(..) => {}
            }
            let compressed =
                compress(data).map_err(|err| PackfileError::CorruptStream(err.to_string()))?;
            pack.extend_from_slice(&compressed);
        }

        let checksum = hex::decode(sha1_hex(&pack))
            .map_err(|err| PackfileError::CorruptStream(err.to_string()))?;
        pack.extend_from_slice(&checksum);
        Ok(pack)
    }
}

fn write_type_and_size(pack: &mut Vec<u8>, obj_type: PackObjectType, size: u64) {
    let mut first_byte = (obj_type.tag() << VARINT_FIRST_BYTE_ENCODING_BITS) | (size & 0x0f) as u8;
    let mut remaining = size >> VARINT_FIRST_BYTE_ENCODING_BITS;
    if remaining > 0 {
        first_byte |= VARINT_CONTINUE_FLAG;
    }
    pack.push(first_byte);
    while remaining > 0 {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= VARINT_ENCODING_BITS;
        if remaining > 0 {
            byte |= VARINT_CONTINUE_FLAG;
        }
        pack.push(byte);
    }
}

fn write_base_offset(pack: &mut Vec<u8>, mut offset: usize) {
    let mut bytes = vec![(offset & 0x7f) as u8];
    offset >>= VARINT_ENCODING_BITS;
    while offset > 0 {
        offset -= 1;
        bytes.push(VARINT_CONTINUE_FLAG | (offset & 0x7f) as u8);
        offset >>= VARINT_ENCODING_BITS;
    }
    bytes.reverse();
    pack.extend_from_slice(&bytes);
}
