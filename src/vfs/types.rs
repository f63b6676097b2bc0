//! File entries and the opaque handles that address them.

use rand::{rngs::OsRng, Rng};
use time::OffsetDateTime;

/// In-share file identifier.
pub type FileId = u64;

/// Opaque handle encoding share name + in-share id. Collaborating
/// protocols treat it as a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    const VERSION: u8 = 1;

    pub fn new(share: &str, file_id: FileId) -> Self {
        let share_bytes = share.as_bytes();
        let mut buf = Vec::with_capacity(1 + 2 + share_bytes.len() + 8);
        buf.push(Self::VERSION);
        buf.extend_from_slice(&(share_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(share_bytes);
        buf.extend_from_slice(&file_id.to_le_bytes());
        FileHandle(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        FileHandle(bytes.to_vec())
    }

    /// Splits the handle back into share name and file id. A handle that
    /// does not parse is stale by definition.
    pub fn decode(&self) -> crate::Result<(String, FileId)> {
        let buf = &self.0;
        if buf.len() < 11 || buf[0] != Self::VERSION {
            return Err(crate::Error::StaleHandle);
        }
        let share_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        if buf.len() != 3 + share_len + 8 {
            return Err(crate::Error::StaleHandle);
        }
        let share = std::str::from_utf8(&buf[3..3 + share_len])
            .map_err(|_| crate::Error::StaleHandle)?
            .to_string();
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&buf[3 + share_len..]);
        Ok((share, u64::from_le_bytes(id_bytes)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Device,
    Socket,
    Fifo,
}

/// Opaque reference into the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadId([u8; 16]);

impl PayloadId {
    pub const ZERO: PayloadId = PayloadId([0; 16]);

    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill(&mut bytes);
        PayloadId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for PayloadId {
    fn from(value: [u8; 16]) -> Self {
        PayloadId(value)
    }
}

/// Content hash once a payload is finalized; zero while writers are
/// still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl From<[u8; 32]> for ObjectId {
    fn from(value: [u8; 32]) -> Self {
        ObjectId(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub file_id: FileId,
    pub file_type: FileType,
    /// Mode bits including setuid/setgid/sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: OffsetDateTime,
    pub mtime: OffsetDateTime,
    pub ctime: OffsetDateTime,
    pub size: u64,
    /// Zero marks an orphan awaiting content garbage-collection.
    pub nlink: u32,
    pub payload_id: PayloadId,
    pub object_id: ObjectId,
    /// Where this entry's content was forked from, if it was.
    pub cow_source: Option<PayloadId>,
}

impl FileEntry {
    /// Non-zero object id implies no active writers.
    pub fn is_finalized(&self) -> bool {
        !self.object_id.is_zero()
    }

    pub fn is_orphan(&self) -> bool {
        self.nlink == 0
    }
}

/// The authenticated identity an operation runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    /// `None` never expires.
    pub expires_at: Option<OffsetDateTime>,
}

impl AuthContext {
    pub fn root() -> Self {
        AuthContext {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            expires_at: None,
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        AuthContext {
            uid,
            gid,
            groups: Vec::new(),
            expires_at: None,
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }

    pub fn is_live(&self) -> bool {
        match self.expires_at {
            Some(expiry) => OffsetDateTime::now_utc() < expiry,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Classic class-based mode-bit check. With `owner_bypass`, a file's
/// owner is granted write regardless of mode bits, matching open-time
/// semantics where access was established at open.
pub fn check_access(
    entry: &FileEntry,
    creds: &AuthContext,
    mode: AccessMode,
    owner_bypass: bool,
) -> crate::Result<()> {
    if creds.is_superuser() {
        return Ok(());
    }
    if owner_bypass && creds.uid == entry.uid {
        return Ok(());
    }
    let class_shift = if creds.uid == entry.uid {
        6
    } else if creds.gid == entry.gid || creds.groups.contains(&entry.gid) {
        3
    } else {
        0
    };
    let wanted = match mode {
        AccessMode::Read => 0o4,
        AccessMode::Write => 0o2,
    };
    if (entry.mode >> class_shift) & wanted != 0 {
        Ok(())
    } else {
        Err(crate::Error::PermissionDenied(format!(
            "uid {} denied {:?} on file {}",
            creds.uid, mode, entry.file_id
        )))
    }
}
