//! File metadata: entries, handles, the store boundary, and the
//! two-phase write pipeline with its pending-write tracker.

pub mod content;
pub mod io;
pub mod pending;
pub mod pipeline;
pub mod store;
pub mod types;

pub use content::{ContentStore, MemoryContentStore};
pub use io::{FileIo, Origin, ShareLocks};
pub use pending::{PendingWrite, PendingWrites, PreWriteAttr};
pub use pipeline::{WriteIntent, WritePipeline};
pub use store::{MemoryMetadataStore, MetadataStore, MetadataTxn};
pub use types::{
    check_access, AccessMode, AuthContext, FileEntry, FileHandle, FileId, FileType, ObjectId,
    PayloadId,
};
