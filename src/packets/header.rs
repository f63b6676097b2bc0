//! The 64-byte message header shared by every command, and the status
//! codes the server emits.

use modular_bitfield::prelude::*;

use super::wire::{Reader, Writer};

pub const HEADER_SIZE: usize = 64;

/// 0xFE 'S' 'M' 'B', read as a little-endian u32.
pub const PROTOCOL_MAGIC: u32 = 0x424d53fe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Negotiate = 0x0000,
    SessionSetup = 0x0001,
    Logoff = 0x0002,
    TreeConnect = 0x0003,
    TreeDisconnect = 0x0004,
    Create = 0x0005,
    Close = 0x0006,
    Flush = 0x0007,
    Read = 0x0008,
    Write = 0x0009,
    Lock = 0x000a,
    Ioctl = 0x000b,
    Cancel = 0x000c,
    Echo = 0x000d,
    QueryDirectory = 0x000e,
    ChangeNotify = 0x000f,
    QueryInfo = 0x0010,
    SetInfo = 0x0011,
    OplockBreak = 0x0012,
}

impl Command {
    pub fn from_code(code: u16) -> Option<Command> {
        use Command::*;
        Some(match code {
            0x0000 => Negotiate,
            0x0001 => SessionSetup,
            0x0002 => Logoff,
            0x0003 => TreeConnect,
            0x0004 => TreeDisconnect,
            0x0005 => Create,
            0x0006 => Close,
            0x0007 => Flush,
            0x0008 => Read,
            0x0009 => Write,
            0x000a => Lock,
            0x000b => Ioctl,
            0x000c => Cancel,
            0x000d => Echo,
            0x000e => QueryDirectory,
            0x000f => ChangeNotify,
            0x0010 => QueryInfo,
            0x0011 => SetInfo,
            0x0012 => OplockBreak,
            _ => return None,
        })
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status codes the front end emits. The full NT status space is much
/// larger; this is the closed set the error taxonomy maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0x00000000,
    Pending = 0x00000103,
    InvalidParameter = 0xc000000d_u32 as isize,
    InvalidDeviceRequest = 0xc0000010_u32 as isize,
    AccessDenied = 0xc0000022_u32 as isize,
    ObjectNameNotFound = 0xc0000034_u32 as isize,
    ObjectNameCollision = 0xc0000035_u32 as isize,
    FileLockConflict = 0xc0000054_u32 as isize,
    LockNotGranted = 0xc0000055_u32 as isize,
    RangeNotLocked = 0xc000007e_u32 as isize,
    InsufficientResources = 0xc000009a_u32 as isize,
    FileIsADirectory = 0xc00000ba_u32 as isize,
    NotSupported = 0xc00000bb_u32 as isize,
    DirectoryNotEmpty = 0xc0000101_u32 as isize,
    NotADirectory = 0xc0000103_u32 as isize,
    Cancelled = 0xc0000120_u32 as isize,
    FileClosed = 0xc0000128_u32 as isize,
    PossibleDeadlock = 0xc0000194_u32 as isize,
}

impl Status {
    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

#[bitfield]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags {
    pub response: bool,
    pub async_command: bool,
    pub related: bool,
    pub signed: bool,
    pub priority: B3,
    #[skip]
    __: B21,
    pub dfs_operation: bool,
    pub replay_operation: bool,
    #[skip]
    __: B2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub credit_charge: u16,
    pub status: u32,
    /// Raw command code; unknown codes are the dispatcher's problem.
    pub command: u16,
    pub credits: u16,
    pub flags: HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    pub tree_id: u32,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl MessageHeader {
    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u32(PROTOCOL_MAGIC);
        reader.expect_u16(HEADER_SIZE as u16);
        let credit_charge = reader.read_u16();
        let status = reader.read_u32();
        let command = reader.read_u16();
        let credits = reader.read_u16();
        let flags = HeaderFlags::from_bytes(reader.read_u32().to_le_bytes());
        let next_command = reader.read_u32();
        let message_id = reader.read_u64();
        reader.skip(4); // reserved
        let tree_id = reader.read_u32();
        let session_id = reader.read_u64();
        let signature = reader.read_array::<16>();
        MessageHeader {
            credit_charge,
            status,
            command,
            credits,
            flags,
            next_command,
            message_id,
            tree_id,
            session_id,
            signature,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u32(PROTOCOL_MAGIC);
        writer.put_u16(HEADER_SIZE as u16);
        writer.put_u16(self.credit_charge);
        writer.put_u32(self.status);
        writer.put_u16(self.command);
        writer.put_u16(self.credits);
        writer.put_u32(u32::from_le_bytes(self.flags.into_bytes()));
        writer.put_u32(self.next_command);
        writer.put_u64(self.message_id);
        writer.put_u32(0); // reserved
        writer.put_u32(self.tree_id);
        writer.put_u64(self.session_id);
        writer.put_bytes(&self.signature);
    }

    /// Request header for tests and loopback tooling.
    pub fn request(command: Command, message_id: u64) -> Self {
        MessageHeader {
            credit_charge: 1,
            status: 0,
            command: command.code(),
            credits: 1,
            flags: HeaderFlags::new(),
            next_command: 0,
            message_id,
            tree_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    /// Response header mirroring a request: same command, message id,
    /// session and tree, with the response flag raised.
    pub fn response_to(request: &MessageHeader, status: Status) -> Self {
        MessageHeader {
            credit_charge: request.credit_charge,
            status: status.code(),
            command: request.command,
            credits: request.credits.max(1),
            flags: HeaderFlags::new().with_response(true),
            next_command: 0,
            message_id: request.message_id,
            tree_id: request.tree_id,
            session_id: request.session_id,
            signature: [0; 16],
        }
    }
}
