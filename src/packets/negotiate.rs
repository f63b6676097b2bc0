//! Negotiate request/response bodies and the negotiate-context list.
//!
//! Offsets inside these structures are relative to the start of the
//! 64-byte message header; body codecs account for [`HEADER_SIZE`].
//! Context frames are packed 8-byte aligned, the data-length field of a
//! frame excludes padding, and no padding follows the last frame.

use std::str::FromStr;

use modular_bitfield::prelude::*;

use super::file_time::FileTime;
use super::guid::Guid;
use super::header::HEADER_SIZE;
use super::wire::{Reader, WireError, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dialect {
    Smb0202 = 0x0202,
    Smb021 = 0x0210,
    Smb030 = 0x0300,
    Smb0302 = 0x0302,
    Smb0311 = 0x0311,
}

impl Dialect {
    pub const MIN: Dialect = Dialect::Smb0202;
    pub const MAX: Dialect = Dialect::Smb0311;
    pub const ALL: [Dialect; 5] = [
        Dialect::Smb0202,
        Dialect::Smb021,
        Dialect::Smb030,
        Dialect::Smb0302,
        Dialect::Smb0311,
    ];

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Dialect> {
        Dialect::ALL.iter().copied().find(|d| d.code() == code)
    }

    #[inline]
    pub fn is_smb3(&self) -> bool {
        matches!(self, Dialect::Smb030 | Dialect::Smb0302 | Dialect::Smb0311)
    }
}

impl FromStr for Dialect {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2.0.2" => Ok(Dialect::Smb0202),
            "2.1" => Ok(Dialect::Smb021),
            "3.0" => Ok(Dialect::Smb030),
            "3.0.2" => Ok(Dialect::Smb0302),
            "3.1.1" => Ok(Dialect::Smb0311),
            other => Err(crate::Error::InvalidConfiguration(format!(
                "unknown dialect {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Dialect::Smb0202 => "2.0.2",
            Dialect::Smb021 => "2.1",
            Dialect::Smb030 => "3.0",
            Dialect::Smb0302 => "3.0.2",
            Dialect::Smb0311 => "3.1.1",
        };
        write!(f, "{}", name)
    }
}

/// Multi-protocol upgrade sentinel a client may place in its dialect list.
pub const SMB2_WILDCARD: u16 = 0x02ff;

#[bitfield]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateSecurityMode {
    pub signing_enabled: bool,
    pub signing_required: bool,
    #[skip]
    __: B14,
}

#[bitfield]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCapabilities {
    pub dfs: bool,
    pub leasing: bool,
    pub large_mtu: bool,
    pub multi_channel: bool,

    pub persistent_handles: bool,
    pub directory_leasing: bool,
    pub encryption: bool,
    pub notifications: bool,

    #[skip]
    __: B24,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha512 = 0x0001,
}

impl HashAlgorithm {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<HashAlgorithm> {
        match code {
            0x0001 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionCipher {
    Aes128Ccm = 0x0001,
    Aes128Gcm = 0x0002,
    Aes256Ccm = 0x0003,
    Aes256Gcm = 0x0004,
}

impl EncryptionCipher {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<EncryptionCipher> {
        match code {
            0x0001 => Some(EncryptionCipher::Aes128Ccm),
            0x0002 => Some(EncryptionCipher::Aes128Gcm),
            0x0003 => Some(EncryptionCipher::Aes256Ccm),
            0x0004 => Some(EncryptionCipher::Aes256Gcm),
            _ => None,
        }
    }
}

/// Server-side cipher preference, strongest hardware path first.
pub const CIPHER_PREFERENCE: [EncryptionCipher; 4] = [
    EncryptionCipher::Aes128Gcm,
    EncryptionCipher::Aes128Ccm,
    EncryptionCipher::Aes256Gcm,
    EncryptionCipher::Aes256Ccm,
];

pub const CONTEXT_PREAUTH_INTEGRITY: u16 = 0x0001;
pub const CONTEXT_ENCRYPTION: u16 = 0x0002;
pub const CONTEXT_NETNAME: u16 = 0x0005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthIntegrityCapabilities {
    /// Raw algorithm ids; only [`HashAlgorithm::Sha512`] is understood.
    pub hash_algorithms: Vec<u16>,
    pub salt: Vec<u8>,
}

impl PreauthIntegrityCapabilities {
    pub fn offers_sha512(&self) -> bool {
        self.hash_algorithms
            .contains(&HashAlgorithm::Sha512.code())
    }

    fn read(reader: &mut Reader) -> Self {
        let algorithm_count = reader.read_u16();
        let salt_length = reader.read_u16();
        let hash_algorithms = (0..algorithm_count).map(|_| reader.read_u16()).collect();
        let salt = reader.read_bytes(salt_length as usize).to_vec();
        PreauthIntegrityCapabilities {
            hash_algorithms,
            salt,
        }
    }

    fn write(&self, writer: &mut Writer) {
        writer.put_u16(self.hash_algorithms.len() as u16);
        writer.put_u16(self.salt.len() as u16);
        for algorithm in &self.hash_algorithms {
            writer.put_u16(*algorithm);
        }
        writer.put_bytes(&self.salt);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionCapabilities {
    /// Raw cipher ids, in the sender's preference order.
    pub ciphers: Vec<u16>,
}

impl EncryptionCapabilities {
    fn read(reader: &mut Reader) -> Self {
        let cipher_count = reader.read_u16();
        let ciphers = (0..cipher_count).map(|_| reader.read_u16()).collect();
        EncryptionCapabilities { ciphers }
    }

    fn write(&self, writer: &mut Writer) {
        writer.put_u16(self.ciphers.len() as u16);
        for cipher in &self.ciphers {
            writer.put_u16(*cipher);
        }
    }
}

/// UTF-16LE server name, no length prefix; the frame header bounds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetnameContext {
    pub netname: String,
}

impl NetnameContext {
    fn read(reader: &mut Reader) -> Self {
        let raw = reader.read_bytes(reader.remaining());
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        NetnameContext {
            netname: String::from_utf16_lossy(&units),
        }
    }

    fn write(&self, writer: &mut Writer) {
        for unit in self.netname.encode_utf16() {
            writer.put_u16(unit);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    PreauthIntegrity(PreauthIntegrityCapabilities),
    Encryption(EncryptionCapabilities),
    Netname(NetnameContext),
    /// Unknown context types round-trip as raw bytes; ingress logs and
    /// skips them and no response context is ever emitted for one.
    Unknown { context_type: u16, data: Vec<u8> },
}

impl NegotiateContext {
    pub fn context_type(&self) -> u16 {
        match self {
            NegotiateContext::PreauthIntegrity(_) => CONTEXT_PREAUTH_INTEGRITY,
            NegotiateContext::Encryption(_) => CONTEXT_ENCRYPTION,
            NegotiateContext::Netname(_) => CONTEXT_NETNAME,
            NegotiateContext::Unknown { context_type, .. } => *context_type,
        }
    }

    pub fn read(reader: &mut Reader) -> Self {
        let context_type = reader.read_u16();
        let data_length = reader.read_u16();
        reader.expect_u32(0); // reserved
        let data = reader.read_bytes(data_length as usize);

        let mut dr = Reader::new(data);
        let parsed = match context_type {
            CONTEXT_PREAUTH_INTEGRITY => {
                NegotiateContext::PreauthIntegrity(PreauthIntegrityCapabilities::read(&mut dr))
            }
            CONTEXT_ENCRYPTION => {
                NegotiateContext::Encryption(EncryptionCapabilities::read(&mut dr))
            }
            CONTEXT_NETNAME => NegotiateContext::Netname(NetnameContext::read(&mut dr)),
            other => {
                log::debug!("skipping unknown negotiate context type {:#06x}", other);
                NegotiateContext::Unknown {
                    context_type: other,
                    data: data.to_vec(),
                }
            }
        };
        if !matches!(parsed, NegotiateContext::Unknown { .. }) {
            dr.expect_end();
        }
        if let Some(err) = dr.error() {
            reader.fail(err.clone());
        }
        parsed
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(self.context_type());
        let data_length_at = writer.reserve_u16();
        writer.put_u32(0); // reserved
        let data_start = writer.pos();
        match self {
            NegotiateContext::PreauthIntegrity(caps) => caps.write(writer),
            NegotiateContext::Encryption(caps) => caps.write(writer),
            NegotiateContext::Netname(netname) => netname.write(writer),
            NegotiateContext::Unknown { data, .. } => writer.put_bytes(data),
        }
        // Length excludes any inter-context padding appended later.
        writer.patch_u16(data_length_at, (writer.pos() - data_start) as u16);
    }
}

/// Reads a packed, 8-aligned context list of `count` frames.
fn read_context_list(reader: &mut Reader, count: u16) -> Vec<NegotiateContext> {
    let mut contexts = Vec::with_capacity(count as usize);
    for i in 0..count {
        if i > 0 {
            reader.align(8);
        }
        contexts.push(NegotiateContext::read(reader));
        if !reader.ok() {
            break;
        }
    }
    contexts
}

/// Writes the context list and back-patches `offset_at` with the absolute
/// offset (from the header start) of the first frame.
fn write_context_list(writer: &mut Writer, offset_at: super::wire::Patch, contexts: &[NegotiateContext]) {
    for (i, context) in contexts.iter().enumerate() {
        writer.align_to(8);
        if i == 0 {
            writer.patch_u32(offset_at, (writer.pos() + HEADER_SIZE) as u32);
        }
        context.write(writer);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    pub security_mode: NegotiateSecurityMode,
    pub capabilities: GlobalCapabilities,
    pub client_guid: Guid,
    /// Raw dialect codes as sent; may include [`SMB2_WILDCARD`].
    pub dialects: Vec<u16>,
    /// Present only when 0x0311 is offered.
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl NegotiateRequest {
    pub fn find_preauth(&self) -> Option<&PreauthIntegrityCapabilities> {
        self.negotiate_contexts.iter().find_map(|c| match c {
            NegotiateContext::PreauthIntegrity(caps) => Some(caps),
            _ => None,
        })
    }

    pub fn find_encryption(&self) -> Option<&EncryptionCapabilities> {
        self.negotiate_contexts.iter().find_map(|c| match c {
            NegotiateContext::Encryption(caps) => Some(caps),
            _ => None,
        })
    }

    pub fn find_netname(&self) -> Option<&NetnameContext> {
        self.negotiate_contexts.iter().find_map(|c| match c {
            NegotiateContext::Netname(netname) => Some(netname),
            _ => None,
        })
    }

    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u16(0x24);
        let dialect_count = reader.read_u16();
        let security_mode = NegotiateSecurityMode::from_bytes(reader.read_u16().to_le_bytes());
        reader.expect_u16(0); // reserved
        let capabilities = GlobalCapabilities::from_bytes(reader.read_u32().to_le_bytes());
        let client_guid = Guid::read(reader);
        let context_offset = reader.read_u32();
        let context_count = reader.read_u16();
        reader.expect_u16(0); // reserved2
        let dialects: Vec<u16> = (0..dialect_count).map(|_| reader.read_u16()).collect();

        let mut negotiate_contexts = Vec::new();
        if dialects.contains(&Dialect::Smb0311.code()) && context_count > 0 {
            if (context_offset as usize) < HEADER_SIZE {
                reader.fail(WireError::OutOfBounds {
                    target: context_offset as usize,
                    len: HEADER_SIZE,
                });
            } else {
                reader.seek(context_offset as usize - HEADER_SIZE);
                negotiate_contexts = read_context_list(reader, context_count);
            }
        }

        NegotiateRequest {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            negotiate_contexts,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(0x24);
        writer.put_u16(self.dialects.len() as u16);
        writer.put_u16(u16::from_le_bytes(self.security_mode.into_bytes()));
        writer.put_u16(0); // reserved
        writer.put_u32(u32::from_le_bytes(self.capabilities.into_bytes()));
        self.client_guid.write(writer);
        let context_offset_at = writer.reserve_u32();
        writer.put_u16(self.negotiate_contexts.len() as u16);
        writer.put_u16(0); // reserved2
        for dialect in &self.dialects {
            writer.put_u16(*dialect);
        }
        write_context_list(writer, context_offset_at, &self.negotiate_contexts);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    pub security_mode: NegotiateSecurityMode,
    /// Selected dialect code; may be [`SMB2_WILDCARD`] when echoing the
    /// multi-protocol sentinel.
    pub dialect_revision: u16,
    pub server_guid: Guid,
    pub capabilities: GlobalCapabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: FileTime,
    pub server_start_time: FileTime,
    pub security_buffer: Vec<u8>,
    pub negotiate_contexts: Vec<NegotiateContext>,
}

impl NegotiateResponse {
    pub fn read(reader: &mut Reader) -> Self {
        reader.expect_u16(0x41);
        let security_mode = NegotiateSecurityMode::from_bytes(reader.read_u16().to_le_bytes());
        let dialect_revision = reader.read_u16();
        let context_count = reader.read_u16();
        let server_guid = Guid::read(reader);
        let capabilities = GlobalCapabilities::from_bytes(reader.read_u32().to_le_bytes());
        let max_transact_size = reader.read_u32();
        let max_read_size = reader.read_u32();
        let max_write_size = reader.read_u32();
        let system_time = FileTime::read(reader);
        let server_start_time = FileTime::read(reader);
        let security_buffer_offset = reader.read_u16();
        let security_buffer_length = reader.read_u16();
        let context_offset = reader.read_u32();

        let mut security_buffer = Vec::new();
        if security_buffer_length > 0 {
            if (security_buffer_offset as usize) < HEADER_SIZE {
                reader.fail(WireError::OutOfBounds {
                    target: security_buffer_offset as usize,
                    len: HEADER_SIZE,
                });
            } else {
                reader.seek(security_buffer_offset as usize - HEADER_SIZE);
                security_buffer = reader.read_bytes(security_buffer_length as usize).to_vec();
            }
        }

        let mut negotiate_contexts = Vec::new();
        if dialect_revision == Dialect::Smb0311.code() && context_count > 0 {
            if (context_offset as usize) < HEADER_SIZE {
                reader.fail(WireError::OutOfBounds {
                    target: context_offset as usize,
                    len: HEADER_SIZE,
                });
            } else {
                reader.seek(context_offset as usize - HEADER_SIZE);
                negotiate_contexts = read_context_list(reader, context_count);
            }
        }

        NegotiateResponse {
            security_mode,
            dialect_revision,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_buffer,
            negotiate_contexts,
        }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(0x41);
        writer.put_u16(u16::from_le_bytes(self.security_mode.into_bytes()));
        writer.put_u16(self.dialect_revision);
        writer.put_u16(self.negotiate_contexts.len() as u16);
        self.server_guid.write(writer);
        writer.put_u32(u32::from_le_bytes(self.capabilities.into_bytes()));
        writer.put_u32(self.max_transact_size);
        writer.put_u32(self.max_read_size);
        writer.put_u32(self.max_write_size);
        self.system_time.write(writer);
        self.server_start_time.write(writer);
        let security_offset_at = writer.reserve_u16();
        writer.put_u16(self.security_buffer.len() as u16);
        let context_offset_at = writer.reserve_u32();
        writer.patch_u16(security_offset_at, (writer.pos() + HEADER_SIZE) as u16);
        writer.put_bytes(&self.security_buffer);
        write_context_list(writer, context_offset_at, &self.negotiate_contexts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contexts() -> Vec<NegotiateContext> {
        vec![
            NegotiateContext::PreauthIntegrity(PreauthIntegrityCapabilities {
                hash_algorithms: vec![HashAlgorithm::Sha512.code()],
                salt: (0..32).collect(),
            }),
            NegotiateContext::Encryption(EncryptionCapabilities {
                ciphers: vec![
                    EncryptionCipher::Aes128Gcm.code(),
                    EncryptionCipher::Aes128Ccm.code(),
                ],
            }),
            NegotiateContext::Netname(NetnameContext {
                netname: "fileserver".to_string(),
            }),
        ]
    }

    #[test]
    fn test_request_round_trip_with_contexts() {
        let request = NegotiateRequest {
            security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
            capabilities: GlobalCapabilities::new().with_dfs(true).with_leasing(true),
            client_guid: Guid::from([7u8; 16]),
            dialects: vec![0x0202, 0x0210, 0x0300, 0x0302, 0x0311],
            negotiate_contexts: sample_contexts(),
        };
        let mut w = Writer::new();
        request.write(&mut w);
        let bytes = w.finish().unwrap();

        let mut r = Reader::new(&bytes);
        let parsed = NegotiateRequest::read(&mut r);
        assert!(r.finish().is_ok());
        assert_eq!(parsed, request);

        // Re-encoding the parse yields the same bytes.
        let mut w2 = Writer::new();
        parsed.write(&mut w2);
        assert_eq!(w2.finish().unwrap(), bytes);
    }

    #[test]
    fn test_request_without_0311_has_no_contexts() {
        let request = NegotiateRequest {
            security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
            capabilities: GlobalCapabilities::new(),
            client_guid: Guid::from([1u8; 16]),
            dialects: vec![0x0202, 0x0210],
            negotiate_contexts: Vec::new(),
        };
        let mut w = Writer::new();
        request.write(&mut w);
        let bytes = w.finish().unwrap();
        let mut r = Reader::new(&bytes);
        let parsed = NegotiateRequest::read(&mut r);
        assert!(r.finish().is_ok());
        assert!(parsed.negotiate_contexts.is_empty());
    }

    #[test]
    fn test_unknown_context_round_trips_raw() {
        let request = NegotiateRequest {
            security_mode: NegotiateSecurityMode::new(),
            capabilities: GlobalCapabilities::new(),
            client_guid: Guid::ZERO,
            dialects: vec![0x0311],
            negotiate_contexts: vec![
                NegotiateContext::PreauthIntegrity(PreauthIntegrityCapabilities {
                    hash_algorithms: vec![0x0001],
                    salt: vec![0xaa; 32],
                }),
                NegotiateContext::Unknown {
                    context_type: 0x0007,
                    data: vec![1, 2, 3, 4, 5],
                },
            ],
        };
        let mut w = Writer::new();
        request.write(&mut w);
        let bytes = w.finish().unwrap();
        let mut r = Reader::new(&bytes);
        let parsed = NegotiateRequest::read(&mut r);
        assert!(r.finish().is_ok());
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_truncated_context_is_an_error() {
        let request = NegotiateRequest {
            security_mode: NegotiateSecurityMode::new(),
            capabilities: GlobalCapabilities::new(),
            client_guid: Guid::ZERO,
            dialects: vec![0x0311],
            negotiate_contexts: vec![NegotiateContext::PreauthIntegrity(
                PreauthIntegrityCapabilities {
                    hash_algorithms: vec![0x0001],
                    salt: vec![0xbb; 32],
                },
            )],
        };
        let mut w = Writer::new();
        request.write(&mut w);
        let mut bytes = w.finish().unwrap();
        bytes.truncate(bytes.len() - 8);
        let mut r = Reader::new(&bytes);
        let _ = NegotiateRequest::read(&mut r);
        assert!(r.finish().is_err());
    }

    #[test]
    fn test_context_data_length_excludes_padding() {
        // A 10-byte netname context is padded to 8 bytes before the next
        // frame, but its length field must stay 10.
        let contexts = vec![
            NegotiateContext::Netname(NetnameContext {
                netname: "abcde".to_string(),
            }),
            NegotiateContext::Encryption(EncryptionCapabilities {
                ciphers: vec![0x0002],
            }),
        ];
        let mut w = Writer::new();
        let offset_at = w.reserve_u32();
        write_context_list(&mut w, offset_at, &contexts);
        let bytes = w.finish().unwrap();
        // First frame starts 8-aligned right after the 4-byte reserve.
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 10);
        // Netname data is 10 bytes; the next frame begins on the next
        // 8-byte boundary.
        let second_frame = 8 + ((8 + 10 + 7) / 8) * 8;
        assert_eq!(
            u16::from_le_bytes([bytes[second_frame], bytes[second_frame + 1]]),
            CONTEXT_ENCRYPTION
        );
    }

    #[test]
    fn test_response_round_trip() {
        let response = NegotiateResponse {
            security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
            dialect_revision: Dialect::Smb0311.code(),
            server_guid: Guid::from([9u8; 16]),
            capabilities: GlobalCapabilities::new()
                .with_leasing(true)
                .with_large_mtu(true)
                .with_directory_leasing(true),
            max_transact_size: 8 * 1024 * 1024,
            max_read_size: 8 * 1024 * 1024,
            max_write_size: 8 * 1024 * 1024,
            system_time: FileTime::from(133818609802776324),
            server_start_time: FileTime::default(),
            security_buffer: Vec::new(),
            negotiate_contexts: vec![NegotiateContext::PreauthIntegrity(
                PreauthIntegrityCapabilities {
                    hash_algorithms: vec![HashAlgorithm::Sha512.code()],
                    salt: vec![0xcd; 32],
                },
            )],
        };
        let mut w = Writer::new();
        response.write(&mut w);
        let bytes = w.finish().unwrap();
        let mut r = Reader::new(&bytes);
        let parsed = NegotiateResponse::read(&mut r);
        assert!(r.finish().is_ok());
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_dialect_strings() {
        for dialect in Dialect::ALL {
            assert_eq!(dialect.to_string().parse::<Dialect>().unwrap(), dialect);
        }
        assert!("9.9".parse::<Dialect>().is_err());
    }
}
