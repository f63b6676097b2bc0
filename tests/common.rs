//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use time::OffsetDateTime;

use smbd::config::ServerConfig;
use smbd::connection::ConnectionState;
use smbd::context::OpContext;
use smbd::packets::guid::Guid;
use smbd::packets::header::{Command, MessageHeader, HEADER_SIZE};
use smbd::packets::negotiate::{
    EncryptionCapabilities, GlobalCapabilities, HashAlgorithm, NegotiateContext,
    NegotiateRequest, NegotiateResponse, NegotiateSecurityMode, PreauthIntegrityCapabilities,
    Dialect,
};
use smbd::packets::wire::{Reader, Writer};
use smbd::server::SmbServer;
use smbd::vfs::{
    FileEntry, FileType, MemoryContentStore, MemoryMetadataStore, ObjectId, PayloadId,
};

pub fn file_entry(file_id: u64, uid: u32, gid: u32, mode: u32, size: u64) -> FileEntry {
    let now = OffsetDateTime::now_utc();
    FileEntry {
        file_id,
        file_type: FileType::Regular,
        mode,
        uid,
        gid,
        atime: now,
        mtime: now,
        ctime: now,
        size,
        nlink: 1,
        payload_id: PayloadId::ZERO,
        object_id: ObjectId::ZERO,
        cow_source: None,
    }
}

/// Raw negotiate message (header + body) the way a client would send it.
/// When 0x0311 is among the dialects, a preauth-integrity context (and an
/// encryption context) is included.
pub fn client_negotiate_message(message_id: u64, dialects: &[u16]) -> Vec<u8> {
    let offers_0311 = dialects.contains(&Dialect::Smb0311.code());
    let negotiate_contexts = if offers_0311 {
        vec![
            NegotiateContext::PreauthIntegrity(PreauthIntegrityCapabilities {
                hash_algorithms: vec![HashAlgorithm::Sha512.code()],
                salt: vec![0x5a; 32],
            }),
            NegotiateContext::Encryption(EncryptionCapabilities {
                ciphers: vec![0x0002, 0x0001],
            }),
        ]
    } else {
        Vec::new()
    };
    let request = NegotiateRequest {
        security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
        capabilities: GlobalCapabilities::new().with_leasing(true).with_large_mtu(true),
        client_guid: Guid::from([0x42; 16]),
        dialects: dialects.to_vec(),
        negotiate_contexts,
    };
    let mut writer = Writer::new();
    MessageHeader::request(Command::Negotiate, message_id).write(&mut writer);
    request.write(&mut writer);
    writer.finish().expect("encoding a negotiate request")
}

pub fn response_status(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]])
}

pub fn parse_negotiate_response(raw: &[u8]) -> NegotiateResponse {
    let mut reader = Reader::new(&raw[HEADER_SIZE..]);
    let response = NegotiateResponse::read(&mut reader);
    reader.finish().expect("parsing the negotiate response");
    response
}

pub struct TestServer {
    pub server: Arc<SmbServer>,
    pub meta: Arc<MemoryMetadataStore>,
    pub content: Arc<MemoryContentStore>,
}

pub fn test_server(config: ServerConfig) -> TestServer {
    let meta = Arc::new(MemoryMetadataStore::new());
    let content = Arc::new(MemoryContentStore::new());
    let server = SmbServer::new(config, meta.clone(), content.clone()).expect("server config");
    TestServer {
        server,
        meta,
        content,
    }
}

/// Runs a full negotiate on a fresh connection and returns it together
/// with the raw response.
pub async fn negotiate(
    server: &Arc<SmbServer>,
    dialects: &[u16],
) -> (Arc<ConnectionState>, Option<Vec<u8>>) {
    let conn = server.new_connection("test-client");
    let ctx = OpContext::background();
    let outcome = server
        .handle_message(&conn, &ctx, &client_negotiate_message(1, dialects))
        .await
        .expect("negotiate dispatch");
    (conn, outcome.response)
}
