//! The negotiate command: dialect selection, context processing, crypto
//! state population, and the preauth hash hook around it.

use std::sync::Arc;

use async_trait::async_trait;
use rand::{rngs::OsRng, Rng};

use crate::config::ServerConfig;
use crate::context::OpContext;
use crate::packets::file_time::FileTime;
use crate::packets::guid::Guid;
use crate::packets::header::{MessageHeader, Status};
use crate::packets::negotiate::{
    Dialect, EncryptionCapabilities, GlobalCapabilities, HashAlgorithm, NegotiateContext,
    NegotiateRequest, NegotiateResponse, NegotiateSecurityMode, PreauthIntegrityCapabilities,
    CIPHER_PREFERENCE, SMB2_WILDCARD,
};
use crate::packets::wire::{Reader, Writer};

use super::crypto_state::NegotiatedProperties;
use super::dispatch::{CommandHandler, ConnectionState, HandlerResult, MessageHook};

const MAX_TRANSACT_SIZE: u32 = 8 * 1024 * 1024;
const MAX_READ_SIZE: u32 = 8 * 1024 * 1024;
const MAX_WRITE_SIZE: u32 = 8 * 1024 * 1024;

pub struct NegotiateHandler {
    config: Arc<ServerConfig>,
    server_guid: Guid,
    start_time: FileTime,
}

impl NegotiateHandler {
    pub fn new(config: Arc<ServerConfig>, server_guid: Guid) -> Self {
        NegotiateHandler {
            config,
            server_guid,
            start_time: FileTime::now(),
        }
    }

    fn security_mode(&self) -> NegotiateSecurityMode {
        NegotiateSecurityMode::new()
            .with_signing_enabled(true)
            .with_signing_required(self.config.signing_required)
    }

    /// Dialect → max-capabilities table, masked by configuration toggles.
    /// Directory leasing and encryption are additionally gated on the
    /// dialect family; on 3.1.1 the encryption bit is advertised only
    /// when a cipher was in fact negotiated.
    fn response_capabilities(&self, dialect: Dialect, cipher_negotiated: bool) -> GlobalCapabilities {
        let mut caps = GlobalCapabilities::new();
        if dialect >= Dialect::Smb021 {
            caps.set_leasing(true);
            caps.set_large_mtu(true);
        }
        if dialect.is_smb3() {
            caps.set_directory_leasing(self.config.directory_leasing_enabled);
            if dialect == Dialect::Smb0311 {
                caps.set_encryption(cipher_negotiated);
            } else {
                caps.set_encryption(self.config.encryption_enabled);
            }
        }
        caps
    }

    fn base_response(&self, dialect_revision: u16, capabilities: GlobalCapabilities) -> NegotiateResponse {
        NegotiateResponse {
            security_mode: self.security_mode(),
            dialect_revision,
            server_guid: self.server_guid,
            capabilities,
            max_transact_size: MAX_TRANSACT_SIZE,
            max_read_size: MAX_READ_SIZE,
            max_write_size: MAX_WRITE_SIZE,
            system_time: FileTime::now(),
            server_start_time: self.start_time,
            security_buffer: Vec::new(),
            negotiate_contexts: Vec::new(),
        }
    }

    fn encode(response: &NegotiateResponse) -> crate::Result<HandlerResult> {
        let mut writer = Writer::new();
        response.write(&mut writer);
        Ok(HandlerResult::ok(writer.finish()?))
    }
}

#[async_trait]
impl CommandHandler for NegotiateHandler {
    async fn handle(
        &self,
        conn: &ConnectionState,
        ctx: &OpContext,
        _header: &MessageHeader,
        body: &[u8],
    ) -> crate::Result<HandlerResult> {
        ctx.check()?;

        let mut reader = Reader::new(body);
        let request = NegotiateRequest::read(&mut reader);
        if let Err(err) = reader.finish() {
            // An unparseable negotiate is indistinguishable from tampering;
            // kill the transport rather than answer.
            log::warn!("{}: malformed negotiate request: {}", conn.peer, err);
            return Ok(HandlerResult::drop_connection());
        }

        if let Some(netname) = request.find_netname() {
            log::debug!("{}: client asked for netname {:?}", conn.peer, netname.netname);
        }

        // A wildcard in the dialect list means the client came through a
        // multi-protocol upgrade; echo it and let the client renegotiate.
        if request.dialects.contains(&SMB2_WILDCARD) {
            log::debug!("{}: echoing multi-protocol wildcard", conn.peer);
            return Self::encode(&self.base_response(SMB2_WILDCARD, GlobalCapabilities::new()));
        }

        let selected = request
            .dialects
            .iter()
            .filter_map(|code| Dialect::from_code(*code))
            .filter(|d| self.config.min_dialect <= *d && *d <= self.config.max_dialect)
            .max();
        let Some(dialect) = selected else {
            log::info!(
                "{}: no common dialect in [{}, {}], offered {:04x?}",
                conn.peer,
                self.config.min_dialect,
                self.config.max_dialect,
                request.dialects
            );
            return Err(crate::Error::NotSupported(
                "no acceptable dialect offered".to_string(),
            ));
        };

        let mut cipher = None;
        let mut preauth_hash_id = 0u16;
        let mut contexts = Vec::new();
        if dialect == Dialect::Smb0311 {
            let Some(preauth) = request.find_preauth() else {
                return Err(crate::Error::InvalidArgument(
                    "negotiate request lacks a preauth integrity context".to_string(),
                ));
            };
            if !preauth.offers_sha512() {
                return Err(crate::Error::InvalidArgument(
                    "client does not offer SHA-512 preauth integrity".to_string(),
                ));
            }
            preauth_hash_id = HashAlgorithm::Sha512.code();

            let mut salt = [0u8; 32];
            OsRng.fill(&mut salt);
            contexts.push(NegotiateContext::PreauthIntegrity(
                PreauthIntegrityCapabilities {
                    hash_algorithms: vec![HashAlgorithm::Sha512.code()],
                    salt: salt.to_vec(),
                },
            ));

            if self.config.encryption_enabled {
                if let Some(offered) = request.find_encryption() {
                    cipher = CIPHER_PREFERENCE
                        .iter()
                        .copied()
                        .find(|c| offered.ciphers.contains(&c.code()));
                }
            }
            if let Some(selected_cipher) = cipher {
                contexts.push(NegotiateContext::Encryption(EncryptionCapabilities {
                    ciphers: vec![selected_cipher.code()],
                }));
            }
        }

        let capabilities = self.response_capabilities(dialect, cipher.is_some());
        let security_mode = self.security_mode();

        conn.crypto.complete_negotiation(NegotiatedProperties {
            dialect,
            cipher,
            signing_algorithm_id: 0,
            preauth_hash_id,
            server_guid: self.server_guid,
            server_capabilities: capabilities,
            server_security_mode: security_mode,
            client_capabilities: request.capabilities,
            client_security_mode: request.security_mode,
            client_guid: request.client_guid,
            client_dialects: request.dialects.clone(),
        })?;

        log::info!(
            "{}: negotiated dialect {}, cipher {:?}",
            conn.peer,
            dialect,
            cipher
        );

        let mut response = self.base_response(dialect.code(), capabilities);
        response.negotiate_contexts = contexts;
        Self::encode(&response)
    }
}

/// Folds the raw bytes of the negotiate exchange into the connection's
/// preauth hash chain. Registered as both the pre- and post-hook on the
/// negotiate command family; a failed negotiate contributes only its
/// request to the chain.
pub struct PreauthIngestHook;

#[async_trait]
impl MessageHook for PreauthIngestHook {
    async fn before_dispatch(&self, conn: &ConnectionState, raw: &[u8]) {
        conn.crypto.update_preauth(raw).await;
    }

    async fn after_dispatch(&self, conn: &ConnectionState, raw: &[u8]) {
        if raw.len() >= 12 {
            let status = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            if status == Status::Success.code() {
                conn.crypto.update_preauth(raw).await;
            }
        }
    }
}
