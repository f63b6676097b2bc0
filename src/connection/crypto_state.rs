//! Per-connection crypto state: the set-once outcome of negotiation plus
//! the mutable preauth hash.

use crate::packets::guid::Guid;
use crate::packets::negotiate::{
    Dialect, EncryptionCipher, GlobalCapabilities, NegotiateSecurityMode,
};
use crate::sync_helpers::{OnceCell, RwLock};

use super::preauth_hash::{PreauthHash, PreauthHashValue};

/// Everything a later dialect-validation request must be checked against,
/// captured verbatim at negotiation time.
#[derive(Debug)]
pub struct NegotiatedProperties {
    /// The selected dialect revision for the connection.
    pub dialect: Dialect,

    /// Cipher agreed through the encryption context; `None` below 3.1.1 or
    /// when encryption was not negotiated.
    pub cipher: Option<EncryptionCipher>,
    /// Signing algorithm id; zero until a signing context is negotiated by
    /// a later phase.
    pub signing_algorithm_id: u16,
    /// Preauth integrity hash algorithm id; zero below 3.1.1.
    pub preauth_hash_id: u16,

    /// The server's announced values, stored for validation.
    pub server_guid: Guid,
    pub server_capabilities: GlobalCapabilities,
    pub server_security_mode: NegotiateSecurityMode,

    /// Mirror of the client's announcement.
    pub client_capabilities: GlobalCapabilities,
    pub client_security_mode: NegotiateSecurityMode,
    pub client_guid: Guid,
    pub client_dialects: Vec<u16>,
}

/// Eagerly created with its connection, before any message is processed.
/// All fields except the preauth hash are immutable once negotiation
/// completes.
#[derive(Debug, Default)]
pub struct ConnectionCryptoState {
    negotiated: OnceCell<NegotiatedProperties>,
    preauth: RwLock<PreauthHash>,
}

impl ConnectionCryptoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the negotiation outcome. Fails on a second negotiation
    /// attempt on the same connection.
    pub fn complete_negotiation(&self, properties: NegotiatedProperties) -> crate::Result<()> {
        self.negotiated.set(properties).map_err(|_| {
            crate::Error::InvalidArgument("negotiation already completed".to_string())
        })
    }

    pub fn negotiated(&self) -> Option<&NegotiatedProperties> {
        self.negotiated.get()
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.negotiated.get().map(|n| n.dialect)
    }

    pub fn cipher(&self) -> Option<EncryptionCipher> {
        self.negotiated.get().and_then(|n| n.cipher)
    }

    pub fn signing_algorithm_id(&self) -> u16 {
        self.negotiated
            .get()
            .map(|n| n.signing_algorithm_id)
            .unwrap_or(0)
    }

    /// Shared read of the current chain value; the signing layer reads
    /// this without blocking hash writers elsewhere on the connection.
    pub async fn preauth_hash(&self) -> PreauthHashValue {
        *self.preauth.read().await.value()
    }

    /// Folds one raw wire message into the chain, in received order.
    pub async fn update_preauth(&self, raw: &[u8]) {
        self.preauth.write().await.update(raw);
    }
}
