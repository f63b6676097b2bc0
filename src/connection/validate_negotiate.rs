//! IOCTL dispatch, which for this front end means the dialect-validation
//! FSCTL. On 3.1.1 the command is deprecated and its appearance is a
//! downgrade signal: the connection is torn down without a response.

use async_trait::async_trait;

use crate::context::OpContext;
use crate::packets::header::{MessageHeader, Status};
use crate::packets::ioctl::{
    IoctlRequest, IoctlResponse, ValidateNegotiateInfoRequest, ValidateNegotiateInfoResponse,
    FSCTL_VALIDATE_NEGOTIATE_INFO,
};
use crate::packets::negotiate::Dialect;
use crate::packets::wire::{Reader, Writer};

use super::crypto_state::NegotiatedProperties;
use super::dispatch::{CommandHandler, ConnectionState, HandlerResult};

pub struct IoctlHandler;

#[async_trait]
impl CommandHandler for IoctlHandler {
    async fn handle(
        &self,
        conn: &ConnectionState,
        ctx: &OpContext,
        _header: &MessageHeader,
        body: &[u8],
    ) -> crate::Result<HandlerResult> {
        ctx.check()?;

        let mut reader = Reader::new(body);
        let request = IoctlRequest::read(&mut reader);
        reader.finish()?;

        match request.ctl_code {
            FSCTL_VALIDATE_NEGOTIATE_INFO => self.validate_negotiate(conn, &request),
            other => {
                log::debug!("{}: unhandled FSCTL {:#010x}", conn.peer, other);
                Ok(HandlerResult::error(Status::InvalidDeviceRequest))
            }
        }
    }
}

impl IoctlHandler {
    fn validate_negotiate(
        &self,
        conn: &ConnectionState,
        request: &IoctlRequest,
    ) -> crate::Result<HandlerResult> {
        let Some(negotiated) = conn.crypto.negotiated() else {
            return Ok(HandlerResult::error(Status::InvalidParameter));
        };

        match negotiated.dialect {
            Dialect::Smb0311 => {
                log::warn!(
                    "{}: validate-negotiate on 3.1.1 is a downgrade signal",
                    conn.peer
                );
                Ok(HandlerResult::drop_connection())
            }
            Dialect::Smb030 | Dialect::Smb0302 => {
                let mut reader = Reader::new(&request.input);
                let echoed = ValidateNegotiateInfoRequest::read(&mut reader);
                if reader.finish().is_err() {
                    log::warn!("{}: malformed validate-negotiate payload", conn.peer);
                    return Ok(HandlerResult::drop_connection());
                }
                if !Self::echo_matches(&echoed, negotiated) {
                    log::warn!(
                        "{}: validate-negotiate does not match the original negotiation",
                        conn.peer
                    );
                    return Ok(HandlerResult::drop_connection());
                }

                let info = ValidateNegotiateInfoResponse {
                    capabilities: negotiated.server_capabilities,
                    server_guid: negotiated.server_guid,
                    security_mode: negotiated.server_security_mode,
                    dialect: negotiated.dialect.code(),
                };
                let mut info_writer = Writer::new();
                info.write(&mut info_writer);
                let response = IoctlResponse {
                    ctl_code: request.ctl_code,
                    file_id: request.file_id,
                    output: info_writer.finish()?,
                };
                let mut writer = Writer::new();
                response.write(&mut writer);
                Ok(HandlerResult::ok(writer.finish()?))
            }
            _ => Ok(HandlerResult::error(Status::NotSupported)),
        }
    }

    /// Byte-for-byte comparison of the client's echoed view against what
    /// was actually negotiated.
    fn echo_matches(echoed: &ValidateNegotiateInfoRequest, negotiated: &NegotiatedProperties) -> bool {
        echoed.capabilities == negotiated.client_capabilities
            && echoed.client_guid == negotiated.client_guid
            && echoed.security_mode == negotiated.client_security_mode
            && echoed.dialects == negotiated.client_dialects
    }
}
