//! Per-command dispatch with pre/post hooks over raw wire bytes.
//!
//! The transport hands every inbound message here. Pre-hooks run in
//! registration order over the raw request, the handler produces a status
//! and body, the response is reassembled (header + body), and post-hooks
//! run over the raw response before it goes back out. A handler may flag
//! the connection for teardown instead; nothing is emitted in that case.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::OpContext;
use crate::packets::error::ErrorResponse;
use crate::packets::header::{Command, MessageHeader, Status, HEADER_SIZE};
use crate::packets::wire::{Reader, Writer};

use super::crypto_state::ConnectionCryptoState;

/// Per-connection state handed to hooks and handlers.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub crypto: ConnectionCryptoState,
    /// Peer description for logging.
    pub peer: String,
}

impl ConnectionState {
    pub fn new(peer: impl Into<String>) -> Self {
        ConnectionState {
            crypto: ConnectionCryptoState::new(),
            peer: peer.into(),
        }
    }
}

#[derive(Debug)]
pub struct HandlerResult {
    pub status: Status,
    pub body: Vec<u8>,
    /// Close the transport instead of answering.
    pub drop_connection: bool,
}

impl HandlerResult {
    pub fn ok(body: Vec<u8>) -> Self {
        HandlerResult {
            status: Status::Success,
            body,
            drop_connection: false,
        }
    }

    pub fn error(status: Status) -> Self {
        HandlerResult {
            status,
            body: Vec::new(),
            drop_connection: false,
        }
    }

    pub fn drop_connection() -> Self {
        HandlerResult {
            status: Status::Success,
            body: Vec::new(),
            drop_connection: true,
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        conn: &ConnectionState,
        ctx: &OpContext,
        header: &MessageHeader,
        body: &[u8],
    ) -> crate::Result<HandlerResult>;
}

/// Observes raw wire bytes around a command. The preauth hash update is
/// one of these; signing and encryption middleware register the same way.
#[async_trait]
pub trait MessageHook: Send + Sync {
    async fn before_dispatch(&self, conn: &ConnectionState, raw: &[u8]);
    async fn after_dispatch(&self, conn: &ConnectionState, raw: &[u8]);
}

#[derive(Debug)]
pub struct DispatchOutcome {
    /// Raw response bytes; `None` when the connection is being dropped.
    pub response: Option<Vec<u8>>,
    pub drop_connection: bool,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Command, Arc<dyn CommandHandler>>,
    hooks: HashMap<Command, Vec<Arc<dyn MessageHook>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, command: Command, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(command, handler);
    }

    pub fn register_hook(&mut self, command: Command, hook: Arc<dyn MessageHook>) {
        self.hooks.entry(command).or_default().push(hook);
    }

    pub async fn dispatch(
        &self,
        conn: &ConnectionState,
        ctx: &OpContext,
        raw: &[u8],
    ) -> crate::Result<DispatchOutcome> {
        ctx.check()?;

        let mut reader = Reader::new(raw);
        let header = MessageHeader::read(&mut reader);
        let body_start = reader.pos();
        reader.finish()?;
        let body = &raw[body_start..];

        let command = Command::from_code(header.command);
        let hooks = command
            .and_then(|c| self.hooks.get(&c))
            .map(|v| v.as_slice())
            .unwrap_or(&[]);

        for hook in hooks {
            hook.before_dispatch(conn, raw).await;
        }

        let result = match command.and_then(|c| self.handlers.get(&c)) {
            Some(handler) => match handler.handle(conn, ctx, &header, body).await {
                Ok(result) => result,
                Err(err) => {
                    log::debug!(
                        "{}: command {:#06x} failed: {}",
                        conn.peer,
                        header.command,
                        err
                    );
                    HandlerResult::error(err.status())
                }
            },
            None => {
                log::debug!(
                    "{}: no handler for command {:#06x}",
                    conn.peer,
                    header.command
                );
                HandlerResult::error(Status::NotSupported)
            }
        };

        if result.drop_connection {
            log::info!("{}: dropping connection", conn.peer);
            return Ok(DispatchOutcome {
                response: None,
                drop_connection: true,
            });
        }

        let response = Self::assemble_response(&header, &result)?;
        for hook in hooks {
            hook.after_dispatch(conn, &response).await;
        }

        Ok(DispatchOutcome {
            response: Some(response),
            drop_connection: false,
        })
    }

    fn assemble_response(
        request: &MessageHeader,
        result: &HandlerResult,
    ) -> crate::Result<Vec<u8>> {
        let mut writer = Writer::new();
        MessageHeader::response_to(request, result.status).write(&mut writer);
        if result.body.is_empty() && !result.status.is_success() {
            ErrorResponse.write(&mut writer);
        } else {
            writer.put_bytes(&result.body);
        }
        debug_assert!(writer.pos() >= HEADER_SIZE);
        Ok(writer.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(
            &self,
            _conn: &ConnectionState,
            _ctx: &OpContext,
            _header: &MessageHeader,
            body: &[u8],
        ) -> crate::Result<HandlerResult> {
            Ok(HandlerResult::ok(body.to_vec()))
        }
    }

    struct DropHandler;

    #[async_trait]
    impl CommandHandler for DropHandler {
        async fn handle(
            &self,
            _conn: &ConnectionState,
            _ctx: &OpContext,
            _header: &MessageHeader,
            _body: &[u8],
        ) -> crate::Result<HandlerResult> {
            Ok(HandlerResult::drop_connection())
        }
    }

    #[derive(Default)]
    struct CountingHook {
        before: AtomicUsize,
        after: AtomicUsize,
    }

    #[async_trait]
    impl MessageHook for CountingHook {
        async fn before_dispatch(&self, _conn: &ConnectionState, _raw: &[u8]) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }
        async fn after_dispatch(&self, _conn: &ConnectionState, _raw: &[u8]) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn raw_message(command: Command, body: &[u8]) -> Vec<u8> {
        let mut w = Writer::new();
        MessageHeader::request(command, 1).write(&mut w);
        w.put_bytes(body);
        w.finish().unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_runs_hooks_and_handler() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler(Command::Echo, Arc::new(EchoHandler));
        let hook = Arc::new(CountingHook::default());
        dispatcher.register_hook(Command::Echo, hook.clone());

        let conn = ConnectionState::new("test");
        let ctx = OpContext::background();
        let outcome = dispatcher
            .dispatch(&conn, &ctx, &raw_message(Command::Echo, b"ping"))
            .await
            .unwrap();

        let response = outcome.response.unwrap();
        assert!(!outcome.drop_connection);
        assert_eq!(&response[HEADER_SIZE..], b"ping");
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_not_supported() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionState::new("test");
        let ctx = OpContext::background();
        let outcome = dispatcher
            .dispatch(&conn, &ctx, &raw_message(Command::Echo, &[]))
            .await
            .unwrap();
        let response = outcome.response.unwrap();
        let status = u32::from_le_bytes(response[8..12].try_into().unwrap());
        assert_eq!(status, Status::NotSupported.code());
    }

    #[tokio::test]
    async fn test_drop_connection_emits_nothing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler(Command::Ioctl, Arc::new(DropHandler));
        let hook = Arc::new(CountingHook::default());
        dispatcher.register_hook(Command::Ioctl, hook.clone());

        let conn = ConnectionState::new("test");
        let ctx = OpContext::background();
        let outcome = dispatcher
            .dispatch(&conn, &ctx, &raw_message(Command::Ioctl, &[]))
            .await
            .unwrap();

        assert!(outcome.drop_connection);
        assert!(outcome.response.is_none());
        // The request was observed, but no response bytes ever existed.
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_garbage_header_is_fatal() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionState::new("test");
        let ctx = OpContext::background();
        assert!(dispatcher.dispatch(&conn, &ctx, &[0u8; 10]).await.is_err());
    }
}
