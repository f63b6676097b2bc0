pub mod crypto_state;
pub mod dispatch;
pub mod negotiate;
pub mod preauth_hash;
pub mod validate_negotiate;

pub use crypto_state::{ConnectionCryptoState, NegotiatedProperties};
pub use dispatch::{
    CommandHandler, ConnectionState, DispatchOutcome, Dispatcher, HandlerResult, MessageHook,
};
pub use negotiate::{NegotiateHandler, PreauthIngestHook};
pub use preauth_hash::{PreauthHash, PreauthHashValue};
pub use validate_negotiate::IoctlHandler;
