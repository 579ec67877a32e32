//! cTrader upstream session.
//!
//! Speaks the Open API message set over a TLS TCP stream framed by
//! 4-byte length prefixes (fangate-codec). Payloads are JSON envelopes
//! of `{ payloadType, clientMsgId?, payload }`.

pub mod error;
pub mod session;
pub mod wire;

pub use error::{CtraderError, CtraderResult};
pub use session::{CtraderConfig, CtraderSession};
