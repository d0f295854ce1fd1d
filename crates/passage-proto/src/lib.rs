//! Wire protocol for the passage control channel: message set, framed codec,
//! and the shared-token authentication scheme.

pub mod auth;
pub mod codec;
pub mod msg;
pub mod version;

pub use auth::{privilege_key, verify_privilege_key, AuthError};
pub use codec::{
    decode, encode, read_message, read_message_with_limit, write_message, CodecError,
    DEFAULT_MAX_BODY_SIZE,
};
pub use msg::*;
