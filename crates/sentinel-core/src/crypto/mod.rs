//! Key pair and authenticated box encryption
//!
//! Pure, stateless primitives used by the runtime's crypto engine. Nothing in
//! this module performs I/O or holds connection state.

pub mod keys;
pub mod sealed_box;

pub use keys::{KeyPair, PublicKey, PUBLIC_KEY_LEN};
pub use sealed_box::{open, seal, BoxNonce, SealedPayload, NONCE_LEN};
