//! Wire Security
//!
//! Everything that wraps a metric on its way across the network:
//! - HMAC-SHA256 signatures on each metric ([`Signer`])
//! - RSA-OAEP sealing of whole request bodies ([`Sealer`] / [`Opener`])
//! - gzip framing ([`compression`])
//! - trusted-subnet admission ([`TrustedSubnet`])
//!
//! Send order is `plaintext -> seal -> gzip`; receive order is the inverse.

pub mod compression;
pub mod envelope;
pub mod signer;
pub mod trust;

pub use compression::{compress, decompress, CompressionError};
pub use envelope::{EnvelopeError, Opener, Sealer, ENCRYPTION_HEADER, ENCRYPTION_SCHEME};
pub use signer::Signer;
pub use trust::{TrustError, TrustedSubnet, ORIGIN_HEADER};
