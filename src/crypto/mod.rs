pub mod hash;
pub mod signature;

pub use signature::SignatureVerifier;
