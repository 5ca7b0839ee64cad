pub mod asymmetric;

pub use asymmetric::{Curve, KeyPair, KeyType, new_key};

/// PEM labels of private keys we know how to read.
pub const PRIVATE_KEY_TAGS: [&str; 3] = ["PRIVATE KEY", "EC PRIVATE KEY", "RSA PRIVATE KEY"];
