pub mod token;

pub use token::{decode_claims, Audience, TokenClaims, TokenProvider};
