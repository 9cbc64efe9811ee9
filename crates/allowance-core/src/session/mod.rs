//! Anti-forgery session token handling.

mod manager;
mod token;

pub use manager::{parse_token, SessionSettings, SessionTokenManager};
pub use token::{SessionToken, TokenCache};
