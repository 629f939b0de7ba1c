pub mod password;
pub mod service;
pub mod token;

pub use password::PasswordHasher;
pub use service::{AuthError, AuthResponse, MockAuth, Session, User, UserAttributes};
pub use token::{AccessClaims, TokenError, TokenSigner};
