//! OAuth 2.0 client side of the bridge
//!
//! Holds the credential used against the resource server and keeps it
//! fresh:
//! - Authorization-code exchange (the code is obtained out of band)
//! - Refresh-token grant with single-use, rotated refresh tokens
//! - Single-flight refresh shared by all concurrent callers
//! - Atomic on-disk persistence of the current credential

mod credential;
mod endpoint;
mod manager;
mod storage;

pub use credential::{AuthorizationGrant, Credential, parse_scope};
pub use endpoint::{ClientAuthMethod, TokenEndpoint, TokenGrant, TokenResponse};
pub use manager::{CredentialStatus, OAuthTokenManager};
pub use storage::TokenStore;
