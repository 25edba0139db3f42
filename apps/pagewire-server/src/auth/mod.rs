//! Identity, access checks and the sealing of IDs handed to peers.

pub mod crypto;
pub mod permissions;
mod principal;

pub use crypto::{IdCipher, SecurityError};
pub use permissions::{get_signin_options, has_permissions, SigninOptions};
pub use principal::{hash_user_agent, SecurityPrincipal};
