//! HTTP handlers for notify-auth.

pub mod access_tokens;
pub mod auth;
pub mod authz;
pub mod identities;
pub mod providers;

pub use access_tokens::*;
pub use auth::*;
pub use authz::*;
pub use identities::*;
pub use providers::*;
