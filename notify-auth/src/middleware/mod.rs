pub mod auth;
pub mod scope_auth;

pub use auth::{auth_middleware, classify_credential, AuthContext, AuthUser, Credential};
pub use scope_auth::{
    require_unrestricted, DeferToOwningService, Grant, RequiredScope, ResourceOwnership,
    ScopeAuthorizer,
};
