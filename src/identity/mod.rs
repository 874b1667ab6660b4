//! Identity, privileged sessions and the authorization gate.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod token;
mod session;
mod policy;
mod provider;
mod adapters;
mod request_context;
mod authorizer;

pub use principal::{Principal, PrivilegeLevel, Role};
pub use token::{decode_untrusted, IssuedToken, TokenCodec, TokenError, TokenKind, UntrustedClaims, VerifiedToken};
pub use session::{spawn_sweeper, SessionRecord, SessionRegistry, SessionStatus, SweeperHandle};
pub use policy::{AccessDecision, CourseFacts, LessonFacts, ResourceFactSource, ResourcePolicy, ResourceRef};
pub use provider::{
    hash_password, verify_password, DirectoryUser, DisplayProfile, LoginRequest, LoginResponse, LoginService,
    UserDirectory, BREAK_GLASS_PRINCIPAL,
};
pub use adapters::{MemoryCourseCatalog, MemoryUserDirectory};
pub use request_context::{bearer_token, RequestContext};
pub use authorizer::{require_role, AuthorizationGate, Guard};
