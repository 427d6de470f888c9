//! Logout: ending an SSO session locally and at every remote party.

pub mod coordinator;
pub mod http;
pub mod types;

pub use coordinator::{LogoutCoordinator, RemoteLogout, TGT_STORE_TARGET};
pub use http::HttpRemoteLogout;
pub use types::{AuthorityKind, LogoutOutcome, LogoutReport, LogoutStep, LogoutTrigger, StepStatus};
