pub mod auth;

pub use auth::{AdminAccount, AuthenticatedAccount, Claims, Identity, JwtAuth};
