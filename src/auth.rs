use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every login. The user name only selects the
/// principal; see `wire::ParkdHandler`.
#[derive(Debug)]
pub struct ParkdAuthSource {
    password: String,
}

impl ParkdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ParkdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
