use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Cleartext password shared by every operator database on this server.
#[derive(Debug)]
pub struct TourDeskAuthSource {
    password: String,
}

impl TourDeskAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TourDeskAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(
            user = login.user().unwrap_or_default(),
            database = login.database().unwrap_or_default(),
            "password login"
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
