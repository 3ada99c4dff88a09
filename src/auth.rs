use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// One shared secret for the whole server. Every property authenticates
/// with the same cleartext password over the startup flow; run behind TLS
/// when the listener is reachable from outside.
pub struct StaydAuthSource {
    secret: Vec<u8>,
}

impl StaydAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            secret: password.into_bytes(),
        }
    }
}

impl std::fmt::Debug for StaydAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaydAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for StaydAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(
            user = login.user().unwrap_or("<none>"),
            property = login.database().unwrap_or("default"),
            "startup password check"
        );
        Ok(Password::new(None, self.secret.clone()))
    }
}
