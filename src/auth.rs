use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check: every user of every tenant shares
/// `HAVEN_PASSWORD`. pgwire compares what the client sends against it.
#[derive(Debug)]
pub struct HavenAuthSource {
    password: Vec<u8>,
}

impl HavenAuthSource {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.as_bytes().to_vec(),
        }
    }
}

#[async_trait]
impl AuthSource for HavenAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}
