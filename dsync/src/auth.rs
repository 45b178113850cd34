use common::TransferError;
use rand::RngCore;

const GENERATED_TOKEN_BYTES: usize = 24;

/// Checks the token presented by a client when it opens a session or lists a directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Authenticator {
    /// The server runs without a token; clients must not send one.
    #[default]
    NoAuth,
    Token(String),
}

impl Authenticator {
    pub fn authenticate(&self, token: Option<&str>) -> Result<(), TransferError> {
        match (self, token) {
            (Authenticator::NoAuth, None) => Ok(()),
            (Authenticator::NoAuth, Some(_)) => Err(TransferError::Authentication(
                "expecting no token, but got one".to_string(),
            )),
            (Authenticator::Token(_), None) => Err(TransferError::Authentication(
                "missing auth token".to_string(),
            )),
            (Authenticator::Token(expected), Some(token)) if expected == token => Ok(()),
            (Authenticator::Token(_), Some(_)) => Err(TransferError::Authentication(
                "invalid auth token".to_string(),
            )),
        }
    }
}

/// Random hex token for `dsyncd --generate-auth`.
#[must_use]
pub fn generate_token() -> String {
    let mut token = [0u8; GENERATED_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut token);
    hex::encode(token)
}
