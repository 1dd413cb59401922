//! Login handshake state machine.
//!
//! Consumes classified Authentication requests and produces the frontend
//! responses: cleartext password, MD5 challenge response, or the two
//! SCRAM-SHA-256 rounds with server signature verification.

use bytes::BytesMut;
use tracing::debug;

use super::error::{PgError, PgResult};
use super::frontend::{
    FrontendMessage, PasswordMessage, SaslInitialResponseMessage, SaslResponseMessage,
};
use super::protocol::AuthRequest;
use super::scram::{self, ClientFirst, ScramError, SCRAM_SHA_256};

/// Where the handshake stands. Exactly one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthenticationState {
    /// Startup message not produced yet.
    #[default]
    NotStarted,
    /// Startup sent; waiting for the server's first Authentication request.
    StartupSent,
    /// Cleartext or MD5-salted password sent; waiting for AuthenticationOk.
    PasswordSent,
    /// SASLInitialResponse sent; waiting for SASLContinue.
    SaslContinueSent {
        client_nonce: String,
        client_first_message_bare: String,
    },
    /// Client proof sent; waiting for SASLFinal.
    SaslFinalPending { expected_server_signature: String },
    /// Server signature verified; waiting for AuthenticationOk.
    SaslVerified,
    Authenticated,
    Failed { reason: String },
}

impl AuthenticationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthenticationState::Authenticated | AuthenticationState::Failed { .. }
        )
    }
}

/// Drives [`AuthenticationState`] for one set of credentials.
#[derive(Debug)]
pub struct Authenticator {
    user: String,
    password: Option<String>,
    state: AuthenticationState,
}

impl Authenticator {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
            state: AuthenticationState::NotStarted,
        }
    }

    pub fn state(&self) -> &AuthenticationState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthenticationState::Authenticated
    }

    /// Record that the startup message went out.
    pub fn startup_sent(&mut self) {
        self.state = AuthenticationState::StartupSent;
    }

    /// Move to `Failed` and build the error to surface.
    pub fn fail(&mut self, reason: impl Into<String>) -> PgError {
        let reason = reason.into();
        debug!(%reason, "authentication failed");
        self.state = AuthenticationState::Failed {
            reason: reason.clone(),
        };
        PgError::Auth(reason)
    }

    fn password(&mut self) -> PgResult<String> {
        match self.password.clone() {
            Some(p) => Ok(p),
            None => Err(self.fail("Password required")),
        }
    }

    /// Advance on one Authentication request, returning the response to send.
    pub fn handle(&mut self, req: AuthRequest) -> PgResult<Option<BytesMut>> {
        if self.state.is_terminal() || self.state == AuthenticationState::NotStarted {
            return Err(PgError::Protocol(format!(
                "Authentication message in state {:?}",
                self.state
            )));
        }

        let state = std::mem::replace(&mut self.state, AuthenticationState::StartupSent);
        match (state, req) {
            (
                AuthenticationState::StartupSent
                | AuthenticationState::PasswordSent
                | AuthenticationState::SaslVerified,
                AuthRequest::Ok,
            ) => {
                debug!(user = %self.user, "authenticated");
                self.state = AuthenticationState::Authenticated;
                Ok(None)
            }

            (AuthenticationState::StartupSent, AuthRequest::CleartextPassword) => {
                let password = self.password()?;
                debug!("sending cleartext password");
                self.state = AuthenticationState::PasswordSent;
                Ok(Some(PasswordMessage { password }.encode()))
            }

            (AuthenticationState::StartupSent, AuthRequest::Md5Password { salt }) => {
                let password = self.password()?;
                debug!("answering MD5 challenge");
                self.state = AuthenticationState::PasswordSent;
                Ok(Some(
                    PasswordMessage {
                        password: md5_password(&self.user, &password, &salt),
                    }
                    .encode(),
                ))
            }

            (AuthenticationState::StartupSent, AuthRequest::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(self.fail(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                // Fail early rather than after the first round trip
                self.password()?;

                let first = ClientFirst::new(&self.user);
                debug!(mechanism = SCRAM_SHA_256, "sending SASL initial response");
                let msg = SaslInitialResponseMessage {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: first.message(),
                }
                .encode();
                self.state = AuthenticationState::SaslContinueSent {
                    client_nonce: first.nonce,
                    client_first_message_bare: first.bare,
                };
                Ok(Some(msg))
            }

            (
                AuthenticationState::SaslContinueSent {
                    client_nonce,
                    client_first_message_bare,
                },
                AuthRequest::SaslContinue { data },
            ) => {
                let password = self.password()?;
                let server_first =
                    scram::parse_server_first(&data, &client_nonce).map_err(|e| self.scram_fail(e))?;
                let fin = scram::client_final(
                    &password,
                    &client_first_message_bare,
                    &data,
                    &server_first,
                )
                .map_err(|e| self.scram_fail(e))?;

                debug!(iterations = server_first.iterations, "sending SASL client proof");
                self.state = AuthenticationState::SaslFinalPending {
                    expected_server_signature: fin.expected_server_signature,
                };
                Ok(Some(SaslResponseMessage { data: fin.message }.encode()))
            }

            (
                AuthenticationState::SaslFinalPending {
                    expected_server_signature,
                },
                AuthRequest::SaslFinal { data },
            ) => {
                scram::verify_server_final(&data, &expected_server_signature)
                    .map_err(|e| self.scram_fail(e))?;
                debug!("server signature verified");
                self.state = AuthenticationState::SaslVerified;
                Ok(None)
            }

            (AuthenticationState::SaslContinueSent { .. }, AuthRequest::SaslFinal { .. }) => {
                Err(self.fail("Client nonce is not set for SASL final message"))
            }

            (state, req) => {
                let reason = format!("Unexpected authentication request {:?} in state {:?}", req, state);
                Err(self.fail(reason))
            }
        }
    }

    fn scram_fail(&mut self, err: ScramError) -> PgError {
        self.fail(err.to_string())
    }
}

/// Compute MD5 password hash.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.into_bytes();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
