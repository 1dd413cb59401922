//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! without channel binding. The functions here are stateless; the session
//! keeps the nonce, the bare first message and the expected server signature
//! between rounds.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name offered by the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// base64("n,,"): GS2 header for "no channel binding, no authzid".
const CHANNEL_BINDING: &str = "biws";

/// Random bytes in a client nonce (24 base64 characters).
pub const NONCE_LEN: usize = 18;

/// Client-first message and the pieces the session must retain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFirst {
    /// base64 client nonce
    pub nonce: String,
    /// `n=<user>,r=<nonce>`
    pub bare: String,
}

impl ClientFirst {
    /// Generate a fresh random nonce for `username`.
    pub fn new(username: &str) -> Self {
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; NONCE_LEN] = rng.gen();
        Self::with_nonce(username, &BASE64.encode(nonce_bytes))
    }

    /// Build with a known nonce.
    pub fn with_nonce(username: &str, nonce: &str) -> Self {
        Self {
            nonce: nonce.to_string(),
            bare: format!("n={},r={}", sasl_prep(username), nonce),
        }
    }

    /// Full client-first-message: `n,,n=<user>,r=<nonce>`.
    pub fn message(&self) -> Vec<u8> {
        format!("n,,{}", self.bare).into_bytes()
    }
}

/// Fields of the server-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFirst {
    /// Client nonce extended by the server
    pub nonce: String,
    /// base64 salt, as sent
    pub salt: String,
    pub iterations: u32,
}

/// Client-final message plus the signature the server must prove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinal {
    pub message: Vec<u8>,
    /// base64 ServerSignature expected in the server-final-message
    pub expected_server_signature: String,
}

/// Parse `r=...,s=...,i=...` and check the nonce extends `client_nonce`.
pub fn parse_server_first(data: &[u8], client_nonce: &str) -> Result<ServerFirst, ScramError> {
    let server_str = std::str::from_utf8(data).map_err(|_| ScramError::InvalidServerMessage)?;

    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in server_str.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(
                value
                    .trim_end_matches('\0')
                    .parse::<u32>()
                    .map_err(|_| ScramError::InvalidIterations)?,
            );
        } else if let Some(value) = part.strip_prefix("e=") {
            return Err(ScramError::Server(value.to_string()));
        }
    }

    let nonce = nonce.ok_or(ScramError::MissingNonce)?;
    // Verify nonce starts with our client nonce
    if !nonce.starts_with(client_nonce) {
        return Err(ScramError::NonceVerificationFailed {
            expected: client_nonce.to_string(),
        });
    }

    Ok(ServerFirst {
        nonce,
        salt: salt.ok_or(ScramError::MissingSalt)?,
        iterations: match iterations.ok_or(ScramError::MissingIterations)? {
            0 => return Err(ScramError::InvalidIterations),
            n => n,
        },
    })
}

/// Compute the client proof and the expected server signature.
///
/// `server_first_raw` must be the server-first-message exactly as received;
/// it is part of the signed auth message.
pub fn client_final(
    password: &str,
    client_first_bare: &str,
    server_first_raw: &[u8],
    server_first: &ServerFirst,
) -> Result<ClientFinal, ScramError> {
    let salt = BASE64
        .decode(&server_first.salt)
        .map_err(|_| ScramError::InvalidSalt)?;

    // Calculate SaltedPassword using PBKDF2
    let salted_password = hi(password, &salt, server_first.iterations)?;

    // Calculate keys
    let client_key = hmac_sha256(&salted_password, b"Client Key");
    let stored_key = sha256(&client_key);

    // Build auth message
    let client_final_without_proof = format!("c={},r={}", CHANNEL_BINDING, server_first.nonce);
    let mut auth_message = Vec::with_capacity(
        client_first_bare.len() + server_first_raw.len() + client_final_without_proof.len() + 2,
    );
    auth_message.extend_from_slice(client_first_bare.as_bytes());
    auth_message.push(b',');
    auth_message.extend_from_slice(server_first_raw);
    auth_message.push(b',');
    auth_message.extend_from_slice(client_final_without_proof.as_bytes());

    // Calculate proof
    let client_signature = hmac_sha256(&stored_key, &auth_message);
    let client_proof = xor_bytes(&client_key, &client_signature);

    let server_key = hmac_sha256(&salted_password, b"Server Key");
    let server_signature = hmac_sha256(&server_key, &auth_message);

    let message = format!(
        "{},p={}",
        client_final_without_proof,
        BASE64.encode(client_proof)
    );

    Ok(ClientFinal {
        message: message.into_bytes(),
        expected_server_signature: BASE64.encode(server_signature),
    })
}

/// Extract the signature from a server-final-message `v=<signature>`.
///
/// Bytes after the last `'='` (padding NULs some servers append) are dropped.
pub fn parse_server_final(data: &[u8]) -> Result<&[u8], ScramError> {
    if let Some(err) = data.strip_prefix(b"e=") {
        return Err(ScramError::Server(
            String::from_utf8_lossy(err).trim_end_matches('\0').to_string(),
        ));
    }

    let start = data
        .windows(2)
        .position(|w| w == b"v=")
        .map(|p| p + 2)
        .ok_or(ScramError::InvalidServerSignature)?;
    let rest = &data[start..];

    let end = match rest.iter().rposition(|&b| b == b'=') {
        Some(p) => p + 1,
        None => rest
            .iter()
            .position(|&b| b == 0 || b == b',')
            .unwrap_or(rest.len()),
    };
    if end == 0 {
        return Err(ScramError::InvalidServerSignature);
    }
    Ok(&rest[..end])
}

/// Check the server-final-message against the signature computed earlier.
pub fn verify_server_final(data: &[u8], expected: &str) -> Result<(), ScramError> {
    let signature = parse_server_final(data)?;
    if signature != expected.as_bytes() {
        return Err(ScramError::ServerSignatureVerificationFailed);
    }
    Ok(())
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Invalid SCRAM nonce or client nonce mismatch, expected: {expected}")]
    NonceVerificationFailed { expected: String },
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Server reported SCRAM error: {0}")]
    Server(String),
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidSalt)?;
    Ok(output)
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR two byte arrays
fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *out = x ^ y;
    }
    result
}

/// SASLprep normalization (simplified).
///
/// PostgreSQL ignores the SCRAM username and uses the startup user, so the
/// name is passed through, with the two characters SCRAM reserves escaped.
fn sasl_prep(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
