//! SASL mechanism encodings for relay authentication.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;

/// Relay authentication mechanisms, in the order the originator prefers
/// them when asked to pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
    CramMd5,
}

impl AuthMechanism {
    /// The token advertised in the EHLO AUTH keyword.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Initial response for `AUTH PLAIN`: base64 of `\0authcid\0password`.
#[must_use]
pub fn plain_initial_response(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{username}\0{password}"))
}

/// `AUTH LOGIN` username line.
#[must_use]
pub fn login_username(username: &str) -> String {
    BASE64.encode(username)
}

/// `AUTH LOGIN` password line.
#[must_use]
pub fn login_password(password: &str) -> String {
    BASE64.encode(password)
}

/// Response to a CRAM-MD5 challenge: base64 of
/// `username SP hex(hmac-md5(password, challenge))`.
///
/// `challenge_b64` is the base64 payload of the server's 334 reply.
pub fn cram_md5_response(
    username: &str,
    password: &str,
    challenge_b64: &str,
) -> Result<String, String> {
    let challenge = BASE64
        .decode(challenge_b64.trim())
        .map_err(|e| format!("invalid CRAM-MD5 challenge: {e}"))?;

    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|e| format!("invalid CRAM-MD5 key: {e}"))?;
    mac.update(&challenge);
    let digest = mac.finalize().into_bytes();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }

    Ok(BASE64.encode(format!("{username} {hex}")))
}
