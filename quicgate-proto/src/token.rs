//! Stateless reset tokens.
//!
//! A reset token is the first 16 bytes of HMAC-SHA256 over the connection id,
//! keyed with a per-deployment secret. Any instance holding the secret can
//! recognize (and emit) resets for connections it has no state for.

use std::fmt;
use std::ops::Deref;

use rand::RngCore;
use ring::hmac;

use crate::{ConnectionId, RESET_TOKEN_SIZE};

/// Length of the HMAC key shared by all instances of a deployment.
pub const STATELESS_RESET_SECRET_LEN: usize = 32;

/// Read-only after construction; set once in transport settings.
#[derive(Clone)]
pub struct StatelessResetSecret([u8; STATELESS_RESET_SECRET_LEN]);

impl StatelessResetSecret {
    pub fn new(bytes: [u8; STATELESS_RESET_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random secret; suitable when resets only need to be recognized
    /// within a single process lifetime.
    pub fn random() -> Self {
        let mut bytes = [0; STATELESS_RESET_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for StatelessResetSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        f.write_str("StatelessResetSecret(..)")
    }
}

/// Used for an endpoint to securely communicate that it has lost state for a
/// connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StatelessResetToken([u8; RESET_TOKEN_SIZE]);

impl StatelessResetToken {
    pub fn new(secret: &StatelessResetSecret, cid: &ConnectionId) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &secret.0);
        let tag = hmac::sign(&key, cid);
        let mut token = [0; RESET_TOKEN_SIZE];
        token.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_SIZE]);
        Self(token)
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for StatelessResetToken {
    fn from(bytes: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Deref for StatelessResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for StatelessResetToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
