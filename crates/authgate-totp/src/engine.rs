//! TOTP computation and verification on top of `totp-rs`.

use std::time::{SystemTime, UNIX_EPOCH};

use subtle::{Choice, ConstantTimeEq};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::{TotpConfig, TotpError};

/// Account label used when a code is only generated or checked, never
/// shown to anyone.
const CHECK_LABEL: &str = "player";

/// Seconds since the Unix epoch, or 0 if the clock is set before 1970.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A validated TOTP configuration that can generate and check codes.
#[derive(Debug, Clone)]
pub struct Totp {
    config: TotpConfig,
}

impl Totp {
    /// # Errors
    /// - [`TotpError::InvalidDigits`] unless `digits` is 6, 7 or 8.
    /// - [`TotpError::InvalidStep`] if `step_secs` is zero.
    /// - [`TotpError::InvalidLabel`] if the issuer contains a `:`.
    pub fn new(mut config: TotpConfig) -> Result<Self, TotpError> {
        if !(6..=8).contains(&config.digits) {
            return Err(TotpError::InvalidDigits(config.digits));
        }
        if config.step_secs == 0 {
            return Err(TotpError::InvalidStep);
        }
        if config.issuer.contains(':') {
            return Err(TotpError::InvalidLabel(config.issuer));
        }
        if config.skew_steps > 1 {
            tracing::warn!(
                requested = config.skew_steps,
                "clamping TOTP skew to one step"
            );
            config.skew_steps = 1;
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// A fresh 160-bit secret, base32 encoded without padding (32 chars).
    pub fn generate_secret() -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    /// The time step containing `unix_secs`.
    pub fn step_at(&self, unix_secs: u64) -> u64 {
        unix_secs / self.config.step_secs
    }

    /// The code for the window containing `unix_secs`.
    pub fn generate(&self, secret: &str, unix_secs: u64) -> Result<String, TotpError> {
        Ok(self.build(secret, CHECK_LABEL)?.generate(unix_secs))
    }

    /// Checks `code` against the previous, current and next window.
    ///
    /// Returns the matched step on success so the caller can feed it to
    /// a [`ReplayCache`](crate::ReplayCache), or `Ok(None)` for a wrong
    /// code. A code of the wrong length or with non-digits is rejected
    /// before any HMAC is computed.
    ///
    /// All candidate windows are evaluated even after a match, and the
    /// comparison itself is constant time.
    ///
    /// # Errors
    /// [`TotpError::InvalidSecret`] if the stored secret can't be decoded.
    pub fn verify(
        &self,
        secret: &str,
        code: &str,
        unix_secs: u64,
    ) -> Result<Option<u64>, TotpError> {
        let totp = self.build(secret, CHECK_LABEL)?;
        if code.len() != self.config.digits as usize
            || !code.bytes().all(|b| b.is_ascii_digit())
        {
            return Ok(None);
        }

        let current = self.step_at(unix_secs);
        let skew = self.config.skew_steps;
        let mut matched = None;
        let mut any = Choice::from(0);

        for step in current.saturating_sub(skew)..=current.saturating_add(skew) {
            let expected = totp.generate(step.saturating_mul(self.config.step_secs));
            let hit = expected.as_bytes().ct_eq(code.as_bytes());
            if bool::from(hit) && matched.is_none() {
                matched = Some(step);
            }
            any |= hit;
        }

        Ok(if bool::from(any) { matched } else { None })
    }

    /// An `otpauth://` URI an authenticator app can import (usually via QR).
    ///
    /// # Errors
    /// [`TotpError::InvalidSecret`] for an unusable secret,
    /// [`TotpError::InvalidLabel`] if `account` contains a `:`.
    pub fn provisioning_uri(&self, secret: &str, account: &str) -> Result<String, TotpError> {
        if account.contains(':') {
            return Err(TotpError::InvalidLabel(account.to_string()));
        }
        Ok(self.build(secret, account)?.get_url())
    }

    fn build(&self, secret: &str, account: &str) -> Result<TOTP, TotpError> {
        let key = Secret::Encoded(normalize_secret(secret))
            .to_bytes()
            .map_err(|_| TotpError::InvalidSecret)?;
        // Digits, step and labels are checked in `new`, so what's left to
        // fail here is the key itself (shorter than 128 bits).
        TOTP::new(
            Algorithm::SHA1,
            self.config.digits as usize,
            self.config.skew_steps as u8,
            self.config.step_secs,
            key,
            Some(self.config.issuer.clone()),
            account.to_string(),
        )
        .map_err(|_| TotpError::InvalidSecret)
    }
}

/// Uppercases and strips spaces, dashes and padding, the forms users
/// tend to paste secrets in.
fn normalize_secret(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// =========================================================================
// Tests
// =========================================================================
