/// Errors from building a [`Totp`](crate::Totp) or reading a secret.
///
/// A wrong code is not an error; [`Totp::verify`](crate::Totp::verify)
/// returns `Ok(None)` for it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    /// The stored secret isn't valid base32 or is shorter than 128 bits.
    #[error("secret is not valid base32 or is shorter than 128 bits")]
    InvalidSecret,

    /// Digit counts outside 6..=8 are not supported by authenticator apps.
    #[error("unsupported digit count {0}, expected 6 to 8")]
    InvalidDigits(u32),

    /// Issuer or account names end up in an `issuer:account` label, so
    /// they can't contain a colon.
    #[error("label {0:?} must not contain ':'")]
    InvalidLabel(String),

    /// A zero-length time step.
    #[error("time step must be at least one second")]
    InvalidStep,
}
