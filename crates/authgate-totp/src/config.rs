use serde::{Deserialize, Serialize};

/// TOTP parameters. Defaults match what every authenticator app assumes
/// when a provisioning URI leaves them out: 6 digits, 30 second steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpConfig {
    /// Code length, 6 to 8.
    pub digits: u32,

    /// Seconds per time step.
    pub step_secs: u64,

    /// Steps accepted either side of the current one. Anything above 1
    /// is clamped to 1: a code is never valid for more than three windows.
    pub skew_steps: u64,

    /// Shown by the authenticator app next to the account name.
    pub issuer: String,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            digits: 6,
            step_secs: 30,
            skew_steps: 1,
            issuer: "Authgate".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_fills_defaults() {
        let config: TotpConfig = serde_json::from_str(r#"{ "digits": 8 }"#).unwrap();
        assert_eq!(config.digits, 8);
        assert_eq!(config.step_secs, 30);
        assert_eq!(config.skew_steps, 1);
        assert_eq!(config.issuer, "Authgate");
    }
}
