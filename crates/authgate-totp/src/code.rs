/// Joins command arguments into a single code and checks its shape.
///
/// Players type codes the way their app displays them, so
/// `/2fa 123 456` arrives as `["123", "456"]`. The parts are
/// concatenated, any whitespace dropped, and the result accepted only if
/// it is exactly `digits` ASCII digits.
///
/// ```rust
/// use authgate_totp::normalize_code;
///
/// assert_eq!(normalize_code(["123", "456"], 6).as_deref(), Some("123456"));
/// assert_eq!(normalize_code([" 12 34 56 "], 6).as_deref(), Some("123456"));
/// assert_eq!(normalize_code(["12345"], 6), None);
/// assert_eq!(normalize_code(["12345x"], 6), None);
/// ```
pub fn normalize_code<I, S>(parts: I, digits: u32) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let code: String = parts
        .into_iter()
        .flat_map(|part| {
            part.as_ref()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<Vec<_>>()
        })
        .collect();

    (code.len() == digits as usize && code.bytes().all(|b| b.is_ascii_digit())).then_some(code)
}
