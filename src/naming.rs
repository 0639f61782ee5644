// Naming Module - Stored File Names
// =======================================================
// An encrypted attachment is stored as `<iv hex>-<sanitized name>.enc`.
// The 32-character IV prefix has a fixed width so it is sliced off by
// position. Whatever follows it, up to the suffix, is the logical name of
// the decrypted file, separator included. Any name that does not fit this
// pattern belongs to a legacy plaintext file.

use crate::crypto::{Iv, IV_HEX_LEN};

/// Suffix marking an encrypted file.
pub const ENCRYPTED_SUFFIX: &str = ".enc";
/// Separator between the IV prefix and the logical name.
pub const SEPARATOR: char = '-';

/// Reduce a user-supplied file name to something safe to put on disk.
///
/// Directory components are dropped and every character outside
/// `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize(original_name: &str) -> String {
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Build the on-disk name for a file encrypted with `iv`.
pub fn encrypted_name(iv: &Iv, original_name: &str) -> String {
    format!(
        "{}{SEPARATOR}{}{ENCRYPTED_SUFFIX}",
        iv.to_hex(),
        sanitize(original_name)
    )
}

/// Components recovered from an encrypted file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub iv: Iv,
    /// Name of the decrypted file: the stored name without the IV prefix
    /// and the suffix. The separator is kept, so `<iv>-plan.pdf.enc` and a
    /// legacy `plan.pdf` never map to the same name.
    pub logical_name: String,
}

/// Split an encrypted file name into IV and logical name.
///
/// Returns `None` for legacy names, which must be served as they are.
pub fn parse_encrypted(name: &str) -> Option<ParsedName> {
    let stem = name.strip_suffix(ENCRYPTED_SUFFIX)?;
    if name.len() <= IV_HEX_LEN {
        return None;
    }
    let iv = Iv::from_hex(stem.get(..IV_HEX_LEN)?)?;
    let rest = stem.get(IV_HEX_LEN..)?;
    let logical_name = if rest.is_empty() {
        iv.to_hex()
    } else {
        rest.to_string()
    };
    Some(ParsedName { iv, logical_name })
}

impl ParsedName {
    /// Logical name without the leading separator, for a file written on
    /// its own rather than next to other scan output.
    pub fn bare_name(&self) -> &str {
        self.logical_name
            .strip_prefix(SEPARATOR)
            .filter(|rest| !rest.is_empty())
            .unwrap_or(self.logical_name.as_str())
    }
}

/// Whether `name` follows the encrypted naming pattern.
pub fn is_encrypted_name(name: &str) -> bool {
    parse_encrypted(name).is_some()
}
