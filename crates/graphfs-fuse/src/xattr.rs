//! Extended-attribute surface
//!
//! Two attributes are exposed per entry: the derived file status
//! (read-only) and the pin directive (read-write). Everything else in the
//! `user.graphfs.` namespace is rejected, with a one-time warning so a
//! misconfigured integration does not flood the log.

use std::sync::Once;

use graphfs_core::domain::PinMode;

/// Read-only derived status: `cloud`, `downloading`, `local`, ...
pub const STATUS_XATTR: &str = "user.graphfs.status";

/// Read-write pin directive: `never`, `auto`, `always`.
pub const PIN_XATTR: &str = "user.graphfs.pin";

static UNSUPPORTED_WARNING: Once = Once::new();

/// The attribute names every entry lists.
pub fn attribute_names() -> Vec<&'static str> {
    vec![STATUS_XATTR, PIN_XATTR]
}

/// The `listxattr` payload: NUL-terminated name list.
pub fn name_list() -> Vec<u8> {
    let mut out = Vec::new();
    for name in attribute_names() {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

/// Parse a pin directive value from a `setxattr` payload.
pub fn parse_pin_value(value: &[u8]) -> Option<PinMode> {
    match std::str::from_utf8(value).ok()?.trim() {
        "never" => Some(PinMode::Never),
        "auto" => Some(PinMode::Auto),
        "always" => Some(PinMode::Always),
        _ => None,
    }
}

/// Render a pin mode as its xattr value.
pub fn pin_value(mode: PinMode) -> &'static [u8] {
    match mode {
        PinMode::Never => b"never",
        PinMode::Auto => b"auto",
        PinMode::Always => b"always",
    }
}

/// Log once that an attribute outside the supported set was used.
pub fn warn_unsupported(name: &str) {
    UNSUPPORTED_WARNING.call_once(|| {
        tracing::warn!(
            attribute = name,
            "unsupported extended attribute requested; further occurrences will not be logged"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_list_is_nul_separated() {
        let list = name_list();
        let parts: Vec<&[u8]> = list.split(|b| *b == 0).filter(|p| !p.is_empty()).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], STATUS_XATTR.as_bytes());
    }

    #[test]
    fn test_pin_value_roundtrip() {
        for mode in [PinMode::Never, PinMode::Auto, PinMode::Always] {
            assert_eq!(parse_pin_value(pin_value(mode)), Some(mode));
        }
        assert_eq!(parse_pin_value(b"bogus"), None);
        assert_eq!(parse_pin_value(b" always\n"), Some(PinMode::Always));
    }
}
