//! Feature gates keyed on the peer's protocol minor version.
//!
//! All gates assume major version 4.

/// Write with completion, and a server-sent access rights message (4.1).
pub fn has_write_notify(minor: u16) -> bool {
    minor >= 1
}

/// Server sends access rights explicitly (4.1). Older peers grant full access.
pub fn has_access_rights(minor: u16) -> bool {
    minor >= 1
}

/// Server confirms a claim with an explicit connect message (4.2).
/// Older peers are connected as soon as the claim is sent.
pub fn has_connect_confirmation(minor: u16) -> bool {
    minor >= 2
}

/// Claim carries the channel name for server-side resolution (4.4).
pub fn claims_by_name(minor: u16) -> bool {
    minor >= 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gates() {
        assert!(!has_write_notify(0));
        assert!(has_write_notify(1));
        assert!(!has_connect_confirmation(1));
        assert!(has_connect_confirmation(2));
        assert!(!claims_by_name(3));
        assert!(claims_by_name(4));
    }
}
