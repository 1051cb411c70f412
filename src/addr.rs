/// Port appended to targets that do not carry one
pub const DEFAULT_PORT: u16 = 80;

/// Ensure `addr` carries an explicit port.
///
/// An address counts as having a port when it ends in `:` followed by one or
/// more ASCII digits; anything else gets `:80` appended. Bracketed IPv6
/// literals such as `[::1]` therefore become `[::1]:80`, while a bare `::1`
/// is left alone because its last group already looks like a port.
pub fn host_and_port(addr: &str) -> String {
    if has_port(addr) {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Strip `user:pass@` from an authority string
pub fn strip_userinfo(authority: &str) -> &str {
    match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_default_port_when_missing() {
        assert_eq!(host_and_port("example.com"), "example.com:80");
        assert_eq!(host_and_port("10.0.0.1"), "10.0.0.1:80");
        assert_eq!(host_and_port("[::1]"), "[::1]:80");
        assert_eq!(host_and_port(""), ":80");
    }

    #[test]
    fn keeps_explicit_numeric_port() {
        for addr in ["example.com:443", "localhost:8080", "[::1]:3128", "h:0"] {
            assert_eq!(host_and_port(addr), addr);
        }
    }

    #[test]
    fn non_numeric_suffix_is_not_a_port() {
        assert_eq!(host_and_port("example.com:"), "example.com::80");
        assert_eq!(host_and_port("example.com:https"), "example.com:https:80");
    }

    #[test]
    fn userinfo_is_removed() {
        assert_eq!(strip_userinfo("user:pw@proxy.local:3128"), "proxy.local:3128");
        assert_eq!(strip_userinfo("proxy.local"), "proxy.local");
    }
}
