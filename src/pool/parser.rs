//! Proxy-list line parser
//!
//! Accepted entry forms, tried in order:
//!
//! ```text
//! user:pass@host:port
//! host:port:user:pass
//! host:port
//! host
//! ```
//!
//! Comments (`#`) and blank lines yield no entry. A `scheme://` prefix
//! is kept as written; schemeless endpoints get their scheme from the
//! loader, which knows which list file the line came from.

use super::Upstream;
use crate::{Error, Result};

/// Parse one line. `Ok(None)` means the line carries no entry.
pub fn parse_line(line: &str) -> Result<Option<Upstream>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if line.contains('@') {
        let parts: Vec<&str> = line.split('@').collect();
        if parts.len() != 2 {
            return Err(Error::parse(format!("invalid proxy entry: {}", line)));
        }

        let auth: Vec<&str> = parts[0].split(':').collect();
        if auth.len() != 2 {
            return Err(Error::parse(format!("invalid credentials in: {}", line)));
        }

        return Ok(Some(Upstream::new(
            parts[1],
            Some(auth[0].to_string()),
            Some(auth[1].to_string()),
        )));
    }

    if line.matches(':').count() == 3 {
        let parts: Vec<&str> = line.split(':').collect();
        return Ok(Some(Upstream::new(
            format!("{}:{}", parts[0], parts[1]),
            Some(parts[2].to_string()),
            Some(parts[3].to_string()),
        )));
    }

    Ok(Some(Upstream::new(line, None, None)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_and_comment_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# 10.0.0.1:3128").unwrap().is_none());
    }

    #[test]
    fn test_credentials_at_form() {
        let u = parse_line("user:pass@10.0.0.1:3128").unwrap().unwrap();
        assert_eq!(u.url, "10.0.0.1:3128");
        assert_eq!(u.username.as_deref(), Some("user"));
        assert_eq!(u.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_colon_quad_form() {
        let u = parse_line("10.0.0.1:3128:user:pass").unwrap().unwrap();
        assert_eq!(u.url, "10.0.0.1:3128");
        assert_eq!(u.username.as_deref(), Some("user"));
        assert_eq!(u.password.as_deref(), Some("pass"));
    }

    #[test]
    fn test_host_port_form() {
        let u = parse_line("proxy.example.com:8080").unwrap().unwrap();
        assert_eq!(u.url, "proxy.example.com:8080");
        assert!(!u.has_credentials());
    }

    #[test]
    fn test_bare_host_is_kept_literally() {
        let u = parse_line("proxy.example.com").unwrap().unwrap();
        assert_eq!(u.url, "proxy.example.com");
    }

    #[test]
    fn test_scheme_prefix_is_preserved() {
        let u = parse_line("socks5://10.0.0.2:1080").unwrap().unwrap();
        assert_eq!(u.url, "socks5://10.0.0.2:1080");
    }

    #[test]
    fn test_malformed_entries() {
        assert!(parse_line("a@b@c").is_err());
        assert!(parse_line("user@10.0.0.1:3128").is_err());
        assert!(parse_line("user:x:y@10.0.0.1:3128").is_err());
    }

    #[test]
    fn test_parse_is_left_inverse_of_format() {
        // Canonical textual forms round-trip through the parser.
        let cases = [
            ("10.0.0.1:3128", None, None),
            ("10.0.0.1:3128", Some("user"), Some("pass")),
        ];

        for (endpoint, user, pass) in cases {
            let formatted = match (user, pass) {
                (Some(u), Some(p)) => format!("{}:{}@{}", u, p, endpoint),
                _ => endpoint.to_string(),
            };
            let parsed = parse_line(&formatted).unwrap().unwrap();
            assert_eq!(parsed.url, endpoint);
            assert_eq!(parsed.username.as_deref(), user);
            assert_eq!(parsed.password.as_deref(), pass);
        }
    }
}
