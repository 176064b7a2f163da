//! HTTP Basic credentials for DESCRIBE and SETUP (RFC 2326 §12.5, RFC 7617).

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// Realm advertised in the `WWW-Authenticate` challenge.
pub const REALM: &str = "hls2rtsp";

/// The single username/password pair clients must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Check an `Authorization` header value.
    ///
    /// Accepts only the `Basic` scheme (case-insensitive) with a base64
    /// `user:password` payload matching these credentials exactly.
    pub fn verify(&self, authorization: Option<&str>) -> bool {
        let Some(value) = authorization else {
            return false;
        };
        let Some((scheme, encoded)) = value.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("Basic") {
            return false;
        }

        let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };

        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }

    /// `Authorization` header value a client would send.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(raw))
    }
}

/// `WWW-Authenticate` challenge sent with 401 responses.
pub fn challenge() -> String {
    format!("Basic realm=\"{}\"", REALM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_credentials() {
        let creds = Credentials::new("user", "pass");
        assert!(creds.verify(Some("Basic dXNlcjpwYXNz")));
        assert!(creds.verify(Some(&creds.header_value())));
        assert!(creds.verify(Some("basic dXNlcjpwYXNz")));
    }

    #[test]
    fn password_may_contain_colon() {
        let creds = Credentials::new("user", "p:ss");
        assert!(creds.verify(Some(&creds.header_value())));
    }

    #[test]
    fn rejects_missing_or_wrong_credentials() {
        let creds = Credentials::new("user", "pass");
        assert!(!creds.verify(None));
        assert!(!creds.verify(Some("Basic !!!notbase64")));
        assert!(!creds.verify(Some("Digest username=\"user\"")));
        assert!(!creds.verify(Some(&Credentials::new("user", "nope").header_value())));
        // "userpass" without separator
        assert!(!creds.verify(Some("Basic dXNlcnBhc3M=")));
    }

    #[test]
    fn challenge_names_realm() {
        assert_eq!(challenge(), "Basic realm=\"hls2rtsp\"");
    }
}
