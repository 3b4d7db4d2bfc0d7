use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// An access token, presented as a bearer credential on outgoing requests
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A refresh token, used only to mint a new access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

limited_reveal!(RefreshTokenRef: "REFRESH TOKEN", 5);

/// A password submitted when signing in
#[braid(serde, debug = "owned", display = "owned")]
pub struct Password;

limited_reveal!(PasswordRef: "PASSWORD", 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_hidden_by_default() {
        let token = AccessTokenRef::from_static("eyJhbGciOiJIUzI1NiJ9.payload.signature");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn access_token_alternate_debug_reveals_a_prefix() {
        let token = AccessTokenRef::from_static("eyJhbGciOiJIUzI1NiJ9.payload.signature");
        assert_eq!(format!("{:#?}", token), "\"eyJhbGciOiJIUz…\"");
    }

    #[test]
    fn short_refresh_token_is_revealed_in_full_when_alternate() {
        let token = RefreshTokenRef::from_static("r1");
        assert_eq!(format!("{:#?}", token), "\"r1\"");
        assert_eq!(format!("{:#}", token), "r1");
    }

    #[test]
    fn width_bounds_the_revealed_prefix() {
        let token = RefreshTokenRef::from_static("abcdefghij");
        assert_eq!(format!("{:#4}", token), "abc…");
    }

    #[test]
    fn password_never_reveals_in_debug() {
        let password = PasswordRef::from_static("hunter2");
        assert_eq!(format!("{:?}", password), "***PASSWORD***");
        assert_eq!(format!("{:#?}", password), "\"…\"");
    }
}
