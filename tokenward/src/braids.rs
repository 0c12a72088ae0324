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

/// An application identifier issued by the upstream platform
#[braid(serde)]
pub struct AppId;

/// An application secret, paired with an [`AppId`]
#[braid(serde, debug = "owned", display = "owned")]
pub struct AppSecret;

limited_reveal!(AppSecretRef: "APP SECRET", 5);

/// A short-lived bearer credential
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// The key under which a token manager stores its current token
///
/// Namespacing (for example by product and application ID) is up to the
/// caller; see [`CacheKey::namespaced()`].
#[braid(serde)]
pub struct CacheKey;

impl CacheKey {
    /// Builds a key of the form `<prefix><app_id>`
    ///
    /// ```
    /// use tokenward::{AppIdRef, CacheKey};
    ///
    /// let key = CacheKey::namespaced("miniprogram:access_token:", AppIdRef::from_static("wx123"));
    /// assert_eq!(key.as_str(), "miniprogram:access_token:wx123");
    /// ```
    pub fn namespaced(prefix: &str, app_id: &AppIdRef) -> Self {
        let mut key = String::with_capacity(prefix.len() + app_id.as_str().len());
        key.push_str(prefix);
        key.push_str(app_id.as_str());
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_hidden_by_default() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn access_token_alternate_debug_reveals_a_prefix() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
        assert_eq!(format!("{:#6?}", token), "\"abcde…\"");
    }

    #[test]
    fn short_secret_is_revealed_whole_when_asked() {
        let secret = AppSecret::from_static("abc");
        assert_eq!(format!("{:#}", secret), "abc");
        assert_eq!(format!("{}", secret), "***APP SECRET***");
    }
}
