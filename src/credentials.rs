//! Backend auth token lookup.
//!
//! The token comes from `SESSION_ENGINE_TOKEN` when set, otherwise from the OS's
//! native secret storage (libsecret, Keychain or Credential Manager).
//!
//! Never log the token value; use [`masked_token`] for display.

use keyring::Entry;

const SERVICE_NAME: &str = "session-engine";
const TOKEN_NAME: &str = "backend-auth-token";

pub const ENV_TOKEN: &str = "SESSION_ENGINE_TOKEN";

/// Resolve the backend auth token, if any is configured.
pub fn auth_token() -> Option<String> {
    if let Some(token) = std::env::var(ENV_TOKEN).ok().filter(|t| !t.trim().is_empty()) {
        log::debug!("Credentials: using token from {}", ENV_TOKEN);
        return Some(token.trim().to_string());
    }
    keyring_token()
}

/// Token stored in the system keyring. Errors are logged and reported as `None`.
pub fn keyring_token() -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, TOKEN_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(token) if token.is_empty() => None,
        Ok(token) => Some(token),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to retrieve token: {}", e);
            None
        }
    }
}

/// Store the token in the system keyring. `None` deletes it.
pub fn set_keyring_token(token: Option<&str>) -> Result<(), keyring::Error> {
    let entry = Entry::new(SERVICE_NAME, TOKEN_NAME)?;

    match token {
        Some(t) if !t.is_empty() => {
            entry.set_password(t)?;
            log::info!("Credentials: stored backend token");
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted backend token"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(e),
        },
    }

    Ok(())
}

/// Masked form for display, e.g. `"tok...a1b2c3"`.
pub fn masked_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

/// `Authorization` header value for a token.
pub(crate) fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}
