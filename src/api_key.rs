//! API key lookup and secure storage using the system keyring.
//!
//! Resolution order: `GEMINI_API_KEY`, then `API_KEY`, then the keyring entry.
//! The keyring is the OS's native secret storage:
//! - Linux: libsecret (GNOME Keyring/KDE Wallet)
//! - macOS: Keychain
//! - Windows: Credential Manager
//!
//! Never log the key value.

use keyring::Entry;

const SERVICE_NAME: &str = "voxlink";
const API_KEY_NAME: &str = "gemini-api-key";
const ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Find the API key. Returns None if it is not configured anywhere.
pub fn resolve_api_key() -> Option<String> {
    resolve_with(|name| std::env::var(name).ok(), get_stored_api_key)
}

fn resolve_with(
    env: impl Fn(&str) -> Option<String>,
    stored: impl FnOnce() -> Option<String>,
) -> Option<String> {
    for name in ENV_VARS {
        if let Some(key) = env(name).map(|k| k.trim().to_string()) {
            if !key.is_empty() {
                log::debug!("ApiKey: using {}", name);
                return Some(key);
            }
        }
    }
    stored()
}

/// Retrieve the key stored in the keyring, if any.
/// Errors are logged and treated as "not configured".
pub fn get_stored_api_key() -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, API_KEY_NAME) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("ApiKey: failed to create keyring entry: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) if key.is_empty() => None,
        Ok(key) => Some(key),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("ApiKey: failed to retrieve key: {}", e);
            None
        }
    }
}

/// Store the key in the keyring. Pass None to delete it.
pub fn set_stored_api_key(key: Option<&str>) -> Result<(), keyring::Error> {
    let entry = Entry::new(SERVICE_NAME, API_KEY_NAME)?;

    match key.map(str::trim) {
        Some(k) if !k.is_empty() => {
            entry.set_password(k)?;
            log::info!("ApiKey: stored new API key ({})", mask(k));
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("ApiKey: deleted stored API key"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(e),
        },
    }
    Ok(())
}

/// Masked form for display, e.g. "AIz...a1b2c3"
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_order() {
        let env = |name: &str| match name {
            "GEMINI_API_KEY" => Some("primary".to_string()),
            "API_KEY" => Some("fallback".to_string()),
            _ => None,
        };
        assert_eq!(resolve_with(env, || None), Some("primary".to_string()));

        let env = |name: &str| (name == "API_KEY").then(|| "fallback".to_string());
        assert_eq!(resolve_with(env, || None), Some("fallback".to_string()));
    }

    #[test]
    fn test_blank_env_falls_through_to_keyring() {
        let env = |_: &str| Some("   ".to_string());
        assert_eq!(
            resolve_with(env, || Some("stored".to_string())),
            Some("stored".to_string())
        );
        assert_eq!(resolve_with(|_: &str| None, || None), None);
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("short"), "*****");
        assert_eq!(mask("AIzaSyExampleKey123456"), "AIz...123456");
    }
}
