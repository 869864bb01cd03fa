//! Client-facing authentication.
//!
//! Clients are verified against the credentials in the configuration:
//! a cleartext password or an `md5`-prefixed hash. The md5 challenge is
//! always used when the stored secret allows it, so the cleartext never
//! travels over the wire.

pub mod scram;

use log::warn;

use crate::config::get_config;
use crate::errors::{ClientIdentifier, Error};
use crate::messages::{
    md5_challenge, md5_hash_password, md5_hash_second_pass, plain_password_challenge,
    read_password, wrong_password,
};

/// Stored secret forms we understand.
enum StoredSecret {
    Plain(String),
    Md5(String),
}

fn classify_secret(secret: &str) -> StoredSecret {
    if let Some(hash) = secret.strip_prefix("md5") {
        if hash.len() == 32 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return StoredSecret::Md5(hash.to_string());
        }
    }
    StoredSecret::Plain(secret.to_string())
}

/// Strip the trailing nul from a PasswordMessage payload.
fn password_str(payload: &[u8]) -> Result<&str, Error> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end])
        .map_err(|_| Error::AuthError("password is not valid UTF-8".into()))
}

/// Run the authentication exchange for a regular client. The stored
/// secret comes from the user entry of the database the client asked
/// for.
pub async fn authenticate_client<S, T>(
    read: &mut S,
    write: &mut T,
    client_identifier: &ClientIdentifier,
    stored_secret: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let username = &client_identifier.username;

    match classify_secret(stored_secret) {
        StoredSecret::Plain(password) => {
            let salt = md5_challenge(write).await?;
            let response = read_password(read).await?;
            let expected = md5_hash_password(username, &password, &salt);
            if response != expected {
                warn!("Invalid password for {client_identifier}");
                wrong_password(write, username).await?;
                return Err(Error::AuthError(format!(
                    "invalid password for {client_identifier}"
                )));
            }
        }
        StoredSecret::Md5(hash) => {
            let salt = md5_challenge(write).await?;
            let response = read_password(read).await?;
            let expected = md5_hash_second_pass(&hash, &salt);
            if response != expected {
                warn!("Invalid password for {client_identifier}");
                wrong_password(write, username).await?;
                return Err(Error::AuthError(format!(
                    "invalid password for {client_identifier}"
                )));
            }
        }
    }

    Ok(())
}

/// Authenticate a console client against `admin_username` /
/// `admin_password`. The admin password is compared in cleartext, so a
/// plain challenge is used.
pub async fn authenticate_admin<S, T>(
    read: &mut S,
    write: &mut T,
    client_identifier: &ClientIdentifier,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let config = get_config();
    let username = &client_identifier.username;

    if *username != config.general.admin_username {
        wrong_password(write, username).await?;
        return Err(Error::AuthError(format!(
            "unknown admin user {username:?}"
        )));
    }

    plain_password_challenge(write).await?;
    let response = read_password(read).await?;
    if password_str(&response)? != config.general.admin_password {
        warn!("Invalid admin password for {client_identifier}");
        wrong_password(write, username).await?;
        return Err(Error::AuthError(format!(
            "invalid admin password for {client_identifier}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_secrets_are_recognized() {
        match classify_secret("md50123456789abcdef0123456789abcdef") {
            StoredSecret::Md5(hash) => assert_eq!(hash.len(), 32),
            _ => panic!("expected md5 secret"),
        }
        // "md5secret" is a plain password that happens to start with md5.
        match classify_secret("md5secret") {
            StoredSecret::Plain(p) => assert_eq!(p, "md5secret"),
            _ => panic!("expected plain secret"),
        }
    }

    #[test]
    fn password_payloads_are_nul_terminated() {
        assert_eq!(password_str(b"hunter2\0").unwrap(), "hunter2");
        assert_eq!(password_str(b"hunter2").unwrap(), "hunter2");
    }
}
