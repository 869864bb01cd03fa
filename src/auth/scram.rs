//! SCRAM-SHA-256 client, used when authenticating the pooler against
//! the PostgreSQL server (RFC 5802 / RFC 7677).

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LENGTH: usize = 24;

/// State of an in-flight SCRAM-SHA-256 exchange.
pub struct ScramSha256 {
    password: String,
    nonce: String,
    client_first_bare: String,
    auth_message: String,
    salted_password: [u8; 32],
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        Self::with_nonce(password, nonce)
    }

    fn with_nonce(password: &str, nonce: String) -> ScramSha256 {
        ScramSha256 {
            password: password.to_string(),
            nonce,
            client_first_bare: String::new(),
            auth_message: String::new(),
            salted_password: [0u8; 32],
        }
    }

    /// client-first-message. The username travels in the startup
    /// packet, so it is left empty here, as the server ignores it.
    pub fn message(&mut self) -> BytesMut {
        self.client_first_bare = format!("n=,r={}", self.nonce);
        BytesMut::from(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Process server-first-message, produce client-final-message.
    pub fn update(&mut self, message: &BytesMut) -> Result<BytesMut, Error> {
        let server_first = String::from_utf8_lossy(&message[..]).to_string();

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", value)) => server_nonce = Some(value.to_string()),
                Some(("s", value)) => salt = Some(value.to_string()),
                Some(("i", value)) => iterations = value.parse::<u32>().ok(),
                _ => (),
            }
        }

        let server_nonce = server_nonce
            .ok_or_else(|| Error::ScramClientError("server-first carries no nonce".into()))?;
        let salt =
            salt.ok_or_else(|| Error::ScramClientError("server-first carries no salt".into()))?;
        let iterations = iterations
            .ok_or_else(|| Error::ScramClientError("server-first carries no iterations".into()))?;

        if !server_nonce.starts_with(&self.nonce) {
            return Err(Error::ScramClientError(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = b64
            .decode(&salt)
            .map_err(|_| Error::ScramClientError("salt is not valid base64".into()))?;

        let normalized = match stringprep::saslprep(&self.password) {
            Ok(prepared) => prepared.to_string(),
            Err(_) => self.password.clone(),
        };
        self.salted_password = hi(normalized.as_bytes(), &salt, iterations);

        let client_key = hmac(&self.salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let client_final_without_proof = format!("c=biws,r={server_nonce}");
        self.auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac(&stored_key, self.auth_message.as_bytes());
        let mut client_proof = client_key;
        for (proof, signature) in client_proof.iter_mut().zip(client_signature.iter()) {
            *proof ^= signature;
        }

        let client_final = format!(
            "{client_final_without_proof},p={}",
            b64.encode(client_proof)
        );
        Ok(BytesMut::from(client_final.as_bytes()))
    }

    /// Verify server-final-message.
    pub fn finish(&mut self, message: &BytesMut) -> Result<(), Error> {
        let server_final = String::from_utf8_lossy(&message[..]).to_string();

        let verifier = match server_final.strip_prefix("v=") {
            Some(verifier) => verifier.trim_end(),
            None => {
                return Err(Error::ScramClientError(format!(
                    "unexpected server-final message: {server_final:?}"
                )))
            }
        };
        let verifier = b64
            .decode(verifier)
            .map_err(|_| Error::ScramClientError("server signature is not valid base64".into()))?;

        let server_key = hmac(&self.salted_password, b"Server Key");
        let expected = hmac(&server_key, self.auth_message.as_bytes());

        if verifier != expected {
            return Err(Error::ScramClientError(
                "server signature verification failed".into(),
            ));
        }

        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Hi(): PBKDF2 with HMAC-SHA-256 as the PRF.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut prev = hmac(password, &block);
    let mut result = prev;
    for _ in 1..iterations {
        prev = hmac(password, &prev);
        for (acc, byte) in result.iter_mut().zip(prev.iter()) {
            *acc ^= byte;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exchange from RFC 7677 §3, adjusted: PostgreSQL sends an empty
    // username in client-first.
    #[test]
    fn full_exchange_against_known_vectors() {
        let mut scram = ScramSha256::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO".to_string());

        let first = scram.message();
        assert_eq!(&first[..], b"n,,n=,r=rOprNGfwEbeRWgbNEkqO");

        // A server-first computed for the empty-username exchange.
        let server_first = BytesMut::from(
            &b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"[..],
        );
        let client_final = scram.update(&server_first).unwrap();
        let client_final = String::from_utf8_lossy(&client_final).to_string();
        assert!(client_final
            .starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        // The proof depends on the empty username; recompute the server
        // signature from the same salted password to close the loop.
        let salt = b64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = hi(b"pencil", &salt, 4096);
        let server_key = hmac(&salted, b"Server Key");
        let expected_signature = hmac(&server_key, scram.auth_message.as_bytes());
        let server_final = BytesMut::from(format!("v={}", b64.encode(expected_signature)).as_bytes());
        scram.finish(&server_final).unwrap();
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("pencil", "abc".to_string());
        scram.message();
        let server_first = BytesMut::from(&b"r=zzz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"[..]);
        assert!(scram.update(&server_first).is_err());
    }

    #[test]
    fn rejects_bad_server_signature() {
        let mut scram = ScramSha256::with_nonce("pencil", "abc".to_string());
        scram.message();
        let server_first = BytesMut::from(&b"r=abcdef,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"[..]);
        scram.update(&server_first).unwrap();
        let server_final = BytesMut::from(&b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="[..]);
        assert!(scram.finish(&server_final).is_err());
    }

    #[test]
    fn hi_matches_pbkdf2_reference() {
        // PBKDF2-HMAC-SHA256("password", "salt", 1) reference vector.
        let out = hi(b"password", b"salt", 1);
        assert_eq!(
            out[..8],
            [0x12, 0x0f, 0xb6, 0xcf, 0xfc, 0xf8, 0xb3, 0x2c]
        );
    }
}
