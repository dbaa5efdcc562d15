//! Cryptographic backbone of the Transit protocol
//!
//! Everything here is derived from the transit key: the handshake strings both
//! sides use to authenticate the freshly established TCP connection, and the
//! record encryption. Records are XSalsa20-Poly1305 "Secretbox" with a counter
//! nonce; the nonce is kept in its little-endian wire form to interoperate
//! with the reference Python implementation.

use super::{TransitError, TransitKey};
use crate::{GenericKey, Key};
use crypto_secretbox as secretbox;
use secretbox::aead::{Aead, KeyInit};

/// Encrypt one record, prepending the nonce in little-endian byte order.
pub(super) fn encrypt_record(
    key: &secretbox::Key,
    nonce: &secretbox::Nonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, TransitError> {
    let cipher = secretbox::XSalsa20Poly1305::new(key);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| TransitError::Crypto)?;

    let mut record = Vec::with_capacity(secretbox::XSalsa20Poly1305::NONCE_SIZE + ciphertext.len());
    record.extend_from_slice(nonce.as_slice());
    record.extend_from_slice(&ciphertext);
    Ok(record)
}

/// Split the nonce off a received record and open the box. The nonce order
/// check is the caller's business.
pub(super) fn decrypt_record(
    key: &secretbox::Key,
    record: &[u8],
) -> Result<Box<[u8]>, TransitError> {
    use std::io::{Error, ErrorKind};
    ensure!(
        record.len() >= secretbox::XSalsa20Poly1305::NONCE_SIZE,
        Error::new(
            ErrorKind::InvalidData,
            "Record must be long enough to contain at least the nonce"
        )
    );

    let (nonce, ciphertext) = record.split_at(secretbox::XSalsa20Poly1305::NONCE_SIZE);
    let cipher = secretbox::XSalsa20Poly1305::new(key);
    let plaintext = cipher
        .decrypt(secretbox::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TransitError::Crypto)?;
    Ok(plaintext.into_boxed_slice())
}

pub(super) fn build_sender_handshake(key: &Key<TransitKey>) -> String {
    format!(
        "transit sender {} ready\n\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_sender")
            .to_hex()
    )
}

pub(super) fn build_receiver_handshake(key: &Key<TransitKey>) -> String {
    format!(
        "transit receiver {} ready\n\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_receiver")
            .to_hex()
    )
}

pub(super) fn build_relay_handshake(key: &Key<TransitKey>, side: &str) -> String {
    format!(
        "please relay {} for side {}\n",
        key.derive_subkey_from_purpose::<GenericKey>("transit_relay")
            .to_hex(),
        side
    )
}
