#![forbid(unsafe_code)]
#![deny(unused_must_use)]

//! Peer-to-peer Transit file transfers for the Magic Wormhole ecosystem
//!
//! This crate speaks the Transit protocol: once two sides have completed a PAKE
//! key exchange through some encrypted side channel (usually a Wormhole) and
//! thus share a session key, Transit negotiates a TCP connection between them,
//! either directly or through a relay server. The connection is authenticated
//! with a mutual handshake derived from the session key, and then carries the
//! payload as encrypted, length-framed records with an end-to-end integrity
//! check.
//!
//! The two halves of the protocol live in two modules:
//!
//! - [`transit`] establishes the connection: ability/hint exchange, the
//!   connection race, the relay and sender/receiver handshakes, and the
//!   encrypted record channel.
//! - [`transfer`] organizes the file transfer on top: offer/answer exchange
//!   over the side channel, the streaming record pipeline with its SHA-256
//!   integrity ack, and file-vs-directory dispatch.
//!
//! The side channel itself is not part of this crate; bring your own by
//! implementing [`EncryptedConnection`]. Directory transfers additionally need
//! an [`transfer::Archiver`].

#[macro_use]
mod util;
pub mod transfer;
pub mod transit;

use std::{borrow::Cow, marker::PhantomData, ops::Deref};

use async_trait::async_trait;
use crypto_secretbox as secretbox;
use hkdf::Hkdf;
use log::*;
use sha2::Sha256;

pub use util::Cancelled;

/// Newtype wrapper for application IDs
///
/// The application ID is a string that scopes all messages to one protocol,
/// effectively separating different applications sharing one rendezvous
/// server. It also goes into the transit key derivation, so both sides must
/// use the same one.
#[derive(
    PartialEq, Eq, Clone, Debug, serde_derive::Deserialize, serde_derive::Serialize,
    derive_more::Display, derive_more::Deref,
)]
#[serde(transparent)]
#[display("{_0}")]
#[deref(forward)]
pub struct AppID(pub Cow<'static, str>);

impl AppID {
    pub fn new(id: impl Into<Cow<'static, str>>) -> Self {
        AppID(id.into())
    }
}

impl From<String> for AppID {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for AppID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Marker trait to give keys a "purpose"
// TODO Once const generics are powerful enough, simply make it a const string
pub trait KeyPurpose {}

/// The session key which the key exchange yielded
///
/// All other keys are derived from this one.
pub struct WormholeKey;
impl KeyPurpose for WormholeKey {}

/// A generic key purpose for ad-hoc subkeys or if you don't care.
pub struct GenericKey;
impl KeyPurpose for GenericKey {}

/**
 * The symmetric encryption key used to communicate with the other side.
 *
 * You don't need to do any crypto, but you might need it to derive subkeys for sub-protocols.
 */
pub struct Key<P: KeyPurpose>(Box<secretbox::Key>, PhantomData<P>);

impl<P: KeyPurpose> Clone for Key<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), PhantomData)
    }
}

impl<P: KeyPurpose> std::fmt::Debug for Key<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl<P: KeyPurpose> std::fmt::Display for Key<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl<P: KeyPurpose> Deref for Key<P> {
    type Target = secretbox::Key;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Key<WormholeKey> {
    /**
     * Derive the key used for transit
     *
     * This one is a bit special, since the transit key is tied to the app id.
     */
    pub fn derive_transit_key(&self, appid: &AppID) -> Key<transit::TransitKey> {
        let transit_purpose = format!("{}/transit-key", appid);

        let derived_key = self.derive_subkey_from_purpose(&transit_purpose);
        trace!(
            "Input key: {}, derived key: {}, transit purpose: '{}'",
            self.to_hex(),
            derived_key.to_hex(),
            &transit_purpose
        );
        derived_key
    }
}

impl<P: KeyPurpose> Key<P> {
    pub fn new(key: Box<secretbox::Key>) -> Self {
        Self(key, PhantomData)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_slice())
    }

    /**
     * Derive a new sub-key from this one, HKDF-SHA256 with the purpose string as info.
     */
    pub fn derive_subkey_from_purpose<NewP: KeyPurpose>(&self, purpose: &str) -> Key<NewP> {
        let mut key = secretbox::Key::default();
        Hkdf::<Sha256>::new(None, self.0.as_slice())
            .expand(purpose.as_bytes(), &mut key)
            /* This can only fail for output lengths over 8160 bytes */
            .unwrap();
        Key::new(Box::new(key))
    }
}

/**
 * An encrypted connection to the peer, e.g. an established Wormhole.
 *
 * The key exchange and the encryption of the messages themselves are the
 * implementor's business; this crate only sends opaque payloads over it during
 * the transit and offer negotiation, and derives all transit keys from the
 * [`shared_key`](Self::shared_key).
 */
#[async_trait]
pub trait EncryptedConnection: Send {
    /// Send an encrypted message to the peer.
    async fn send_plain(&mut self, message: Vec<u8>) -> std::io::Result<()>;

    /// Receive the next message from the peer.
    async fn receive_plain(&mut self) -> std::io::Result<Vec<u8>>;

    /// The session key that the key exchange yielded.
    fn shared_key(&self) -> &Key<WormholeKey>;
}
