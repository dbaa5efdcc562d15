//! Connect two sides via TCP, no matter where they are
//!
//! This protocol is the second part where the Wormhole magic happens. It does
//! not strictly require a Wormhole connection, but it depends on some kind of
//! secure communication channel to talk to the other side. Conveniently,
//! Wormhole provides exactly such a thing :)
//!
//! Both clients exchange messages containing hints on how to find each other.
//! These may be local IP addresses for in case they are in the same network,
//! or the address of a relay server. Every reachable hint is attempted in
//! parallel, and the first connection to complete the authentication handshake
//! is elected; the sender confirms the election with a `go` message and turns
//! every other contender away with a `nevermind`.
//!
//! **Notice:** while the resulting TCP connection is naturally bi-directional,
//! the handshake is not symmetric. There *must* be one "leader" side and one
//! "follower" side (otherwise called "sender" and "receiver").

pub(crate) mod crypto;
mod transport;

use crate::{util, Key, KeyPurpose};
use serde_derive::{Deserialize, Serialize};

use async_std::{
    net::{TcpListener, TcpStream},
    task,
};
use futures::io::AsyncWriteExt;
use log::*;
use std::{str::FromStr, sync::Arc, time::Duration};

use crypto_secretbox as secretbox;
use transport::{TransitTransportRx, TransitTransportTx};

/// URL to a default hosted relay server. Please don't abuse or DOS.
pub const DEFAULT_RELAY_SERVER: &str = "tcp:transit.magic-wormhole.io:4001";

/// Records bigger than this are refused on receive. Mostly a DoS protection
/// against bogus length prefixes; the sender never produces records anywhere
/// near this big.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a losing candidate that is still mid-handshake may take to finish
/// before it is cancelled instead of being told "nevermind".
const NEVERMIND_GRACE: Duration = Duration::from_secs(5);

pub struct TransitKey;
impl KeyPurpose for TransitKey {}
pub struct TransitRxKey;
impl KeyPurpose for TransitRxKey {}
pub struct TransitTxKey;
impl KeyPurpose for TransitTxKey {}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitConnectError {
    /** Incompatible abilities, or wrong hints */
    #[error("{}", _0)]
    Protocol(Box<str>),
    #[error("All (relay) handshakes failed or timed out; could not establish a connection with the peer")]
    Handshake,
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitError {
    #[error("Cryptography error. This is probably an implementation bug, but may also be an attack")]
    Crypto,
    #[error("Wrong nonce received, got {:x?} but expected {:x?}. This is probably an implementation bug, but may also be an attack", _0, _1)]
    Nonce(Box<[u8]>, Box<[u8]>),
    #[error("Received record of {} bytes exceeds the configured limit of {} bytes", _0, _1)]
    RecordTooLarge(u64, u64),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/// Private, because we try multiple handshakes and only
/// one needs to succeed
#[derive(Debug, thiserror::Error)]
enum TransitHandshakeError {
    #[error("Handshake failed")]
    HandshakeFailed,
    #[error("Relay handshake failed")]
    RelayHandshakeFailed,
    #[error("Connection attempt timed out")]
    ConnectionTimedOut,
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

/**
 * Defines a way to find the other side.
 *
 * Each ability comes with a set of [hints](Hint) to encode how to meet up.
 */
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Ability {
    /**
     * Try to connect directly to the other side.
     *
     * This usually requires both participants to be in the same network.
     * [`DirectHint`s](DirectHint) are sent, which encode all local IP
     * addresses for the other side to find us.
     */
    DirectTcpV1,
    /** Try to meet the other side at a relay. */
    RelayV1,
    /* TODO Fix once https://github.com/serde-rs/serde/issues/912 is done */
    #[serde(other)]
    Other,
}

impl Ability {
    pub fn all_abilities() -> Vec<Ability> {
        vec![Self::DirectTcpV1, Self::RelayV1]
    }
}

/**
 * A peer hint, as it is sent over the wire.
 *
 * The union is untagged; each variant carries its `type` field itself. Relay
 * hints are a bit weird: one relay hint contains multiple direct hints, one
 * per way of reaching that one relay server. Multiple relay servers mean
 * multiple relay hints.
 */
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(untagged)]
pub enum Hint {
    DirectTcpV1(DirectHint),
    RelayV1(RelayHint),
}

impl Hint {
    pub fn new_direct(priority: f64, hostname: &str, port: u16) -> Self {
        Hint::DirectTcpV1(DirectHint {
            priority,
            hostname: hostname.to_string(),
            port,
        })
    }

    pub fn new_relay(h: Vec<DirectHint>) -> Self {
        Hint::RelayV1(RelayHint { hints: h })
    }
}

impl Eq for Hint {}

/* The hints are kept in set-like collections. Direct hints all sort alike
 * (and before any relay); relay hints compare by their contents. */
impl Ord for Hint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Hint::DirectTcpV1(_), Hint::DirectTcpV1(_)) => Ordering::Equal,
            (Hint::DirectTcpV1(_), Hint::RelayV1(_)) => Ordering::Less,
            (Hint::RelayV1(_), Hint::DirectTcpV1(_)) => Ordering::Greater,
            (Hint::RelayV1(a), Hint::RelayV1(b)) => a.hints.cmp(&b.hints),
        }
    }
}

impl PartialOrd for Hint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case", tag = "type", rename = "direct-tcp-v1")]
pub struct DirectHint {
    pub priority: f64,
    pub hostname: String,
    pub port: u16,
}

impl Eq for DirectHint {}

impl Ord for DirectHint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.hostname, self.port)
            .cmp(&(&other.hostname, other.port))
            .then(self.priority.total_cmp(&other.priority))
    }
}

impl PartialOrd for DirectHint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case", tag = "type", rename = "relay-v1")]
pub struct RelayHint {
    pub hints: Vec<DirectHint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostType {
    Direct,
    Relay,
}

pub struct RelayUrl {
    pub host: String,
    pub port: u16,
}

impl FromStr for RelayUrl {
    type Err = &'static str;

    fn from_str(url: &str) -> Result<Self, &'static str> {
        // TODO use proper URL parsing
        let v: Vec<&str> = url.split(':').collect();
        if v.len() == 3 && v[0] == "tcp" {
            v[2].parse()
                .map(|port| RelayUrl {
                    host: v[1].to_string(),
                    port,
                })
                .map_err(|_| "Cannot parse relay url port")
        } else {
            Err("Incorrect relay server url format")
        }
    }
}

fn generate_transit_side() -> String {
    let x: [u8; 8] = rand::random();
    hex::encode(x)
}

/**
 * Initialize a Transit connector.
 *
 * Binds the listening port and collects our hints. This does not do any
 * communication yet; exchange the [abilities](TransitConnector::our_abilities)
 * and [hints](TransitConnector::our_hints) with the other side through the
 * encrypted channel, then call one of the connect methods.
 */
pub async fn init(
    abilities: Vec<Ability>,
    relay_url: Option<&RelayUrl>,
) -> std::io::Result<TransitConnector> {
    let port = transport::allocate_tcp_port()?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    let mut our_hints: Vec<Hint> = Vec::new();
    if abilities.contains(&Ability::DirectTcpV1) {
        our_hints.extend(transport::local_direct_hints(port)?);
    }
    if abilities.contains(&Ability::RelayV1) {
        if let Some(relay_url) = relay_url {
            our_hints.push(Hint::new_relay(vec![DirectHint {
                priority: 0.0,
                hostname: relay_url.host.clone(),
                port: relay_url.port,
            }]));
        }
    }

    Ok(TransitConnector {
        listener,
        port,
        side: generate_transit_side(),
        our_abilities: abilities,
        our_hints,
    })
}

/**
 * A partially set up [`Transit`] connection.
 *
 * Both sides generate their hints and need to exchange them (as in: send
 * yours, receive theirs) before connecting. The exchange happens outside of
 * the transit protocol, to be protocol agnostic.
 */
pub struct TransitConnector {
    listener: TcpListener,
    port: u16,
    side: String,
    our_abilities: Vec<Ability>,
    our_hints: Vec<Hint>,
}

impl TransitConnector {
    pub fn our_abilities(&self) -> &[Ability] {
        &self.our_abilities
    }

    /** Send this one to the other side */
    pub fn our_hints(&self) -> &[Hint] {
        &self.our_hints
    }

    /** The port we are listening on, in case you want to do your own port forwarding */
    pub fn port(&self) -> u16 {
        self.port
    }

    /**
     * Connect to the other side, as sender.
     *
     * The sender arbitrates the connection race: the first candidate that
     * completes the handshake gets a `go`, all other candidates that still
     * make it that far are turned away with a `nevermind`.
     */
    pub async fn leader_connect(
        self,
        transit_key: Key<TransitKey>,
        their_abilities: Vec<Ability>,
        their_hints: Vec<Hint>,
    ) -> Result<Transit, TransitConnectError> {
        let Self {
            listener,
            side,
            our_abilities,
            ..
        } = self;
        let transit_key = Arc::new(transit_key);
        trace!("transit key {}", transit_key.to_hex());

        let mut handshake_futures = start_candidates(
            listener,
            &side,
            &transit_key,
            &our_abilities,
            &their_abilities,
            &their_hints,
            Role::Leader,
        )?;

        let mut transit = loop {
            ensure!(
                !handshake_futures.is_empty(),
                TransitConnectError::Handshake
            );
            match futures::future::select_all(handshake_futures).await {
                (Ok(transit), _index, remaining) => {
                    handshake_futures = remaining;
                    break transit;
                },
                (Err(error), _index, remaining) => {
                    debug!("Some handshake failed: {}", error);
                    handshake_futures = remaining;
                },
            }
        };

        debug!("Sending 'go' message to the elected connection");
        transit.socket.write_all(b"go\n").await?;

        /* Turn away everybody else. Candidates that finish their handshake
         * within the grace period get a proper "nevermind", the rest is
         * cancelled; either way the sockets close. */
        task::spawn(async move {
            for mut handle in handshake_futures {
                match util::timeout(NEVERMIND_GRACE, &mut handle).await {
                    Ok(Ok(mut loser)) => {
                        debug!("Sending 'nevermind' to a losing connection");
                        let _ = loser.socket.write_all(b"nevermind\n").await;
                    },
                    Ok(Err(_)) => (),
                    Err(_) => {
                        handle.cancel().await;
                    },
                }
            }
        });

        Ok(transit)
    }

    /**
     * Connect to the other side, as receiver.
     *
     * The receiver simply accepts the first candidate on which the sender's
     * handshake (including the final `go`) checks out.
     */
    pub async fn follower_connect(
        self,
        transit_key: Key<TransitKey>,
        their_abilities: Vec<Ability>,
        their_hints: Vec<Hint>,
    ) -> Result<Transit, TransitConnectError> {
        let Self {
            listener,
            side,
            our_abilities,
            ..
        } = self;
        let transit_key = Arc::new(transit_key);
        trace!("transit key {}", transit_key.to_hex());

        let mut handshake_futures = start_candidates(
            listener,
            &side,
            &transit_key,
            &our_abilities,
            &their_abilities,
            &their_hints,
            Role::Follower,
        )?;

        let transit = loop {
            ensure!(
                !handshake_futures.is_empty(),
                TransitConnectError::Handshake
            );
            match futures::future::select_all(handshake_futures).await {
                (Ok(transit), _index, remaining) => {
                    handshake_futures = remaining;
                    break transit;
                },
                (Err(error), _index, remaining) => {
                    debug!("Some handshake failed: {}", error);
                    handshake_futures = remaining;
                },
            }
        };

        /* Cancel all remaining non-finished handshakes; the sockets close on drop */
        task::spawn(async move {
            for handle in handshake_futures {
                handle.cancel().await;
            }
        });

        Ok(transit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Leader,
    Follower,
}

/// Spawn one connection attempt per eligible peer hint, plus one task
/// accepting inbound connections, each racing to a completed handshake.
fn start_candidates(
    listener: TcpListener,
    side: &str,
    transit_key: &Arc<Key<TransitKey>>,
    our_abilities: &[Ability],
    their_abilities: &[Ability],
    their_hints: &[Hint],
    role: Role,
) -> Result<Vec<task::JoinHandle<Result<Transit, TransitHandshakeError>>>, TransitConnectError> {
    let hosts = connection_candidates(our_abilities, their_hints);
    /* The peer can only reach our listener if both sides do direct */
    let reachable_inbound = our_abilities.contains(&Ability::DirectTcpV1)
        && their_abilities.contains(&Ability::DirectTcpV1);
    ensure!(
        !hosts.is_empty() || reachable_inbound,
        TransitConnectError::Handshake
    );

    let mut handshake_futures = Vec::new();
    for (host_type, hint) in hosts {
        let transit_key = Arc::clone(transit_key);
        let side = side.to_string();
        handshake_futures.push(task::spawn(async move {
            let socket = transport::connect_direct(&hint).await?;
            handshake_exchange(socket, host_type, &transit_key, &side, role).await
        }));
    }

    if reachable_inbound {
        let transit_key = Arc::clone(transit_key);
        let side = side.to_string();
        handshake_futures.push(task::spawn(async move {
            loop {
                let (socket, peer) = listener.accept().await?;
                debug!("Inbound connection from {}", peer);
                match handshake_exchange(socket, HostType::Direct, &transit_key, &side, role).await
                {
                    Ok(transit) => break Ok(transit),
                    Err(error) => debug!("Inbound handshake failed: {}", error),
                }
            }
        }));
    }

    Ok(handshake_futures)
}

/// Deduplicate the peer's hints and expand them into individual connection
/// candidates, direct hints before relay entry points, by descending priority.
/// Hints whose ability we don't hold are skipped.
fn connection_candidates(
    our_abilities: &[Ability],
    their_hints: &[Hint],
) -> Vec<(HostType, DirectHint)> {
    /* The hints are a set on the wire; first occurrence wins */
    let mut hints: Vec<&Hint> = Vec::new();
    for hint in their_hints {
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }
    hints.sort();

    let mut direct_hosts = Vec::new();
    let mut relay_hosts = Vec::new();
    for hint in hints {
        match hint {
            Hint::DirectTcpV1(hint) if our_abilities.contains(&Ability::DirectTcpV1) => {
                direct_hosts.push((HostType::Direct, hint.clone()));
            },
            Hint::RelayV1(relay) if our_abilities.contains(&Ability::RelayV1) => {
                relay_hosts.extend(
                    relay
                        .hints
                        .iter()
                        .map(|hint| (HostType::Relay, hint.clone())),
                );
            },
            other => trace!("Ignoring hint without a matching ability: {:?}", other),
        }
    }

    let by_priority = |(_, a): &(HostType, DirectHint), (_, b): &(HostType, DirectHint)| {
        b.priority.total_cmp(&a.priority)
    };
    direct_hosts.sort_by(by_priority);
    relay_hosts.sort_by(by_priority);

    direct_hosts.append(&mut relay_hosts);
    direct_hosts
}

/**
 * Authenticate a fresh connection.
 *
 * Relay connections first introduce themselves to the relay and wait for it
 * to pair up both sides. Then both sides exchange their handshake messages,
 * each derived from the transit key, sending and receiving concurrently. The
 * follower additionally waits for the leader's `go` before the connection may
 * carry records.
 */
async fn handshake_exchange(
    mut socket: TcpStream,
    host_type: HostType,
    key: &Key<TransitKey>,
    side: &str,
    role: Role,
) -> Result<Transit, TransitHandshakeError> {
    /* The "sender"/"receiver" naming in the key purposes is historical; as
     * the follower, we use the leader's key for receiving and ours for
     * sending. */
    let (skey, rkey) = match role {
        Role::Leader => (
            key.derive_subkey_from_purpose("transit_record_sender_key"),
            key.derive_subkey_from_purpose("transit_record_receiver_key"),
        ),
        Role::Follower => (
            key.derive_subkey_from_purpose("transit_record_receiver_key"),
            key.derive_subkey_from_purpose("transit_record_sender_key"),
        ),
    };

    if host_type == HostType::Relay {
        trace!("initiating relay handshake, side {}", side);
        socket
            .write_all(crypto::build_relay_handshake(key, side).as_bytes())
            .await?;
        let mut rx = [0u8; 3];
        futures::io::AsyncReadExt::read_exact(&mut socket, &mut rx).await?;
        ensure!(rx == *b"ok\n", TransitHandshakeError::RelayHandshakeFailed);
    }

    {
        let (ours, theirs) = match role {
            Role::Leader => (
                crypto::build_sender_handshake(key),
                crypto::build_receiver_handshake(key),
            ),
            Role::Follower => (
                crypto::build_receiver_handshake(key),
                crypto::build_sender_handshake(key),
            ),
        };

        /* Send ours and read theirs concurrently; both sides start with a send */
        let mut tx = socket.clone();
        let mut rx = socket.clone();
        let send = async move {
            tx.write_all(ours.as_bytes()).await?;
            Ok::<(), TransitHandshakeError>(())
        };
        let receive = async move { rx.read_expect(theirs.as_bytes()).await };
        futures::try_join!(send, receive)?;
    }

    if role == Role::Follower {
        /* Did we win the race? The leader will tell us on exactly one connection. */
        socket.read_expect(b"go\n").await?;
    }

    Ok(Transit {
        socket,
        skey,
        rkey,
        snonce: Default::default(),
        rnonce: Default::default(),
        max_record_size: DEFAULT_MAX_RECORD_SIZE,
    })
}

/**
 * An established Transit connection.
 *
 * The raw TCP stream must not be touched directly; the transit protocol
 * specifies an encrypted record pipe, and that is what the provided methods
 * implement.
 */
pub struct Transit {
    /** Raw transit connection */
    socket: TcpStream,
    /** Our key, used for sending */
    skey: Key<TransitTxKey>,
    /** Their key, used for receiving */
    rkey: Key<TransitRxKey>,
    /** Nonce for sending */
    snonce: secretbox::Nonce,
    /**
     * Nonce for receiving
     *
     * We count as receiver and enforce that records come in in order
     */
    rnonce: secretbox::Nonce,
    max_record_size: usize,
}

impl Transit {
    /** Receive and decrypt one record from the other side. */
    pub async fn receive_record(&mut self) -> Result<Box<[u8]>, TransitError> {
        Self::receive_record_inner(
            &mut self.socket,
            &self.rkey,
            &mut self.rnonce,
            self.max_record_size,
        )
        .await
    }

    async fn receive_record_inner(
        socket: &mut (impl futures::io::AsyncRead + Unpin + Send),
        rkey: &Key<TransitRxKey>,
        nonce: &mut secretbox::Nonce,
        max_record_size: usize,
    ) -> Result<Box<[u8]>, TransitError> {
        let enc_packet = socket.read_record(max_record_size).await?;
        ensure!(
            enc_packet.len() >= secretbox::XSalsa20Poly1305::NONCE_SIZE,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Record must be long enough to contain at least the nonce"
            )
        );

        /* Nonce check: the sender counts up from zero, and so do we */
        let received_nonce = &enc_packet[..secretbox::XSalsa20Poly1305::NONCE_SIZE];
        ensure!(
            nonce.as_slice() == received_nonce,
            TransitError::Nonce(received_nonce.into(), nonce.as_slice().into()),
        );
        util::sodium_increment_le(nonce);

        crypto::decrypt_record(rkey, &enc_packet)
    }

    /** Encrypt and send one record to the other side. */
    pub async fn send_record(&mut self, plaintext: &[u8]) -> Result<(), TransitError> {
        Self::send_record_inner(&mut self.socket, &self.skey, &mut self.snonce, plaintext).await
    }

    async fn send_record_inner(
        socket: &mut (impl futures::io::AsyncWrite + Unpin + Send),
        skey: &Key<TransitTxKey>,
        nonce: &mut secretbox::Nonce,
        plaintext: &[u8],
    ) -> Result<(), TransitError> {
        let record = crypto::encrypt_record(skey, nonce, plaintext)?;
        socket.write_record(&record).await?;
        util::sodium_increment_le(nonce);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransitError> {
        self.socket.flush().await?;
        Ok(())
    }

    /** Maximum accepted record size, [1 MiB](DEFAULT_MAX_RECORD_SIZE) unless changed. */
    pub fn set_max_record_size(&mut self, limit: usize) {
        self.max_record_size = limit;
    }
}
