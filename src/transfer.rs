//! Client-to-Client protocol to organize file transfers
//!
//! This gives you the actual capability to transfer files, that feature that
//! Magic Wormhole got known and loved for.
//!
//! It is bound to an [`APPID`](APPID). Only applications using that APPID (and
//! thus this protocol) can interoperate with the original Python
//! implementation (and other compliant implementations).
//!
//! At its core, [`PeerMessage`s](messages::PeerMessage) are exchanged over an
//! established encrypted connection with the other side. They are used to set
//! up a transit channel and to exchange a file offer/answer. Then, the file is
//! transmitted over the transit connection as encrypted records with a final
//! integrity ack.

pub mod messages;

use messages::{Answer, Offer, PeerMessage, TransitAck};

use crate::{
    transit,
    util::{self, DisplayBytes},
    AppID, EncryptedConnection,
};
use transit::{
    Ability, Hint, RelayUrl, Transit, TransitConnectError, TransitConnector, TransitError,
};

use async_std::fs;
use async_trait::async_trait;
use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    Future,
};
use log::*;
use sha2::{digest::FixedOutput, Digest, Sha256};
use std::{
    borrow::Cow,
    ffi::OsString,
    path::{Path, PathBuf},
};

const APPID_RAW: &str = "lothar.com/wormhole/text-or-file-xfer";

/// The App ID associated with this protocol.
pub const APPID: AppID = AppID(Cow::Borrowed(APPID_RAW));

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransferError {
    #[error("Transfer was not acknowledged by peer")]
    AckError,
    #[error("Receive checksum error")]
    Checksum,
    #[error("The file contained a different amount of bytes than advertized! Sent {} bytes, but should have been {}", sent_size, file_size)]
    FileSize { sent_size: u64, file_size: u64 },
    // TODO be more specific
    #[error("Unsupported offer type")]
    UnsupportedOffer,
    #[error("Something went wrong on the other side: {}", _0)]
    PeerError(String),

    /// Some deserialization went wrong, we probably got some garbage
    #[error("Corrupt JSON message received")]
    ProtocolJson(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// A generic string message for "something went wrong", i.e.
    /// the peer sent some bullshit message order
    #[error("Protocol error: {}", _0)]
    Protocol(Box<str>),
    #[error(
        "Unexpected message (protocol error): Expected '{}', but got: {}",
        _0,
        _1
    )]
    ProtocolUnexpectedMessage(Box<str>, Box<str>),
    #[error("Error while establishing transit connection")]
    TransitConnect(
        #[from]
        #[source]
        TransitConnectError,
    ),
    #[error("Transit error")]
    Transit(
        #[from]
        #[source]
        TransitError,
    ),
    #[error("IO error")]
    IO(
        #[from]
        #[source]
        std::io::Error,
    ),
}

impl TransferError {
    fn unexpected_message(expected: impl Into<Box<str>>, got: impl std::fmt::Debug) -> Self {
        Self::ProtocolUnexpectedMessage(expected.into(), format!("{:?}", got).into())
    }
}

/// Result of packing a directory for transfer.
#[derive(Debug, Clone)]
pub struct ZippedDir {
    /// Path of the produced archive, usually somewhere temporary
    pub archive: PathBuf,
    /// Number of files inside
    pub num_files: u64,
    /// Sum of the (uncompressed) file sizes
    pub num_bytes: u64,
}

/**
 * Directory packing, delegated to the embedding application.
 *
 * Directories travel as one deflated zip file. Extraction is expected to
 * restore the file modes stored in the zip's external attributes.
 */
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Pack `src_dir` into a deflated zip file in some temporary location.
    async fn zip_dir(&self, src_dir: &Path) -> std::io::Result<ZippedDir>;

    /// Extract `archive` into `dest_dir`, restoring file modes.
    async fn unzip_into(&self, dest_dir: &Path, archive: &Path) -> std::io::Result<()>;
}

async fn send_peer_message(
    connection: &mut (impl EncryptedConnection + ?Sized),
    message: &PeerMessage,
) -> Result<(), TransferError> {
    connection.send_plain(serde_json::to_vec(message)?).await?;
    Ok(())
}

async fn receive_peer_message(
    connection: &mut (impl EncryptedConnection + ?Sized),
) -> Result<PeerMessage, TransferError> {
    let data = connection.receive_plain().await?;
    debug!("Received {}", DisplayBytes(&data));
    Ok(serde_json::from_slice(&data)?)
}

/// Send a file or a folder, dispatching on what the path points at.
pub async fn send_file_or_folder<C, H>(
    connection: C,
    appid: &AppID,
    relay_url: Option<&RelayUrl>,
    transit_abilities: Vec<Ability>,
    file_path: impl AsRef<Path>,
    file_name: impl AsRef<Path>,
    archiver: &dyn Archiver,
    progress_handler: H,
    cancel: impl Future<Output = ()>,
) -> Result<(), TransferError>
where
    C: EncryptedConnection,
    H: FnMut(u64, u64) + 'static,
{
    let file_path = file_path.as_ref();
    let file_name = file_name.as_ref();

    let metadata = fs::metadata(file_path).await?;
    if metadata.is_dir() {
        send_folder(
            connection,
            appid,
            relay_url,
            transit_abilities,
            file_path,
            file_name,
            archiver,
            progress_handler,
            cancel,
        )
        .await
    } else {
        let file_size = metadata.len();
        let mut file = fs::File::open(file_path).await?;
        send_file(
            connection,
            appid,
            relay_url,
            transit_abilities,
            &mut file,
            file_name,
            file_size,
            progress_handler,
            cancel,
        )
        .await
    }
}

/**
 * Send a file to the other side
 *
 * You must ensure that the reader contains exactly as many bytes as advertized
 * in `file_size`.
 */
pub async fn send_file<C, F, N, H>(
    mut connection: C,
    appid: &AppID,
    relay_url: Option<&RelayUrl>,
    transit_abilities: Vec<Ability>,
    file: &mut F,
    file_name: N,
    file_size: u64,
    progress_handler: H,
    cancel: impl Future<Output = ()>,
) -> Result<(), TransferError>
where
    C: EncryptedConnection,
    F: AsyncRead + Unpin,
    N: Into<PathBuf>,
    H: FnMut(u64, u64) + 'static,
{
    let file_name = file_name.into();
    let run = async {
        let connector = transit::init(transit_abilities, relay_url).await?;

        // We want to do some transit
        debug!("Sending transit message '{:?}'", connector.our_hints());
        send_peer_message(
            &mut connection,
            &PeerMessage::transit(
                connector.our_abilities().to_vec(),
                connector.our_hints().to_vec(),
            ),
        )
        .await?;

        // Send file offer message.
        debug!("Sending file offer");
        send_peer_message(&mut connection, &PeerMessage::offer_file(file_name, file_size)).await?;

        // Wait for their transit response
        let (their_abilities, their_hints) =
            match receive_peer_message(&mut connection).await?.check_err()? {
                PeerMessage::Transit(transit) => {
                    debug!("Received transit message: {:?}", transit);
                    (transit.abilities_v1, transit.hints_v1)
                },
                other => {
                    bail!(TransferError::unexpected_message("transit", other))
                },
            };

        // Wait for file_ack
        match receive_peer_message(&mut connection).await?.check_err()? {
            PeerMessage::Answer(Answer::FileAck(msg)) => {
                ensure!(msg == "ok", TransferError::AckError);
            },
            other => {
                bail!(TransferError::unexpected_message("answer/file_ack", other));
            },
        }

        let mut transit = connector
            .leader_connect(
                connection.shared_key().derive_transit_key(appid),
                their_abilities,
                their_hints,
            )
            .await?;

        debug!("Beginning file transfer");
        let checksum = send_records(&mut transit, file, file_size, progress_handler).await?;

        // Wait for the transit ack with sha256 sum from the peer.
        debug!("Sent file. Waiting for ack");
        let transit_ack = transit.receive_record().await?;
        let transit_ack_msg = serde_json::from_slice::<TransitAck>(&transit_ack)?;
        ensure!(transit_ack_msg.ack == "ok", TransferError::AckError);
        ensure!(
            transit_ack_msg.sha256 == hex::encode(checksum),
            TransferError::Checksum
        );
        debug!("Transfer complete!");

        Ok(())
    };

    match util::cancellable(run, cancel).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error @ TransferError::PeerError(_))) => Err(error),
        Ok(Err(error @ TransferError::Transit(_))) => {
            /* If transit failed, ask for a proper error and potentially use that instead */
            match receive_peer_message(&mut connection).await {
                Ok(PeerMessage::Error(error)) => Err(TransferError::PeerError(error)),
                _ => {
                    let _ = send_peer_message(
                        &mut connection,
                        &PeerMessage::error_message(format!("{}", error)),
                    )
                    .await;
                    Err(error)
                },
            }
        },
        Ok(Err(error)) => {
            let _ = send_peer_message(
                &mut connection,
                &PeerMessage::error_message(format!("{}", error)),
            )
            .await;
            Err(error)
        },
        Err(cancelled) => {
            let _ = send_peer_message(
                &mut connection,
                &PeerMessage::error_message(format!("{}", cancelled)),
            )
            .await;
            Ok(())
        },
    }
}

/**
 * Send a folder to the other side
 *
 * The folder is packed into one deflated zip file by the [`Archiver`] and
 * offered as a `directory`; the receiving side unpacks it again.
 */
pub async fn send_folder<C, H>(
    mut connection: C,
    appid: &AppID,
    relay_url: Option<&RelayUrl>,
    transit_abilities: Vec<Ability>,
    folder_path: impl Into<PathBuf>,
    folder_name: impl Into<PathBuf>,
    archiver: &dyn Archiver,
    progress_handler: H,
    cancel: impl Future<Output = ()>,
) -> Result<(), TransferError>
where
    C: EncryptedConnection,
    H: FnMut(u64, u64) + 'static,
{
    let folder_path = folder_path.into();
    let folder_name = folder_name.into();
    let run = async {
        let connector = transit::init(transit_abilities, relay_url).await?;

        // We want to do some transit
        debug!("Sending transit message '{:?}'", connector.our_hints());
        send_peer_message(
            &mut connection,
            &PeerMessage::transit(
                connector.our_abilities().to_vec(),
                connector.our_hints().to_vec(),
            ),
        )
        .await?;

        info!("Zipping '{}' to see how big it'll be", folder_path.display());
        let zipped = archiver.zip_dir(&folder_path).await?;
        let zipsize = fs::metadata(&zipped.archive).await?.len();

        // Send directory offer message.
        debug!("Sending directory offer");
        send_peer_message(
            &mut connection,
            &PeerMessage::offer_directory(
                folder_name,
                "zipfile/deflated",
                zipsize,
                zipped.num_bytes,
                zipped.num_files,
            ),
        )
        .await?;

        // Wait for their transit response
        let (their_abilities, their_hints) =
            match receive_peer_message(&mut connection).await?.check_err()? {
                PeerMessage::Transit(transit) => {
                    debug!("Received transit message: {:?}", transit);
                    (transit.abilities_v1, transit.hints_v1)
                },
                other => {
                    bail!(TransferError::unexpected_message("transit", other))
                },
            };

        // Wait for file_ack
        match receive_peer_message(&mut connection).await?.check_err()? {
            PeerMessage::Answer(Answer::FileAck(msg)) => {
                ensure!(msg == "ok", TransferError::AckError);
            },
            other => {
                bail!(TransferError::unexpected_message("answer/file_ack", other));
            },
        }

        let mut transit = connector
            .leader_connect(
                connection.shared_key().derive_transit_key(appid),
                their_abilities,
                their_hints,
            )
            .await?;

        debug!("Beginning file transfer");
        let checksum = {
            let mut file = fs::File::open(&zipped.archive).await?;
            send_records(&mut transit, &mut file, zipsize, progress_handler).await?
        };
        /* The archive was only for this one transfer */
        let _ = fs::remove_file(&zipped.archive).await;

        debug!("Sent file. Waiting for ack");
        let transit_ack = transit.receive_record().await?;
        let transit_ack_msg = serde_json::from_slice::<TransitAck>(&transit_ack)?;
        ensure!(transit_ack_msg.ack == "ok", TransferError::AckError);
        ensure!(
            transit_ack_msg.sha256 == hex::encode(checksum),
            TransferError::Checksum
        );
        debug!("Transfer complete!");

        Ok(())
    };

    match util::cancellable(run, cancel).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error @ TransferError::PeerError(_))) => Err(error),
        Ok(Err(error @ TransferError::Transit(_))) => {
            /* If transit failed, ask for a proper error and potentially use that instead */
            match receive_peer_message(&mut connection).await {
                Ok(PeerMessage::Error(error)) => Err(TransferError::PeerError(error)),
                _ => {
                    let _ = send_peer_message(
                        &mut connection,
                        &PeerMessage::error_message(format!("{}", error)),
                    )
                    .await;
                    Err(error)
                },
            }
        },
        Ok(Err(error)) => {
            let _ = send_peer_message(
                &mut connection,
                &PeerMessage::error_message(format!("{}", error)),
            )
            .await;
            Err(error)
        },
        Err(cancelled) => {
            let _ = send_peer_message(
                &mut connection,
                &PeerMessage::error_message(format!("{}", cancelled)),
            )
            .await;
            Ok(())
        },
    }
}

/**
 * Wait for a file offer from the other side
 *
 * This method waits for an offer message and builds up a
 * [`ReceiveRequest`](ReceiveRequest). It also sends our transit message so
 * that both sides can start their connection attempts as soon as the offer is
 * accepted.
 *
 * Returns `None` if the task got cancelled.
 */
pub async fn request_file<C>(
    mut connection: C,
    appid: AppID,
    relay_url: Option<&RelayUrl>,
    transit_abilities: Vec<Ability>,
    cancel: impl Future<Output = ()>,
) -> Result<Option<ReceiveRequest<C>>, TransferError>
where
    C: EncryptedConnection,
{
    let run = async {
        let connector = transit::init(transit_abilities, relay_url).await?;

        // Send the transit message
        debug!("Sending transit message '{:?}'", connector.our_hints());
        send_peer_message(
            &mut connection,
            &PeerMessage::transit(
                connector.our_abilities().to_vec(),
                connector.our_hints().to_vec(),
            ),
        )
        .await?;

        // Receive transit message
        let (their_abilities, their_hints) =
            match receive_peer_message(&mut connection).await?.check_err()? {
                PeerMessage::Transit(transit) => {
                    debug!("Received transit message: {:?}", transit);
                    (transit.abilities_v1, transit.hints_v1)
                },
                other => {
                    bail!(TransferError::unexpected_message("transit", other))
                },
            };

        // Receive file offer message from peer
        let offer = match receive_peer_message(&mut connection).await?.check_err()? {
            PeerMessage::Offer(offer @ Offer::File { .. })
            | PeerMessage::Offer(offer @ Offer::Directory { .. }) => offer,
            PeerMessage::Offer(_) => bail!(TransferError::UnsupportedOffer),
            other => {
                bail!(TransferError::unexpected_message("offer", other))
            },
        };
        debug!("Received offer {:?}", offer);

        Ok((connector, their_abilities, their_hints, offer))
    };

    match util::cancellable(run, cancel).await {
        Ok(Ok((connector, their_abilities, their_hints, offer))) => Ok(Some(ReceiveRequest {
            connection,
            appid,
            connector,
            offer,
            their_abilities,
            their_hints,
        })),
        Ok(Err(error @ TransferError::PeerError(_))) => Err(error),
        Ok(Err(error)) => {
            let _ = send_peer_message(
                &mut connection,
                &PeerMessage::error_message(format!("{}", error)),
            )
            .await;
            Err(error)
        },
        Err(_cancelled) => Ok(None),
    }
}

/**
 * A pending file send offer from the other side
 *
 * You *should* consume this object, either by calling
 * [`accept`](ReceiveRequest::accept) (or
 * [`accept_into`](ReceiveRequest::accept_into)) or
 * [`reject`](ReceiveRequest::reject).
 */
#[must_use]
pub struct ReceiveRequest<C: EncryptedConnection> {
    connection: C,
    appid: AppID,
    connector: TransitConnector,
    offer: Offer,
    their_abilities: Vec<Ability>,
    their_hints: Vec<Hint>,
}

impl<C: EncryptedConnection> ReceiveRequest<C> {
    /// **Security warning:** this is untrusted and unverified input
    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    /**
     * Accept the offer and stream the payload into `content_handler`.
     *
     * For a `directory` offer, the bytes that arrive are the zip archive; the
     * caller is responsible for unpacking it. See
     * [`accept_into`](Self::accept_into) for the batteries-included variant.
     */
    pub async fn accept<F, W>(
        self,
        progress_handler: F,
        content_handler: &mut W,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), TransferError>
    where
        F: FnMut(u64, u64) + 'static,
        W: AsyncWrite + Unpin,
    {
        let Self {
            mut connection,
            appid,
            connector,
            offer,
            their_abilities,
            their_hints,
        } = self;

        let run = accept_inner(
            &mut connection,
            &appid,
            connector,
            &offer,
            their_abilities,
            their_hints,
            progress_handler,
            content_handler,
        );
        match util::cancellable(run, cancel).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error @ TransferError::PeerError(_))) => Err(error),
            Ok(Err(error)) => {
                let _ = send_peer_message(
                    &mut connection,
                    &PeerMessage::error_message(format!("{}", error)),
                )
                .await;
                Err(error)
            },
            Err(cancelled) => {
                let _ = send_peer_message(
                    &mut connection,
                    &PeerMessage::error_message(format!("{}", cancelled)),
                )
                .await;
                Ok(())
            },
        }
    }

    /**
     * Accept the offer and store it under `target_dir`.
     *
     * The payload is staged in a temporary file next to its final destination
     * and only renamed once the transfer completed; on any failure the staged
     * file is removed and the final path never appears. Directory offers are
     * handed to the `archiver` for unpacking after the zip arrived intact.
     *
     * The destination name is the basename of the offered file name; any
     * directory components the peer sends are ignored.
     */
    pub async fn accept_into<F>(
        self,
        target_dir: &Path,
        archiver: &dyn Archiver,
        progress_handler: F,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), TransferError>
    where
        F: FnMut(u64, u64) + 'static,
    {
        let Self {
            mut connection,
            appid,
            connector,
            offer,
            their_abilities,
            their_hints,
        } = self;

        let (name, unpack) = match &offer {
            Offer::File { filename, .. } => (file_name_of(filename)?, false),
            Offer::Directory { dirname, .. } => (file_name_of(dirname)?, true),
            _ => bail!(TransferError::UnsupportedOffer),
        };
        let final_path = target_dir.join(&name);
        let tmp_path = staging_path(&final_path);
        debug!("Staging transfer in {}", tmp_path.display());

        let mut file = fs::File::create(&tmp_path).await?;
        let outcome = util::cancellable(
            accept_inner(
                &mut connection,
                &appid,
                connector,
                &offer,
                their_abilities,
                their_hints,
                progress_handler,
                &mut file,
            ),
            cancel,
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                file.sync_all().await?;
                drop(file);
                if unpack {
                    debug!(
                        "Unpacking {} into {}",
                        tmp_path.display(),
                        final_path.display()
                    );
                    archiver.unzip_into(&final_path, &tmp_path).await?;
                    let _ = fs::remove_file(&tmp_path).await;
                } else {
                    fs::rename(&tmp_path, &final_path).await?;
                }
                Ok(())
            },
            Ok(Err(error)) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                if !matches!(error, TransferError::PeerError(_)) {
                    let _ = send_peer_message(
                        &mut connection,
                        &PeerMessage::error_message(format!("{}", error)),
                    )
                    .await;
                }
                Err(error)
            },
            Err(cancelled) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                let _ = send_peer_message(
                    &mut connection,
                    &PeerMessage::error_message(format!("{}", cancelled)),
                )
                .await;
                Ok(())
            },
        }
    }

    /**
     * Reject the file offer
     *
     * This will send an error message to the other side so that it knows the
     * transfer failed.
     */
    pub async fn reject(mut self) -> Result<(), TransferError> {
        send_peer_message(
            &mut self.connection,
            &PeerMessage::error_message("transfer rejected"),
        )
        .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_inner<C, W>(
    connection: &mut C,
    appid: &AppID,
    connector: TransitConnector,
    offer: &Offer,
    their_abilities: Vec<Ability>,
    their_hints: Vec<Hint>,
    progress_handler: impl FnMut(u64, u64) + 'static,
    content_handler: &mut W,
) -> Result<(), TransferError>
where
    C: EncryptedConnection,
    W: AsyncWrite + Unpin,
{
    let filesize = match offer {
        Offer::File { filesize, .. } => *filesize,
        Offer::Directory { zipsize, .. } => *zipsize,
        _ => bail!(TransferError::UnsupportedOffer),
    };

    // Send file ack.
    debug!("Sending ack");
    send_peer_message(connection, &PeerMessage::file_ack("ok")).await?;

    let mut transit = connector
        .follower_connect(
            connection.shared_key().derive_transit_key(appid),
            their_abilities,
            their_hints,
        )
        .await?;

    debug!("Beginning file transfer");
    receive_records(&mut transit, filesize, progress_handler, content_handler).await
}

/// The destination must not escape the target directory, no matter what the
/// peer puts into the offer.
fn file_name_of(offered: &Path) -> Result<OsString, TransferError> {
    offered
        .file_name()
        .map(ToOwned::to_owned)
        .ok_or_else(|| TransferError::Protocol("Offered file name is not usable".into()))
}

fn staging_path(final_path: &Path) -> PathBuf {
    let mut path = final_path.as_os_str().to_owned();
    path.push(".tmp");
    PathBuf::from(path)
}

/// Plaintext bytes per encrypted record on the wire.
const RECORD_CHUNK_SIZE: usize = 4096;

/// Stream the payload as encrypted records and hand back the plaintext digest
/// for the final ack comparison. Only one chunk is resident at a time.
async fn send_records<F>(
    transit: &mut Transit,
    source: &mut (impl AsyncRead + Unpin),
    expected_size: u64,
    mut progress_handler: F,
) -> Result<Vec<u8>, TransferError>
where
    F: FnMut(u64, u64) + 'static,
{
    let mut hasher = Sha256::default();
    let mut chunk = vec![0u8; RECORD_CHUNK_SIZE];
    let mut sent = 0u64;

    progress_handler(0, expected_size);
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let plaintext = &chunk[..n];

        hasher.update(plaintext);
        transit.send_record(plaintext).await?;

        sent += n as u64;
        progress_handler(sent, expected_size);
    }
    transit.flush().await?;

    /* The offer promised exactly `expected_size` bytes; a source that shrank
     * or grew since then must not go unnoticed. */
    ensure!(
        sent == expected_size,
        TransferError::FileSize {
            sent_size: sent,
            file_size: expected_size
        }
    );

    Ok(hasher.finalize_fixed().to_vec())
}

/// Counterpart of [`send_records`]: drain the advertised number of bytes into
/// the sink, then answer with one record in the opposite direction carrying
/// `ack: ok` and the digest of everything written.
async fn receive_records<F, W>(
    transit: &mut Transit,
    expected_size: u64,
    mut progress_handler: F,
    sink: &mut W,
) -> Result<(), TransferError>
where
    F: FnMut(u64, u64) + 'static,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::default();
    let mut outstanding = expected_size;

    progress_handler(0, expected_size);
    while outstanding > 0 {
        let plaintext = transit.receive_record().await?;
        ensure!(
            plaintext.len() as u64 <= outstanding,
            TransferError::Protocol("Peer sent more bytes than advertized".into())
        );

        sink.write_all(&plaintext).await?;
        hasher.update(&plaintext);

        outstanding -= plaintext.len() as u64;
        progress_handler(expected_size - outstanding, expected_size);
    }

    let sha256sum = hex::encode(hasher.finalize_fixed());
    debug!(
        "Received all {} bytes, acking with sha256 {}",
        expected_size, sha256sum
    );
    transit
        .send_record(&TransitAck::new("ok", sha256sum).serialize_vec())
        .await?;

    Ok(())
}
