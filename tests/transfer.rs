//! End-to-end tests: two in-process peers talking over loopback TCP, with the
//! encrypted side channel replaced by a channel pair and, where needed, a
//! scripted relay server in the middle.

use async_std::{
    net::{TcpListener, TcpStream},
    task,
};
use async_trait::async_trait;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use wormhole_transit::{
    transfer::{
        self,
        messages::{Offer, PeerMessage, TransitAck},
        Archiver, TransferError, ZippedDir,
    },
    transit::{self, Ability, Hint, RelayUrl, TransitConnectError, TransitError, TransitKey},
    AppID, EncryptedConnection, GenericKey, Key, WormholeKey,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wormhole_key(bytes: [u8; 32]) -> Key<WormholeKey> {
    Key::new(Box::new(*crypto_secretbox::Key::from_slice(&bytes)))
}

fn transit_key(bytes: [u8; 32]) -> Key<TransitKey> {
    Key::new(Box::new(*crypto_secretbox::Key::from_slice(&bytes)))
}

fn test_appid() -> AppID {
    AppID::new("lothar.com/wormhole/text-or-file-xfer")
}

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "wormhole-transit-{}-{}",
        label,
        hex::encode(rand::random::<[u8; 8]>())
    ))
}

/// The "encrypted side channel": both halves of an in-memory duplex queue.
struct ChannelConnection {
    key: Key<WormholeKey>,
    tx: async_channel::Sender<Vec<u8>>,
    rx: async_channel::Receiver<Vec<u8>>,
}

fn connection_pair(key_bytes: [u8; 32]) -> (ChannelConnection, ChannelConnection) {
    let (tx_a, rx_b) = async_channel::unbounded();
    let (tx_b, rx_a) = async_channel::unbounded();
    (
        ChannelConnection {
            key: wormhole_key(key_bytes),
            tx: tx_a,
            rx: rx_a,
        },
        ChannelConnection {
            key: wormhole_key(key_bytes),
            tx: tx_b,
            rx: rx_b,
        },
    )
}

#[async_trait]
impl EncryptedConnection for ChannelConnection {
    async fn send_plain(&mut self, message: Vec<u8>) -> std::io::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer is gone"))
    }

    async fn receive_plain(&mut self) -> std::io::Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer is gone"))
    }

    fn shared_key(&self) -> &Key<WormholeKey> {
        &self.key
    }
}

async fn read_line(socket: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        socket.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    String::from_utf8(line).unwrap()
}

/// Copy one direction of a relayed connection. If `tamper_at` is set and this
/// direction starts with a sender handshake, the byte at that stream offset
/// (counted from after the relay pairing) gets flipped.
async fn forward(mut from: TcpStream, mut to: TcpStream, tamper_at: Option<usize>) {
    let mut pos = 0usize;
    let mut sniffed = Vec::new();
    let mut is_sender_side = None;
    let mut buf = [0u8; 4096];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &mut buf[..n];
        if let Some(target) = tamper_at {
            if is_sender_side.is_none() {
                sniffed.extend_from_slice(chunk);
                if sniffed.len() >= 15 {
                    is_sender_side = Some(&sniffed[..15] == b"transit sender ");
                }
            }
            if is_sender_side == Some(true) && (pos..pos + n).contains(&target) {
                chunk[target - pos] ^= 0x01;
            }
        }
        pos += n;
        if to.write_all(chunk).await.is_err() {
            break;
        }
    }
    let _ = to.close().await;
}

/// A minimal transit relay: pair up the next two connections that ask for the
/// same token, then splice them together.
async fn relay_once(listener: TcpListener, tamper_at: Option<usize>) {
    let (mut a, _) = listener.accept().await.unwrap();
    let line_a = read_line(&mut a).await;
    let (mut b, _) = listener.accept().await.unwrap();
    let line_b = read_line(&mut b).await;

    let token = |line: &str| line.split_whitespace().nth(2).unwrap().to_string();
    assert_eq!(token(&line_a), token(&line_b));
    assert!(line_a.starts_with("please relay "));

    a.write_all(b"ok\n").await.unwrap();
    b.write_all(b"ok\n").await.unwrap();

    let ab = task::spawn(forward(a.clone(), b.clone(), tamper_at));
    let ba = task::spawn(forward(b, a, tamper_at));
    ab.await;
    ba.await;
}

async fn spawn_relay(tamper_at: Option<usize>) -> eyre::Result<RelayUrl> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    task::spawn(relay_once(listener, tamper_at));
    Ok(format!("tcp:127.0.0.1:{}", port).parse().unwrap())
}

/// Stand-in for a real zip implementation: "packs" to a fixed byte pattern and
/// "unpacks" by dumping the archive bytes into one file.
struct MockArchiver {
    content: Vec<u8>,
    zipped_to: Mutex<Option<PathBuf>>,
}

impl MockArchiver {
    fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            zipped_to: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Archiver for MockArchiver {
    async fn zip_dir(&self, _src_dir: &Path) -> std::io::Result<ZippedDir> {
        let archive = temp_dir("archive");
        async_std::fs::write(&archive, &self.content).await?;
        *self.zipped_to.lock().unwrap() = Some(archive.clone());
        Ok(ZippedDir {
            archive,
            num_files: 3,
            num_bytes: self.content.len() as u64 * 2,
        })
    }

    async fn unzip_into(&self, dest_dir: &Path, archive: &Path) -> std::io::Result<()> {
        async_std::fs::create_dir_all(dest_dir).await?;
        let content = async_std::fs::read(archive).await?;
        async_std::fs::write(dest_dir.join("unpacked.bin"), content).await?;
        Ok(())
    }
}

#[async_std::test]
async fn test_transit_direct_roundtrip() -> eyre::Result<()> {
    init_logger();
    let key = transit_key([9u8; 32]);

    let connector_a = transit::init(vec![Ability::DirectTcpV1], None).await?;
    let connector_b = transit::init(vec![Ability::DirectTcpV1], None).await?;
    let hints_for_a = vec![Hint::new_direct(0.0, "127.0.0.1", connector_b.port())];
    let hints_for_b = vec![Hint::new_direct(0.0, "127.0.0.1", connector_a.port())];

    let leader = task::spawn({
        let key = key.clone();
        async move {
            connector_a
                .leader_connect(key, vec![Ability::DirectTcpV1], hints_for_a)
                .await
        }
    });
    let follower = task::spawn({
        let key = key.clone();
        async move {
            connector_b
                .follower_connect(key, vec![Ability::DirectTcpV1], hints_for_b)
                .await
        }
    });

    let mut transit_a = leader.await?;
    let mut transit_b = follower.await?;

    transit_a.send_record(b"hello").await?;
    assert_eq!(&*transit_b.receive_record().await?, b"hello");
    transit_b.send_record(b"world").await?;
    assert_eq!(&*transit_a.receive_record().await?, b"world");

    /* records stay in order, nonces count up */
    for i in 0..10u8 {
        transit_a.send_record(&[i]).await?;
    }
    for i in 0..10u8 {
        assert_eq!(&*transit_b.receive_record().await?, &[i]);
    }
    Ok(())
}

#[async_std::test]
async fn test_file_transfer_via_relay() -> eyre::Result<()> {
    init_logger();
    let (connection_a, connection_b) = connection_pair([1u8; 32]);
    let relay_url = spawn_relay(None).await?;
    let relay_url_b: RelayUrl = format!("tcp:{}:{}", relay_url.host, relay_url.port)
        .parse()
        .unwrap();

    let sender = task::spawn(async move {
        let mut file = futures::io::Cursor::new(b"hello\n".to_vec());
        transfer::send_file(
            connection_a,
            &test_appid(),
            Some(&relay_url),
            vec![Ability::RelayV1],
            &mut file,
            "hello.txt",
            6,
            |_sent, _total| {},
            futures::future::pending(),
        )
        .await
    });

    let receiver = task::spawn(async move {
        let request = transfer::request_file(
            connection_b,
            test_appid(),
            Some(&relay_url_b),
            vec![Ability::RelayV1],
            futures::future::pending(),
        )
        .await?
        .expect("request_file was not cancelled");

        match request.offer() {
            Offer::File { filename, filesize } => {
                assert_eq!(filename, &PathBuf::from("hello.txt"));
                assert_eq!(*filesize, 6);
            },
            other => panic!("unexpected offer: {:?}", other),
        }

        let mut content = futures::io::Cursor::new(Vec::new());
        request
            .accept(|_sent, _total| {}, &mut content, futures::future::pending())
            .await?;
        Ok::<_, TransferError>(content.into_inner())
    });

    sender.await?;
    let received = receiver.await?;
    assert_eq!(received, b"hello\n");
    assert_eq!(
        hex::encode(Sha256::digest(&received)),
        "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
    );
    Ok(())
}

#[async_std::test]
async fn test_receive_into_staged_file() -> eyre::Result<()> {
    init_logger();
    let (connection_a, connection_b) = connection_pair([4u8; 32]);
    let relay_url = spawn_relay(None).await?;
    let relay_url_b: RelayUrl = format!("tcp:{}:{}", relay_url.host, relay_url.port)
        .parse()
        .unwrap();

    let target_dir = temp_dir("download");
    async_std::fs::create_dir_all(&target_dir).await?;

    let payload: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    let payload_len = payload.len() as u64;

    let sender = task::spawn(async move {
        let mut file = futures::io::Cursor::new(payload);
        transfer::send_file(
            connection_a,
            &test_appid(),
            Some(&relay_url),
            vec![Ability::RelayV1],
            &mut file,
            /* the receiver must reduce this to the basename */
            "../evil/data.bin",
            payload_len,
            |_sent, _total| {},
            futures::future::pending(),
        )
        .await
    });

    let receiver = task::spawn({
        let target_dir = target_dir.clone();
        async move {
            let request = transfer::request_file(
                connection_b,
                test_appid(),
                Some(&relay_url_b),
                vec![Ability::RelayV1],
                futures::future::pending(),
            )
            .await?
            .expect("request_file was not cancelled");

            let archiver = MockArchiver::new(Vec::new());
            request
                .accept_into(
                    &target_dir,
                    &archiver,
                    |_sent, _total| {},
                    futures::future::pending(),
                )
                .await
        }
    });

    sender.await?;
    receiver.await?;

    let expected: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        async_std::fs::read(target_dir.join("data.bin")).await?,
        expected
    );
    /* no staging leftovers */
    let mut entries = Vec::new();
    let mut dir = async_std::fs::read_dir(&target_dir).await?;
    while let Some(entry) = futures::StreamExt::next(&mut dir).await {
        entries.push(entry?.file_name());
    }
    assert_eq!(entries, vec![std::ffi::OsString::from("data.bin")]);

    async_std::fs::remove_dir_all(&target_dir).await?;
    Ok(())
}

#[async_std::test]
async fn test_directory_transfer() -> eyre::Result<()> {
    init_logger();
    let (connection_a, connection_b) = connection_pair([6u8; 32]);
    let relay_url = spawn_relay(None).await?;
    let relay_url_b: RelayUrl = format!("tcp:{}:{}", relay_url.host, relay_url.port)
        .parse()
        .unwrap();

    let archive_content: Vec<u8> = (0..10_000).map(|i| (i % 249) as u8).collect();
    let src_dir = temp_dir("photos-src");
    async_std::fs::create_dir_all(&src_dir).await?;
    let target_dir = temp_dir("photos-dst");
    async_std::fs::create_dir_all(&target_dir).await?;

    let sender_archiver = std::sync::Arc::new(MockArchiver::new(archive_content.clone()));
    let sender = task::spawn({
        let archiver = sender_archiver.clone();
        let src_dir = src_dir.clone();
        async move {
            transfer::send_folder(
                connection_a,
                &test_appid(),
                Some(&relay_url),
                vec![Ability::RelayV1],
                src_dir,
                "photos",
                &*archiver,
                |_sent, _total| {},
                futures::future::pending(),
            )
            .await
        }
    });

    let archive_len = archive_content.len() as u64;
    let receiver = task::spawn({
        let target_dir = target_dir.clone();
        async move {
            let request = transfer::request_file(
                connection_b,
                test_appid(),
                Some(&relay_url_b),
                vec![Ability::RelayV1],
                futures::future::pending(),
            )
            .await?
            .expect("request_file was not cancelled");

            match request.offer() {
                Offer::Directory {
                    dirname,
                    mode,
                    zipsize,
                    numbytes,
                    numfiles,
                } => {
                    assert_eq!(dirname, &PathBuf::from("photos"));
                    assert_eq!(mode, "zipfile/deflated");
                    assert_eq!(*zipsize, archive_len);
                    assert_eq!(*numbytes, archive_len * 2);
                    assert_eq!(*numfiles, 3);
                },
                other => panic!("unexpected offer: {:?}", other),
            }

            let archiver = MockArchiver::new(Vec::new());
            request
                .accept_into(
                    &target_dir,
                    &archiver,
                    |_sent, _total| {},
                    futures::future::pending(),
                )
                .await
        }
    });

    sender.await?;
    receiver.await?;

    /* the zip arrived intact and was unpacked into the destination */
    assert_eq!(
        async_std::fs::read(target_dir.join("photos").join("unpacked.bin")).await?,
        archive_content
    );
    /* the sender's temporary archive is gone, and so is the staged download */
    let sender_archive = sender_archiver.zipped_to.lock().unwrap().clone().unwrap();
    assert!(!sender_archive.exists());
    assert!(!target_dir.join("photos.tmp").exists());

    async_std::fs::remove_dir_all(&target_dir).await?;
    async_std::fs::remove_dir_all(&src_dir).await?;
    Ok(())
}

#[async_std::test]
async fn test_tampered_record_aborts() -> eyre::Result<()> {
    init_logger();
    let (connection_a, connection_b) = connection_pair([2u8; 32]);
    /* Stream offset 125 (sender handshake 87 + go 3 + length prefix 4 + nonce
     * 24 = 118 bytes of framing) lands in the first record's ciphertext. */
    let relay_url = spawn_relay(Some(125)).await?;
    let relay_url_b: RelayUrl = format!("tcp:{}:{}", relay_url.host, relay_url.port)
        .parse()
        .unwrap();

    let target_dir = temp_dir("tampered");
    async_std::fs::create_dir_all(&target_dir).await?;

    let sender = task::spawn(async move {
        let mut file = futures::io::Cursor::new(b"hello\n".to_vec());
        transfer::send_file(
            connection_a,
            &test_appid(),
            Some(&relay_url),
            vec![Ability::RelayV1],
            &mut file,
            "hello.txt",
            6,
            |_sent, _total| {},
            futures::future::pending(),
        )
        .await
    });

    let receiver = task::spawn({
        let target_dir = target_dir.clone();
        async move {
            let request = transfer::request_file(
                connection_b,
                test_appid(),
                Some(&relay_url_b),
                vec![Ability::RelayV1],
                futures::future::pending(),
            )
            .await?
            .expect("request_file was not cancelled");

            let archiver = MockArchiver::new(Vec::new());
            request
                .accept_into(
                    &target_dir,
                    &archiver,
                    |_sent, _total| {},
                    futures::future::pending(),
                )
                .await
        }
    });

    assert!(matches!(
        receiver.await,
        Err(TransferError::Transit(TransitError::Crypto))
    ));
    assert!(sender.await.is_err());

    /* neither the file nor the staging leftover exist */
    assert!(!target_dir.join("hello.txt").exists());
    assert!(!target_dir.join("hello.txt.tmp").exists());

    async_std::fs::remove_dir_all(&target_dir).await?;
    Ok(())
}

#[async_std::test]
async fn test_sender_rejects_wrong_digest() -> eyre::Result<()> {
    init_logger();
    let (connection_a, mut connection_b) = connection_pair([7u8; 32]);
    let relay_url = spawn_relay(None).await?;
    let relay_url_b: RelayUrl = format!("tcp:{}:{}", relay_url.host, relay_url.port)
        .parse()
        .unwrap();

    let sender = task::spawn(async move {
        let mut file = futures::io::Cursor::new(b"hello\n".to_vec());
        transfer::send_file(
            connection_a,
            &test_appid(),
            Some(&relay_url),
            vec![Ability::RelayV1],
            &mut file,
            "hello.txt",
            6,
            |_sent, _total| {},
            futures::future::pending(),
        )
        .await
    });

    /* A hand-scripted receiver that plays along but lies in the final ack */
    let receiver = task::spawn(async move {
        let (their_abilities, their_hints) =
            match serde_json::from_slice(&connection_b.receive_plain().await.unwrap()).unwrap() {
                PeerMessage::Transit(transit) => (transit.abilities_v1, transit.hints_v1),
                other => panic!("unexpected message: {:?}", other),
            };
        /* the offer */
        let _: PeerMessage =
            serde_json::from_slice(&connection_b.receive_plain().await.unwrap()).unwrap();

        let connector = transit::init(vec![Ability::RelayV1], Some(&relay_url_b))
            .await
            .unwrap();
        connection_b
            .send_plain(
                serde_json::to_vec(&PeerMessage::transit(
                    connector.our_abilities().to_vec(),
                    connector.our_hints().to_vec(),
                ))
                .unwrap(),
            )
            .await
            .unwrap();
        connection_b
            .send_plain(serde_json::to_vec(&PeerMessage::file_ack("ok")).unwrap())
            .await
            .unwrap();

        let mut transit = connector
            .follower_connect(
                connection_b.shared_key().derive_transit_key(&test_appid()),
                their_abilities,
                their_hints,
            )
            .await
            .unwrap();

        let mut received = 0;
        while received < 6 {
            received += transit.receive_record().await.unwrap().len();
        }
        transit
            .send_record(&TransitAck::new("ok", "0".repeat(64)).serialize_vec())
            .await
            .unwrap();
    });

    assert!(matches!(sender.await, Err(TransferError::Checksum)));
    receiver.await;
    Ok(())
}

#[async_std::test]
async fn test_race_arbitration() -> eyre::Result<()> {
    init_logger();
    let key = transit_key([3u8; 32]);
    let (report_tx, report_rx) = async_channel::unbounded::<&'static str>();

    /* Two scripted receivers, both of which complete the handshake; the
     * sender must confirm exactly one and turn the other away. */
    let mut hints = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        hints.push(Hint::new_direct(
            0.0,
            "127.0.0.1",
            listener.local_addr()?.port(),
        ));
        let report_tx = report_tx.clone();
        let key = key.clone();
        task::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            /* the sender handshake line is 87 bytes */
            let mut handshake = vec![0u8; 87];
            socket.read_exact(&mut handshake).await.unwrap();
            let expected = format!(
                "transit sender {} ready\n\n",
                key.derive_subkey_from_purpose::<GenericKey>("transit_sender")
                    .to_hex()
            );
            assert_eq!(handshake, expected.into_bytes());

            let ours = format!(
                "transit receiver {} ready\n\n",
                key.derive_subkey_from_purpose::<GenericKey>("transit_receiver")
                    .to_hex()
            );
            socket.write_all(ours.as_bytes()).await.unwrap();

            let mut verdict = [0u8; 3];
            socket.read_exact(&mut verdict).await.unwrap();
            if &verdict == b"go\n" {
                report_tx.send("go").await.unwrap();
            } else {
                let mut rest = [0u8; 7];
                socket.read_exact(&mut rest).await.unwrap();
                assert_eq!([&verdict[..], &rest[..]].concat(), b"nevermind\n");
                report_tx.send("nevermind").await.unwrap();
            }
        });
    }

    let connector = transit::init(vec![Ability::DirectTcpV1], None).await?;
    let _transit = connector
        .leader_connect(key, vec![Ability::DirectTcpV1], hints)
        .await?;

    let mut verdicts = [report_rx.recv().await?, report_rx.recv().await?];
    verdicts.sort();
    assert_eq!(verdicts, ["go", "nevermind"]);
    Ok(())
}

#[async_std::test]
async fn test_no_usable_hints() -> eyre::Result<()> {
    init_logger();
    let key = transit_key([5u8; 32]);
    let connector = transit::init(vec![Ability::RelayV1], None).await?;
    let result = connector
        .leader_connect(key, vec![Ability::RelayV1], Vec::new())
        .await;
    assert!(matches!(result, Err(TransitConnectError::Handshake)));
    Ok(())
}
