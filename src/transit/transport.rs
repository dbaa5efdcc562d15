//! Framing and TCP plumbing for Transit connections
//!
//! Transit messages on the wire are length-prefixed: a four byte big-endian
//! length followed by that many payload bytes. The reader side reassembles
//! records from whatever chunk sizes TCP delivers.

use super::{DirectHint, Hint, TransitError, TransitHandshakeError, CONNECT_TIMEOUT};

use async_std::net::TcpStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::*;
use std::net::{IpAddr, SocketAddr};

#[async_trait]
pub(super) trait TransitTransportRx: AsyncRead + Unpin + Send {
    /// Consume exactly the given bytes from the stream. Anything else on the
    /// wire fails this candidate's handshake.
    async fn read_expect(&mut self, expected: &[u8]) -> Result<(), TransitHandshakeError> {
        let mut received = vec![0u8; expected.len()];
        self.read_exact(&mut received).await?;
        ensure!(received == expected, TransitHandshakeError::HandshakeFailed);
        Ok(())
    }

    /// Read one record off the stream: a big-endian `u32` announcing the
    /// payload size, then the payload. TCP chunk boundaries are invisible
    /// here; `read_exact` polls until the frame is whole, and a stream that
    /// ends mid-frame surfaces as `UnexpectedEof`.
    async fn read_record(&mut self, max_length: usize) -> Result<Vec<u8>, TransitError> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header).await?;
        let length = u32::from_be_bytes(header) as usize;

        /* The length field is attacker-controlled until the MAC check passes;
         * cap it before allocating anything. */
        ensure!(
            length <= max_length,
            TransitError::RecordTooLarge(length as u64, max_length as u64)
        );

        let mut record = vec![0u8; length];
        self.read_exact(&mut record).await?;
        Ok(record)
    }
}

#[async_trait]
pub(super) trait TransitTransportTx: AsyncWrite + Unpin + Send {
    /// Write one length-prefixed record.
    async fn write_record(&mut self, payload: &[u8]) -> Result<(), std::io::Error> {
        self.write_all(&u32::to_be_bytes(payload.len() as u32))
            .await?;
        self.write_all(payload).await
    }
}

impl<T> TransitTransportRx for T where T: AsyncRead + Unpin + Send {}
impl<T> TransitTransportTx for T where T: AsyncWrite + Unpin + Send {}

/**
 * Ask the kernel for a free TCP port.
 *
 * The probe socket binds on loopback, reports its port and is dropped right
 * away; [`init`](super::init) then re-binds that port on the wildcard address
 * for the real listener. The address-reuse flags cover the gap between the
 * two binds.
 */
pub(super) fn allocate_tcp_port() -> std::io::Result<u16> {
    use socket2::{Domain, Socket, Type};

    let probe = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    probe.set_reuse_address(true)?;
    /* Linux and the BSDs additionally want SO_REUSEPORT for the re-bind;
     * Windows only knows SO_REUSEADDR, and on Solaris descendants the flag
     * does not exist at all. */
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    probe.set_reuse_port(true)?;

    probe.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())?;
    let port = probe
        .local_addr()?
        .as_socket()
        .expect("Internal error: bound a TCP socket to a non-IP address")
        .port();
    Ok(port)
}

/// One direct hint per non-loopback IPv4 address of a local interface.
pub(super) fn local_direct_hints(port: u16) -> std::io::Result<Vec<Hint>> {
    Ok(if_addrs::get_if_addrs()?
        .iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(ip) => Some(Hint::new_direct(0.0, &ip.to_string(), port)),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// TCP connect with a bounded timeout. A timeout only costs this candidate.
pub(super) async fn connect_direct(hint: &DirectHint) -> Result<TcpStream, TransitHandshakeError> {
    debug!("Connecting to {}:{}", hint.hostname, hint.port);
    let socket = crate::util::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((hint.hostname.as_str(), hint.port)),
    )
    .await
    .map_err(|_| TransitHandshakeError::ConnectionTimedOut)??;
    debug!("Connected to {}:{}!", hint.hostname, hint.port);
    Ok(socket)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    /// Delivers a fixed byte sequence in chunks of at most `chunk` bytes,
    /// mimicking how TCP may split records arbitrarily.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf
                .len()
                .min(self.chunk)
                .min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    fn frame(records: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&(record.len() as u32).to_be_bytes());
            data.extend_from_slice(record);
        }
        data
    }

    #[async_std::test]
    async fn test_reassembly_from_arbitrary_chunks() {
        let records: &[&[u8]] = &[b"first record", b"", b"x", &[0xaa; 300]];
        let data = frame(records);

        for chunk in 1..=data.len() {
            let mut stream = Trickle {
                data: data.clone(),
                pos: 0,
                chunk,
            };
            for record in records {
                let read = stream.read_record(1024).await.unwrap();
                assert_eq!(&read[..], *record, "chunk size {}", chunk);
            }
        }
    }

    #[async_std::test]
    async fn test_eof_mid_record() {
        let mut data = frame(&[b"whole message"]);
        data.truncate(data.len() - 5);

        let mut stream = Trickle {
            data,
            pos: 0,
            chunk: 4,
        };
        match stream.read_record(1024).await {
            Err(TransitError::IO(error)) => {
                assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof)
            },
            other => panic!("expected EOF error, got {:?}", other),
        }
    }

    #[async_std::test]
    async fn test_oversize_record_is_rejected_early() {
        let mut data = Vec::new();
        data.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut stream = Trickle {
            data,
            pos: 0,
            chunk: 4,
        };
        assert!(matches!(
            stream.read_record(1024 * 1024).await,
            Err(TransitError::RecordTooLarge(_, _))
        ));
    }

    #[async_std::test]
    async fn test_write_read_roundtrip() {
        let mut wire = Vec::new();
        wire.write_record(b"ping").await.unwrap();
        wire.write_record(b"pong").await.unwrap();

        let mut stream = futures::io::Cursor::new(wire);
        assert_eq!(&*stream.read_record(1024).await.unwrap(), b"ping");
        assert_eq!(&*stream.read_record(1024).await.unwrap(), b"pong");
    }

    #[async_std::test]
    async fn test_read_expect() {
        let mut stream = futures::io::Cursor::new(b"ok\nno".to_vec());
        stream.read_expect(b"ok\n").await.unwrap();
        assert!(matches!(
            stream.read_expect(b"go").await,
            Err(TransitHandshakeError::HandshakeFailed)
        ));
    }
}
