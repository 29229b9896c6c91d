//! TCP connection wrapping: handshake and encrypted framing.
//!
//! A freshly dialed or accepted connection exchanges one
//! [`ConnectionMetadata`] each way under a 10-second deadline. The side
//! that did not know its peer upfront (the server) generates the
//! connection nonce; the dialer adopts it. Both derive the same encrypt
//! key from the X25519 shared secret and the nonce, and the raw stream is
//! replaced by an [`EncryptedStream`] unless the negotiated algorithm is
//! `None`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::crypto::{
    Cipher, EncryptionAlgo, KeySchedule, PublicKey, SharedKeyCache, SigningKeyPair,
    CONN_NONCE_SIZE, ENCRYPT_KEY_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::{self, conn_key, ConnKey, ConnectionMetadata, MAX_CONN_METADATA_SIZE};

use super::HANDSHAKE_TIMEOUT;

/// Plaintext bytes carried per encrypted frame.
const MAX_FRAME_PLAINTEXT: usize = 4096;

/// Upper bound on a wire frame body, derived from the largest overhead.
const MAX_FRAME_CIPHERTEXT: usize = MAX_FRAME_PLAINTEXT + 24 + 16;

/// Shared handshake state: identity, memoized shared secrets, derived
/// per-connection keys, and the TCP-before-UDP readiness signals.
pub struct ConnWrapper {
    identity: Arc<SigningKeyPair>,
    shared_keys: SharedKeyCache,
    encrypt_keys: DashMap<ConnKey, [u8; ENCRYPT_KEY_SIZE]>,
    ready: DashMap<ConnKey, watch::Sender<bool>>,
    algo: EncryptionAlgo,
    is_server: bool,
}

impl ConnWrapper {
    pub fn new(identity: Arc<SigningKeyPair>, algo: EncryptionAlgo, is_server: bool) -> Self {
        let shared_keys = SharedKeyCache::new(&identity);
        Self {
            identity,
            shared_keys,
            encrypt_keys: DashMap::new(),
            ready: DashMap::new(),
            algo,
            is_server,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn algo(&self) -> EncryptionAlgo {
        self.algo
    }

    /// Derived encrypt key for a completed handshake, if any.
    pub fn encrypt_key(&self, key: &[u8]) -> Option<[u8; ENCRYPT_KEY_SIZE]> {
        self.encrypt_keys.get(key).map(|k| *k)
    }

    /// Watch channel that flips to `true` once the TCP handshake for this
    /// connection key has completed. The UDP mux awaits it before
    /// installing any codec.
    pub fn ready_watch(&self, key: &[u8]) -> watch::Receiver<bool> {
        self.ready
            .entry(key.to_vec())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn signal_ready(&self, key: &ConnKey) {
        let tx = self
            .ready
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0);
        let _ = tx.send(true);
    }

    /// Run the handshake on a fresh connection and wrap it.
    ///
    /// `remote_public_key` is `Some` for the dialing side that already
    /// knows who it is talking to; mismatch aborts. `local_meta` seeds
    /// extra fields (measurement mode); identity and algorithm fields are
    /// always overwritten.
    pub async fn wrap<S>(
        &self,
        conn: S,
        remote_public_key: Option<&PublicKey>,
        local_meta: Option<ConnectionMetadata>,
    ) -> Result<(TunnelConn<S>, ConnectionMetadata)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        timeout(
            HANDSHAKE_TIMEOUT,
            self.wrap_inner(conn, remote_public_key, local_meta),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout)?
    }

    async fn wrap_inner<S>(
        &self,
        mut conn: S,
        remote_public_key: Option<&PublicKey>,
        local_meta: Option<ConnectionMetadata>,
    ) -> Result<(TunnelConn<S>, ConnectionMetadata)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut local_meta = local_meta.unwrap_or_default();
        local_meta.public_key = self.identity.public_key().as_bytes().to_vec();
        local_meta.encryption_algo = self.algo;

        let nonce: Vec<u8>;
        let algo: EncryptionAlgo;
        let remote_key: PublicKey;
        let mut remote_meta;

        if let Some(expected) = remote_public_key {
            // Dialer role: the peer chooses the nonce.
            protocol::write_frame(&mut conn, &local_meta.encode()?, MAX_CONN_METADATA_SIZE)
                .await?;
            remote_meta = ConnectionMetadata::decode(
                &protocol::read_frame(&mut conn, MAX_CONN_METADATA_SIZE).await?,
            )?;

            if remote_meta.public_key != expected.as_bytes() {
                return Err(Error::PublicKeyMismatch);
            }
            if remote_meta.nonce.len() != CONN_NONCE_SIZE {
                return Err(Error::HandshakeFailed(format!(
                    "invalid nonce size {}",
                    remote_meta.nonce.len()
                )));
            }

            remote_key = *expected;
            nonce = remote_meta.nonce.clone();
            algo = if remote_meta.encryption_algo == EncryptionAlgo::None {
                EncryptionAlgo::None
            } else {
                self.algo
            };
        } else {
            // Accepting role: generate the nonce and echo the negotiated
            // algorithm back.
            nonce = crate::crypto::random_bytes::<CONN_NONCE_SIZE>().to_vec();
            local_meta.nonce = nonce.clone();

            protocol::write_frame(&mut conn, &local_meta.encode()?, MAX_CONN_METADATA_SIZE)
                .await?;
            remote_meta = ConnectionMetadata::decode(
                &protocol::read_frame(&mut conn, MAX_CONN_METADATA_SIZE).await?,
            )?;

            remote_key = PublicKey::from_slice(&remote_meta.public_key)
                .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
            // The nonce is ours either way; record it on the remote view
            // so callers see the full connection key.
            remote_meta.nonce = nonce.clone();

            algo = if self.algo == EncryptionAlgo::None {
                EncryptionAlgo::None
            } else {
                remote_meta.encryption_algo
            };
        }

        let key = conn_key(remote_key.as_bytes(), &nonce);

        let wrapped = if algo == EncryptionAlgo::None {
            TunnelConn::Plain(conn)
        } else {
            let shared = self.shared_keys.shared_key(&remote_key)?;
            let encrypt_key = KeySchedule::connection_key(&shared, &nonce);
            self.encrypt_keys.insert(key.clone(), encrypt_key);
            let cipher = Cipher::new(algo, &encrypt_key)?;
            TunnelConn::Encrypted(EncryptedStream::new(conn, cipher))
        };

        if self.is_server {
            self.signal_ready(&key);
        }

        debug!(peer = %remote_key, %algo, "connection wrapped");
        Ok((wrapped, remote_meta))
    }

    /// Drop handshake state for a connection key (session teardown).
    pub fn forget(&self, key: &[u8]) {
        self.encrypt_keys.remove(key);
        self.ready.remove(key);
    }
}

#[cfg(test)]
impl ConnWrapper {
    pub(crate) fn encrypt_keys_for_tests(
        &self,
    ) -> &DashMap<ConnKey, [u8; ENCRYPT_KEY_SIZE]> {
        &self.encrypt_keys
    }

    pub(crate) fn signal_ready_for_tests(&self, key: &[u8]) {
        self.signal_ready(&key.to_vec());
    }
}

/// A wrapped tunnel connection: raw when the negotiated algorithm is
/// `None`, framed-and-encrypted otherwise.
pub enum TunnelConn<S> {
    Plain(S),
    Encrypted(EncryptedStream<S>),
}

impl<S> TunnelConn<S> {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

impl<S> std::fmt::Debug for TunnelConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("TunnelConn::Plain(..)"),
            Self::Encrypted(_) => f.write_str("TunnelConn::Encrypted(..)"),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TunnelConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Encrypted(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TunnelConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Encrypted(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Encrypted(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Encrypted(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Framed encrypting stream.
///
/// Wire format per frame: `u32` little-endian ciphertext length ‖
/// `nonce ‖ ciphertext ‖ tag`. Plaintext is chunked at
/// [`MAX_FRAME_PLAINTEXT`] bytes.
pub struct EncryptedStream<S> {
    inner: S,
    cipher: Cipher,
    /// Raw bytes read from the wire, not yet a complete frame.
    in_buf: BytesMut,
    /// Decrypted bytes not yet handed to the reader.
    plain_buf: BytesMut,
    /// Encrypted frame bytes not yet written to the wire.
    out_buf: BytesMut,
    staging: Box<[u8; 8192]>,
}

impl<S> EncryptedStream<S> {
    pub fn new(inner: S, cipher: Cipher) -> Self {
        Self {
            inner,
            cipher,
            in_buf: BytesMut::with_capacity(2 * MAX_FRAME_CIPHERTEXT),
            plain_buf: BytesMut::new(),
            out_buf: BytesMut::with_capacity(MAX_FRAME_CIPHERTEXT + 4),
            staging: Box::new([0u8; 8192]),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> EncryptedStream<S> {
    /// Decrypt any complete frame sitting in `in_buf` into `plain_buf`.
    fn decrypt_buffered(&mut self) -> io::Result<bool> {
        if self.in_buf.len() < 4 {
            return Ok(false);
        }
        let len = u32::from_le_bytes([
            self.in_buf[0],
            self.in_buf[1],
            self.in_buf[2],
            self.in_buf[3],
        ]) as usize;
        if len == 0 || len > MAX_FRAME_CIPHERTEXT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame length {len}"),
            ));
        }
        if self.in_buf.len() < 4 + len {
            return Ok(false);
        }
        self.in_buf.advance(4);
        let frame = self.in_buf.split_to(len);
        let plain = self
            .cipher
            .open(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.plain_buf.extend_from_slice(&plain);
        Ok(true)
    }

    fn poll_drain_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out_buf.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.out_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.out_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for EncryptedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain_buf.is_empty() {
                let n = this.plain_buf.len().min(buf.remaining());
                buf.put_slice(&this.plain_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if this.decrypt_buffered()? {
                continue;
            }

            let mut staging = ReadBuf::new(&mut this.staging[..]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut staging) {
                Poll::Ready(Ok(())) => {
                    let filled = staging.filled();
                    if filled.is_empty() {
                        // EOF: clean only on a frame boundary.
                        if this.in_buf.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    this.in_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for EncryptedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // A previous frame must be fully on the wire before the next one
        // is accepted.
        match this.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let chunk = &buf[..buf.len().min(MAX_FRAME_PLAINTEXT)];
        let sealed = this
            .cipher
            .seal(chunk)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        this.out_buf
            .extend_from_slice(&(sealed.len() as u32).to_le_bytes());
        this.out_buf.extend_from_slice(&sealed);

        // Opportunistic drain; leftovers flush on the next write or flush.
        match this.poll_drain_out(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }

        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn wrappers(
        algo_client: EncryptionAlgo,
        algo_server: EncryptionAlgo,
    ) -> (Arc<ConnWrapper>, Arc<ConnWrapper>) {
        let client_id = Arc::new(SigningKeyPair::generate());
        let server_id = Arc::new(SigningKeyPair::generate());
        (
            Arc::new(ConnWrapper::new(client_id, algo_client, false)),
            Arc::new(ConnWrapper::new(server_id, algo_server, true)),
        )
    }

    async fn handshake_pair(
        client: Arc<ConnWrapper>,
        server: Arc<ConnWrapper>,
    ) -> (
        TunnelConn<tokio::io::DuplexStream>,
        TunnelConn<tokio::io::DuplexStream>,
    ) {
        let (c, s) = tokio::io::duplex(1 << 16);
        let server_key = server.public_key();
        let server_task =
            tokio::spawn(async move { server.wrap(s, None, None).await.unwrap() });
        let (client_conn, _) = client.wrap(c, Some(&server_key), None).await.unwrap();
        let (server_conn, _) = server_task.await.unwrap();
        (client_conn, server_conn)
    }

    #[tokio::test]
    async fn test_handshake_roundtrip_encrypted() {
        for algo in [EncryptionAlgo::XChaCha20Poly1305, EncryptionAlgo::Aes256Gcm] {
            let (client, server) = wrappers(algo, algo);
            let (mut c, mut s) = handshake_pair(client, server).await;
            assert!(c.is_encrypted());
            assert!(s.is_encrypted());

            c.write_all(b"through the tunnel").await.unwrap();
            c.flush().await.unwrap();
            let mut buf = [0u8; 18];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"through the tunnel");

            // And the other direction.
            s.write_all(b"reply").await.unwrap();
            s.flush().await.unwrap();
            let mut buf = [0u8; 5];
            c.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"reply");
        }
    }

    #[tokio::test]
    async fn test_handshake_none_passthrough() {
        let (client, server) = wrappers(EncryptionAlgo::None, EncryptionAlgo::XChaCha20Poly1305);
        let (c, s) = handshake_pair(client, server).await;
        assert!(!c.is_encrypted());
        assert!(!s.is_encrypted());
    }

    #[tokio::test]
    async fn test_public_key_mismatch_aborts() {
        let (client, server) = wrappers(
            EncryptionAlgo::XChaCha20Poly1305,
            EncryptionAlgo::XChaCha20Poly1305,
        );
        let (c, s) = tokio::io::duplex(1 << 16);

        let server_task = tokio::spawn(async move {
            let _ = server.wrap(s, None, None).await;
        });

        let impostor = SigningKeyPair::generate().public_key();
        let err = client.wrap(c, Some(&impostor), None).await.unwrap_err();
        assert!(matches!(err, Error::PublicKeyMismatch));
        server_task.abort();
    }

    #[tokio::test]
    async fn test_keys_agree_and_ready_signaled() {
        let (client, server) = wrappers(
            EncryptionAlgo::XChaCha20Poly1305,
            EncryptionAlgo::XChaCha20Poly1305,
        );
        let client_pk = client.public_key();
        let (c, s) = tokio::io::duplex(1 << 16);
        let server_key = server.public_key();
        let server2 = Arc::clone(&server);
        let server_task =
            tokio::spawn(async move { server2.wrap(s, None, None).await.unwrap() });
        let (_c_conn, remote_meta) = client.wrap(c, Some(&server_key), None).await.unwrap();
        let _ = server_task.await.unwrap();

        // Client indexes by server key, server by client key; both derive
        // the identical encrypt key for publicKey ‖ nonce.
        let ck = conn_key(server_key.as_bytes(), &remote_meta.nonce);
        let sk = conn_key(client_pk.as_bytes(), &remote_meta.nonce);
        assert_eq!(client.encrypt_key(&ck).unwrap(), server.encrypt_key(&sk).unwrap());

        let ready = server.ready_watch(&sk);
        assert!(*ready.borrow());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let client_id = Arc::new(SigningKeyPair::generate());
        let wrapper = ConnWrapper::new(client_id, EncryptionAlgo::XChaCha20Poly1305, false);
        let (c, _s) = tokio::io::duplex(1 << 16);
        let peer = SigningKeyPair::generate().public_key();

        // Nobody answers; the 10 s deadline must fire. Use a paused clock
        // so the test is instant.
        tokio::time::pause();
        let err = wrapper.wrap(c, Some(&peer), None).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout));
    }

    #[tokio::test]
    async fn test_large_transfer_chunked() {
        let (client, server) = wrappers(
            EncryptionAlgo::Aes256Gcm,
            EncryptionAlgo::Aes256Gcm,
        );
        let (mut c, mut s) = handshake_pair(client, server).await;

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            c.write_all(&payload).await.unwrap();
            c.flush().await.unwrap();
            c
        });

        let mut received = vec![0u8; expected.len()];
        s.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }
}
