//! The inbound byte stream, plaintext or TLS, with a small internal read
//! buffer to reduce syscalls.

use std::{fs::File, io::BufReader, sync::Arc};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite,
    },
    server::TlsStream,
    TlsAcceptor,
};

use crate::{
    error::{ConnectionResult, TlsError, TlsResult},
    extensions::TlsContext,
};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("protocol version".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::ProtocolInfoMissing("cipher suite".to_string()))?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version.as_str().unwrap_or_default().to_string()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.ciphers.suite().as_str().unwrap_or_default().to_string()
    }
}

pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain {
        stream: Stream,
        read_buf: Vec<u8>,
        read_pos: usize,
        read_len: usize,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        read_buf: Vec<u8>,
        read_pos: usize,
        read_len: usize,
    },
    /// Placeholder while the stream is moved out for a TLS upgrade, and
    /// the terminal state after that upgrade fails.
    Closed,
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    /// Stand-in value used while an upgrade owns the real stream.
    pub(crate) const fn placeholder() -> Self {
        Self::Closed
    }

    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> ConnectionResult<usize> {
        match self {
            Self::Plain { stream, .. } => stream.write_all(bytes).await?,
            Self::Tls { stream, .. } => stream.write_all(bytes).await?,
            Self::Closed => return Err(closed_error().into()),
        }
        Ok(bytes.len())
    }

    pub(crate) async fn flush(&mut self) -> ConnectionResult<()> {
        match self {
            Self::Plain { stream, .. } => stream.flush().await?,
            Self::Tls { stream, .. } => stream.flush().await?,
            Self::Closed => return Err(closed_error().into()),
        }
        Ok(())
    }

    fn load_certs<P: AsRef<std::path::Path>>(
        path: &P,
    ) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_keys<P: AsRef<std::path::Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = path.as_ref().display().to_string();
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }

    /// Perform the STARTTLS upgrade, discarding any buffered plaintext.
    pub(crate) async fn upgrade(self, tls_context: &TlsContext) -> TlsResult<(Self, TlsInfo)> {
        tracing::debug!("Upgrading connection ...");

        let certs =
            Self::load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
                path: tls_context.certificate.display().to_string(),
                source: e,
            })?;
        let keys = Self::load_keys(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, keys)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));

        match self {
            Self::Plain { stream, .. } => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;

                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                        read_buf: Vec::new(),
                        read_pos: 0,
                        read_len: 0,
                    },
                    info,
                ))
            }
            Self::Tls { .. } | Self::Closed => Err(TlsError::ProtocolInfoMissing(
                "Connection is not in a plaintext state".to_string(),
            )),
        }
    }

    /// Fill `buf` from the internal buffer, refilling from the stream
    /// when drained. Returns 0 at EOF.
    pub(crate) async fn receive(&mut self, buf: &mut [u8]) -> ConnectionResult<usize> {
        match self {
            Self::Plain {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => Self::buffered_read(stream, read_buf, read_pos, read_len, buf).await,
            Self::Tls {
                stream,
                read_buf,
                read_pos,
                read_len,
            } => Self::buffered_read(stream, read_buf, read_pos, read_len, buf).await,
            Self::Closed => Err(closed_error().into()),
        }
    }

    async fn buffered_read<S: AsyncRead + Unpin>(
        stream: &mut S,
        read_buf: &mut Vec<u8>,
        read_pos: &mut usize,
        read_len: &mut usize,
        buf: &mut [u8],
    ) -> ConnectionResult<usize> {
        if *read_pos < *read_len {
            let available = *read_len - *read_pos;
            let to_copy = available.min(buf.len());
            buf[..to_copy].copy_from_slice(&read_buf[*read_pos..*read_pos + to_copy]);
            *read_pos += to_copy;
            return Ok(to_copy);
        }

        if read_buf.is_empty() {
            read_buf.resize(BUFFER_SIZE, 0);
        }

        let bytes_read = stream.read(read_buf).await?;
        *read_pos = 0;
        *read_len = bytes_read;

        let to_copy = bytes_read.min(buf.len());
        buf[..to_copy].copy_from_slice(&read_buf[..to_copy]);
        *read_pos = to_copy;
        Ok(to_copy)
    }
}
