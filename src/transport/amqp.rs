//! AMQP transport binding (direct TCP and WebSocket-tunneled)
//!
//! Frame encoding beyond the protocol header exchange is delegated to the
//! session layer; this binding owns the socket lifecycle, the header
//! handshake, and the WebSocket upgrade for the tunneled variant. Payloads
//! cross the wire length-prefixed.

use super::{TransportBinding, TransportError, TransportEvent, TransportKind, TransportSettings};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// AMQP 1.0 SASL protocol header
const AMQP_SASL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 3, 1, 0, 0];

pub struct AmqpBinding {
    settings: TransportSettings,
    stream: Option<BufReader<TcpStream>>,
}

impl AmqpBinding {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            stream: None,
        }
    }

    async fn open_socket(&self) -> Result<TcpStream, TransportError> {
        let addr = (self.settings.hostname.as_str(), self.settings.port);
        let stream = tokio::time::timeout(self.settings.operation_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: format!("tcp connect to {}:{}", self.settings.hostname, self.settings.port),
            })?
            .map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(stream)
    }

    /// RFC 6455 client upgrade handshake for the tunneled variant. Failures
    /// here wrap their cause so a TLS rejection stays recognizable below the
    /// upgrade layer.
    async fn upgrade_websocket(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let key = BASE64.encode(nonce);

        let request = format!(
            "GET /$iothub/websocket HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Protocol: AMQPWSB10\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            self.settings.hostname, self.settings.port, key
        );

        let upgrade = async {
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(TransportError::Io)?;

            let mut response = Vec::with_capacity(512);
            let mut byte = [0u8; 1];
            while !response.ends_with(b"\r\n\r\n") {
                let n = stream.read(&mut byte).await.map_err(TransportError::Io)?;
                if n == 0 {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during websocket upgrade",
                    )));
                }
                response.extend_from_slice(&byte);
                if response.len() > 16 * 1024 {
                    return Err(TransportError::protocol_msg("oversized upgrade response"));
                }
            }

            let status_line = String::from_utf8_lossy(&response);
            if !status_line.starts_with("HTTP/1.1 101") {
                let status = status_line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(0);
                return Err(TransportError::Rejected {
                    status,
                    permanent: matches!(status, 401 | 403 | 404),
                    message: "websocket upgrade refused".to_string(),
                });
            }
            Ok(())
        };

        upgrade.await.map_err(|e| TransportError::WebSocketUpgrade {
            source: Box::new(e),
        })
    }

    async fn exchange_protocol_header(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(), TransportError> {
        stream
            .write_all(&AMQP_SASL_HEADER)
            .await
            .map_err(TransportError::Io)?;

        let mut echo = [0u8; 8];
        tokio::time::timeout(self.settings.operation_timeout, stream.read_exact(&mut echo))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "amqp protocol header exchange".to_string(),
            })?
            .map_err(TransportError::Io)?;

        if &echo[..4] != b"AMQP" {
            return Err(TransportError::protocol_msg(format!(
                "unexpected protocol header: {echo:02x?}"
            )));
        }
        debug!("amqp protocol header negotiated: {:02x?}", echo);
        Ok(())
    }
}

#[async_trait]
impl TransportBinding for AmqpBinding {
    fn kind(&self) -> TransportKind {
        self.settings.kind
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Err(TransportError::protocol_msg(
                "connect attempt already outstanding",
            ));
        }

        let mut stream = self.open_socket().await?;
        if self.settings.kind == TransportKind::AmqpWebSocket {
            self.upgrade_websocket(&mut stream).await?;
        }
        self.exchange_protocol_header(&mut stream).await?;

        info!(
            device_id = %self.settings.device_id,
            kind = %self.settings.kind,
            "AMQP connection established"
        );
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| TransportError::protocol_msg("payload exceeds frame limit"))?;
        stream
            .get_mut()
            .write_all(&len.to_be_bytes())
            .await
            .map_err(TransportError::Io)?;
        stream
            .get_mut()
            .write_all(&payload)
            .await
            .map_err(TransportError::Io)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let mut len_bytes = [0u8; 4];
        stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(TransportError::Io)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > 1024 * 1024 {
            return Err(TransportError::protocol_msg(format!(
                "inbound frame too large: {len} bytes"
            )));
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(TransportError::Io)?;
        Ok(TransportEvent::Message(Bytes::from(payload)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.get_mut().shutdown().await {
                warn!("amqp socket shutdown failed: {}", e);
            }
        }
        Ok(())
    }
}
