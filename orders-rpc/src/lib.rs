use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
pub mod server;

/// Envelope version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single encoded envelope.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to bind to address {}: {}", address, source))]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to accept connection: {}", source))]
    AcceptFailed { source: std::io::Error },

    #[snafu(display("Server address is required"))]
    AddressRequired,

    #[snafu(display("Failed to connect to server: {}", source))]
    ConnectFailed { source: std::io::Error },

    #[snafu(display("Connection to server is closed"))]
    ConnectionClosed,

    #[snafu(display("Connection closed before a response arrived: {}", source))]
    RecvFailed {
        source: tokio::sync::oneshot::error::RecvError,
    },

    #[snafu(display("Failed to write frame: {}", source))]
    WriteFailed { source: std::io::Error },

    #[snafu(display("Failed to read frame: {}", source))]
    ReadFailed { source: std::io::Error },

    #[snafu(display("Connection broke off mid-frame: {}", source))]
    TruncatedFrame { source: std::io::Error },

    #[snafu(display("Failed to serialize: {}", source))]
    SerializeFailed { source: bincode::Error },

    #[snafu(display("Failed to deserialize: {}", source))]
    DeserializeFailed { source: bincode::Error },

    #[snafu(display("Frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN))]
    FrameTooLarge { len: usize },

    #[snafu(display("RPC failed with {}", status))]
    Status { status: RPCStatus },
}

impl Error {
    /// True when the peer closed the stream at a frame boundary. A close
    /// partway through a frame is [`Error::TruncatedFrame`] instead.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ReadFailed { source } if source.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }

    /// The remote status carried by this error, if the call reached a handler.
    pub fn status(&self) -> Option<&RPCStatus> {
        match self {
            Error::Status { status } => Some(status),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RPCStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RPCStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn unimplemented(service: &str, method: &str) -> Self {
        Self::new(
            StatusCode::Unimplemented,
            format!("unknown method {}/{}", service, method),
        )
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for RPCStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    Unimplemented,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

/// One request or response on the wire.
///
/// Requests leave `status` empty; the server always fills it in on the reply
/// and echoes the request's sequence number, service and method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RPCEnvelope {
    pub version: u8,
    pub sequence_number: u64,
    pub service_name: String,
    pub method_name: String,
    pub status: Option<RPCStatus>,
    pub payload: Vec<u8>,
}

impl RPCEnvelope {
    pub fn request(sequence_number: u64, service: &str, method: &str, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence_number,
            service_name: service.to_string(),
            method_name: method.to_string(),
            status: None,
            payload,
        }
    }

    /// Builds the reply to `self`, carrying `status` and `payload`.
    pub fn reply(&self, status: RPCStatus, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence_number: self.sequence_number,
            service_name: self.service_name.clone(),
            method_name: self.method_name.clone(),
            status: Some(status),
            payload,
        }
    }
}

pub fn encode_payload<T: Serialize>(value: T) -> Result<Vec<u8>> {
    bincode::serialize(&value).context(SerializeFailedSnafu)
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: Vec<u8>) -> Result<T> {
    bincode::deserialize(&payload).context(DeserializeFailedSnafu)
}

/// Writes `envelope` as a big-endian length prefix followed by its bincode bytes.
pub async fn write_frame<W>(writer: &mut W, envelope: &RPCEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(envelope).context(SerializeFailedSnafu)?;
    ensure!(
        bytes.len() <= MAX_FRAME_LEN,
        FrameTooLargeSnafu { len: bytes.len() }
    );
    // One write for prefix and body so the prefix never sits alone in a segment.
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&bytes);
    writer.write_all(&frame).await.context(WriteFailedSnafu)?;
    writer.flush().await.context(WriteFailedSnafu)?;
    Ok(())
}

pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let first = reader.read(&mut prefix).await.context(ReadFailedSnafu)?;
    if first == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            .context(ReadFailedSnafu);
    }
    reader
        .read_exact(&mut prefix[first..])
        .await
        .context(TruncatedFrameSnafu)?;

    let len = u32::from_be_bytes(prefix) as usize;
    ensure!(len <= MAX_FRAME_LEN, FrameTooLargeSnafu { len });
    let mut frame = vec![0; len];
    reader
        .read_exact(&mut frame)
        .await
        .context(TruncatedFrameSnafu)?;
    Ok(frame)
}

pub async fn read_envelope<R>(reader: &mut R) -> Result<RPCEnvelope>
where
    R: AsyncRead + Unpin,
{
    let frame = read_raw_frame(reader).await?;
    bincode::deserialize(&frame).context(DeserializeFailedSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_carries_envelope() {
        let (mut left, mut right) = tokio::io::duplex(1024);
        let request = RPCEnvelope::request(7, "orders.OrderService", "CreateOrder", vec![1, 2, 3]);

        write_frame(&mut left, &request).await.unwrap();
        let received = read_envelope(&mut right).await.unwrap();

        assert_eq!(received, request);
        assert_eq!(received.version, PROTOCOL_VERSION);
        assert!(received.status.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();

        match read_raw_frame(&mut right).await {
            Err(Error::FrameTooLarge { len }) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_close_is_a_disconnect() {
        let (left, mut right) = tokio::io::duplex(64);
        drop(left);

        let err = read_raw_frame(&mut right).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_close_inside_prefix_is_truncated() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_all(&[0, 0]).await.unwrap();
        drop(left);

        let err = read_raw_frame(&mut right).await.unwrap_err();
        assert!(matches!(err, Error::TruncatedFrame { .. }));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn test_close_inside_body_is_truncated() {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_u32(10).await.unwrap();
        left.write_all(&[1, 2, 3]).await.unwrap();
        drop(left);

        let err = read_raw_frame(&mut right).await.unwrap_err();
        assert!(matches!(err, Error::TruncatedFrame { .. }));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversized_envelope_is_not_written() {
        let (mut left, mut right) = tokio::io::duplex(64);
        let request = RPCEnvelope::request(1, "Data", "dump", vec![0; MAX_FRAME_LEN + 1]);

        let err = write_frame(&mut left, &request).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len } if len > MAX_FRAME_LEN));

        // Nothing reached the peer
        drop(left);
        assert!(read_raw_frame(&mut right).await.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn test_frames_written_back_to_back_are_read_in_order() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        for seq in 1..=3 {
            let request = RPCEnvelope::request(seq, "Svc", "m", vec![seq as u8; 100]);
            write_frame(&mut left, &request).await.unwrap();
        }

        for seq in 1..=3 {
            let received = read_envelope(&mut right).await.unwrap();
            assert_eq!(received.sequence_number, seq);
            assert_eq!(received.payload, vec![seq as u8; 100]);
        }
    }

    #[test]
    fn test_reply_echoes_request_identity() {
        let request = RPCEnvelope::request(42, "Svc", "Method", vec![9]);
        let reply = request.reply(RPCStatus::unimplemented("Svc", "Method"), Vec::new());

        assert_eq!(reply.sequence_number, 42);
        assert_eq!(reply.service_name, "Svc");
        assert_eq!(reply.method_name, "Method");
        assert_eq!(
            reply.status.as_ref().map(|s| s.code),
            Some(StatusCode::Unimplemented)
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RPCStatus::ok().to_string(), "Ok");
        assert_eq!(
            RPCStatus::unimplemented("A", "b").to_string(),
            "Unimplemented: unknown method A/b"
        );
    }

    #[test]
    fn test_payload_codec_roundtrip() {
        let bytes = encode_payload(("order-1".to_string(), 3u32)).unwrap();
        let decoded: (String, u32) = decode_payload(bytes).unwrap();
        assert_eq!(decoded, ("order-1".to_string(), 3));
    }
}
