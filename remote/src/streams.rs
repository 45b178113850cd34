use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::instrument;

/// Largest buffer growth step while receiving raw data.
const RECV_STEP: usize = 64 * 1024;

/// Framed send stream for length-delimited messages.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    pub async fn send_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bitcode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Sends an object followed by `data` written raw, outside of any frame.
    ///
    /// The receiver must know the length of `data` from the object itself.
    #[instrument(level = "trace", skip(self, obj, data), fields(size = data.len()))]
    pub async fn send_message_with_data<T: serde::Serialize>(
        &mut self,
        obj: &T,
        data: &[u8],
    ) -> anyhow::Result<()> {
        self.send_message(obj).await?;
        let data_stream = self.framed.get_mut();
        data_stream.write_all(data).await?;
        data_stream.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Returns `None` once the peer closed the connection.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bitcode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// Reads the `size` raw bytes following the last frame.
    ///
    /// This does NOT read until EOF, the stream stays usable for subsequent messages. If the peer
    /// closes the connection early, the bytes received so far are returned and it's up to the
    /// caller to compare the length against `size`. The buffer grows with the received data, so a
    /// bogus `size` costs nothing until the bytes actually arrive.
    #[instrument(level = "trace", skip(self))]
    pub async fn recv_data(&mut self, size: u64) -> anyhow::Result<bytes::Bytes> {
        let mut data = bytes::BytesMut::new();
        // the framed reader may already hold the beginning of the data
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = read_buffer.len().min(usize::try_from(size).unwrap_or(usize::MAX));
        if buffered > 0 {
            data.extend_from_slice(&read_buffer[..buffered]);
            read_buffer.advance(buffered);
        }
        let mut limited = self.framed.get_mut().take(size - data.len() as u64);
        while limited.limit() > 0 {
            let step = usize::try_from(limited.limit()).unwrap_or(usize::MAX).min(RECV_STEP);
            data.reserve(step);
            let n = limited.read_buf(&mut data).await?;
            if n == 0 {
                break;
            }
        }
        Ok(data.freeze())
    }

    /// Reads and throws away everything until the peer closes the connection.
    pub async fn drain(&mut self) -> anyhow::Result<u64> {
        let buffered = self.framed.read_buffer().len() as u64;
        self.framed.read_buffer_mut().clear();
        let drained = tokio::io::copy(self.framed.get_mut(), &mut tokio::io::sink()).await?;
        Ok(buffered + drained)
    }
}

/// Both halves of one TCP connection.
#[derive(Debug)]
pub struct Connection {
    pub send: SendStream,
    pub recv: RecvStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
        }
    }
}
