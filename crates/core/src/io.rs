use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Counts bytes passing through an `AsyncRead`.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.count += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

/// Counts bytes accepted by an `AsyncWrite`.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.count += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reads up to `limit` bytes, stopping early only at end of stream.
pub async fn read_chunk<R>(reader: &mut R, limit: u64) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(usize::try_from(limit).unwrap_or(usize::MAX).min(1 << 22));
    reader.take(limit).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn counting_reader_tracks_bytes() {
        let data = vec![7u8; 10_000];
        let mut reader = CountingReader::new(&data[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(reader.count(), 10_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn counting_writer_tracks_bytes() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.count(), 11);
    }

    #[tokio::test]
    async fn read_chunk_stops_at_limit_or_eof() {
        let data = b"abcdefgh".to_vec();
        let mut reader = &data[..];
        assert_eq!(read_chunk(&mut reader, 3).await.unwrap(), b"abc");
        assert_eq!(read_chunk(&mut reader, 100).await.unwrap(), b"defgh");
        assert!(read_chunk(&mut reader, 100).await.unwrap().is_empty());
    }
}
