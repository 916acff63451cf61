//! Async frame reader/writer over any `AsyncRead`/`AsyncWrite` stream

use super::protocol::{Frame, FrameType, Request, Response, RspInfo};
use crate::error::{HubError, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;

/// Buffers incoming bytes and yields complete [`Frame`]s
///
/// `read_frame` is cancel-safe: partially received bytes stay buffered.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
        }
    }

    /// Read the next frame. Returns `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(frame));
            }

            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| HubError::Connection(format!("Receive failed: {}", e)))?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HubError::Connection(
                    "Connection closed with incomplete frame".to_string(),
                ));
            }
        }
    }

    /// Read a reply to a request: a response, or an error frame turned into `Err`
    pub async fn read_response(&mut self) -> Result<Response> {
        let frame = self
            .read_frame()
            .await?
            .ok_or_else(|| HubError::Connection("Connection closed before reply".to_string()))?;

        match frame.frame_type {
            FrameType::Response => frame.json(),
            FrameType::Error => {
                let info: RspInfo = frame.json()?;
                Err(HubError::Remote {
                    code: info.error_id,
                    message: info.error_msg,
                })
            }
            other => Err(HubError::Protocol(format!(
                "Expected response, got {:?} frame",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
        }
    }

    /// Write a frame and flush
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        frame.encode(&mut self.buf)?;
        self.inner
            .write_all(&self.buf)
            .await
            .map_err(|e| HubError::Connection(format!("Send failed: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| HubError::Connection(format!("Send failed: {}", e)))?;
        Ok(())
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        self.write_frame(&Frame::request(request)?).await
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        self.write_frame(&Frame::response(response)?).await
    }

    pub async fn write_error(&mut self, info: &RspInfo) -> Result<()> {
        self.write_frame(&Frame::error(info)?).await
    }

    /// Send a close frame and shut down the write half
    pub async fn close(&mut self) -> Result<()> {
        self.write_frame(&Frame::close()).await?;
        self.inner
            .shutdown()
            .await
            .map_err(|e| HubError::Connection(format!("Shutdown failed: {}", e)))
    }
}

/// Combined frame reader + writer over a split stream
#[derive(Debug)]
pub struct FrameCodec<R, W> {
    pub reader: FrameReader<R>,
    pub writer: FrameWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FrameCodec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }
}
