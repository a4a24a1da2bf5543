use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::http_shared::{Headers, RelayBody, empty_body};

const RELAY_CHANNEL_CAP: usize = 16;
const READ_BUF: usize = 16 * 1024;
// chunk-size line plus extensions
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    pub fn for_response(method: &Method, status: u16, headers: &Headers) -> Self {
        if method == Method::HEAD || (100..200).contains(&status) || status == 204 || status == 304 {
            return BodyFraming::Empty;
        }
        let chunked = headers
            .get("transfer-encoding")
            .and_then(|v| v.rsplit(',').next())
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return BodyFraming::Chunked;
        }
        match headers.get("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    UntilClose,
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Done,
}

/// Incremental body decoder: raw socket bytes in, payload chunks out.
#[derive(Debug)]
struct BodyDecoder {
    state: State,
    buf: BytesMut,
}

impl BodyDecoder {
    fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty | BodyFraming::Length(0) => State::Done,
            BodyFraming::Length(n) => State::Length { remaining: n },
            BodyFraming::Chunked => State::ChunkSize,
            BodyFraming::UntilClose => State::UntilClose,
        };
        Self { state, buf: BytesMut::new() }
    }

    fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn feed(&mut self, data: &[u8], out: &mut Vec<Bytes>) -> io::Result<()> {
        match self.state {
            State::Done => Ok(()),
            State::UntilClose => {
                out.push(Bytes::copy_from_slice(data));
                Ok(())
            }
            State::Length { remaining } => {
                let take = remaining.min(data.len() as u64) as usize;
                if take > 0 {
                    out.push(Bytes::copy_from_slice(&data[..take]));
                }
                let left = remaining - take as u64;
                self.state = if left == 0 { State::Done } else { State::Length { remaining: left } };
                Ok(())
            }
            _ => {
                self.buf.extend_from_slice(data);
                self.decode_chunked(out)
            }
        }
    }

    fn decode_chunked(&mut self, out: &mut Vec<Bytes>) -> io::Result<()> {
        loop {
            match self.state {
                State::ChunkSize => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((used, size))) => {
                        self.buf.advance(used);
                        self.state = if size == 0 { State::Trailers } else { State::ChunkData { remaining: size } };
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk size line too long"));
                        }
                        return Ok(());
                    }
                    Err(_) => {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"));
                    }
                },
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    out.push(self.buf.split_to(take).freeze());
                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::ChunkDataEnd } else { State::ChunkData { remaining: left } };
                }
                State::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk missing CRLF terminator"));
                    }
                    self.buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => match memmem::find(&self.buf, b"\r\n") {
                    None => return Ok(()),
                    Some(0) => {
                        self.buf.advance(2);
                        self.state = State::Done;
                    }
                    Some(pos) => self.buf.advance(pos + 2),
                },
                State::Done | State::Length { .. } | State::UntilClose => return Ok(()),
            }
        }
    }

    /// Called when the source reports end of stream.
    fn finish(&self) -> io::Result<()> {
        match self.state {
            State::Done | State::UntilClose => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response body completed",
            )),
        }
    }
}

type FrameSender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

// false once the consumer has dropped the body
async fn forward(tx: &FrameSender, out: &mut Vec<Bytes>) -> bool {
    for chunk in out.drain(..) {
        if tx.send(Ok(Frame::data(chunk))).await.is_err() {
            return false;
        }
    }
    true
}

async fn pump<R>(mut source: R, overrun: Bytes, framing: BodyFraming, tx: &FrameSender) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = BodyDecoder::new(framing);
    let mut out = Vec::new();
    if !overrun.is_empty() {
        decoder.feed(&overrun, &mut out)?;
        if !forward(tx, &mut out).await {
            return Ok(());
        }
    }
    let mut buf = vec![0u8; READ_BUF];
    while !decoder.is_done() {
        let n = tokio::select! {
            _ = tx.closed() => return Ok(()),
            r = source.read(&mut buf) => r?,
        };
        if n == 0 {
            return decoder.finish();
        }
        decoder.feed(&buf[..n], &mut out)?;
        if !forward(tx, &mut out).await {
            return Ok(());
        }
    }
    Ok(())
}

/// Hand back a body stream immediately while a spawned task copies the rest
/// of `source` into it. `overrun` (bytes already read past the head) comes
/// first. Dropping the returned body closes the sink; the task then stops
/// reading and releases the connection.
pub fn relay_body<R>(source: R, overrun: Bytes, framing: BodyFraming) -> RelayBody
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if matches!(framing, BodyFraming::Empty | BodyFraming::Length(0)) {
        return empty_body();
    }
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(RELAY_CHANNEL_CAP);
    tokio::spawn(async move {
        if let Err(e) = pump(source, overrun, framing, &tx).await {
            tracing::debug!(error = %e, "response body relay aborted");
            let _ = tx.send(Err(e)).await;
        }
    });
    StreamBody::new(ReceiverStream::new(rx)).boxed_unsync()
}
