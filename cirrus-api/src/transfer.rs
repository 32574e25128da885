//! Moving payload bytes between sources, sinks and the wire
//!
//! Uploads read the source in fixed chunks and hand them to the transport
//! over a bounded channel, so progress follows what the transport actually
//! consumed. Downloads write each body chunk to the sink as it arrives.
//! Either way a failed transfer fails as a whole; nothing is resumed.

use bytes::{Bytes, BytesMut};
use cirrus_core::{
    ApiError, ApiRequest, ApiResponse, ApiResult, ByteStream, DataReader, DataSink,
    ProgressTracker, RequestBody, Transport,
};
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Upload chunk size
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Per-step deadlines. `None` disables a deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// Await `future`, failing with a timeout error after `limit`.
pub async fn within<F: Future>(limit: Option<Duration>, what: &str, future: F) -> ApiResult<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| ApiError::timeout(format!("{what} timed out after {limit:?}"))),
        None => Ok(future.await),
    }
}

/// Wrap a body so that every chunk has to arrive within `read`.
pub fn with_read_deadline(body: ByteStream, read: Option<Duration>) -> ByteStream {
    let Some(limit) = read else {
        return body;
    };
    let stream = futures::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(limit, body.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(ApiError::timeout(format!("read timed out after {limit:?}"))),
                None,
            )),
        }
    });
    Box::pin(stream)
}

/// Buffer a whole response body under the read deadline.
pub async fn read_body(response: ApiResponse, read: Option<Duration>) -> ApiResult<Bytes> {
    let mut body = with_read_deadline(response.body, read);
    let mut out = BytesMut::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out.freeze())
}

/// Sending half of an upload body
pub type BodySender = mpsc::Sender<ApiResult<Bytes>>;

/// Request body fed through a channel of one chunk.
pub fn body_channel(length: Option<u64>, content_type: &str) -> (BodySender, RequestBody) {
    let (tx, rx) = mpsc::channel::<ApiResult<Bytes>>(1);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let body = RequestBody {
        stream: Box::pin(stream),
        length,
        content_type: content_type.to_string(),
    };
    (tx, body)
}

/// Read `reader` to the end and push it into the body channel.
///
/// The tracker is advanced as soon as a chunk was read, before it is
/// handed to the body channel, so an overrun is caught before the extra
/// bytes go out. Reports can run one chunk ahead of the transport. On failure the body stream is poisoned so the transport does not send a
/// truncated payload as if it were complete.
pub async fn pump_source(
    mut reader: DataReader,
    tx: BodySender,
    tracker: &mut ProgressTracker,
    write: Option<Duration>,
) -> ApiResult<()> {
    loop {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        let read = match reader.read_buf(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                let _ = tx.try_send(Err(ApiError::protocol("upload source failed")));
                return Err(e.into());
            }
        };
        if read == 0 {
            return Ok(());
        }

        if let Err(e) = tracker.advance(read as u64) {
            let _ = tx.try_send(Err(ApiError::protocol("upload source overran its length")));
            return Err(e);
        }
        within(write, "write", tx.send(Ok(buf.freeze())))
            .await?
            .map_err(|_| ApiError::protocol("transport stopped reading the upload body"))?;
    }
}

/// Send a request whose body is pumped from `reader`.
///
/// The read deadline only starts once the whole body was handed over. If
/// the server answers before consuming everything, its answer is returned
/// as is and the caller decides what it means.
pub async fn send_upload(
    transport: &dyn Transport,
    request: ApiRequest,
    reader: DataReader,
    tx: BodySender,
    tracker: &mut ProgressTracker,
    deadlines: Deadlines,
) -> ApiResult<ApiResponse> {
    let send = transport.send(request);
    tokio::pin!(send);

    let early = {
        let pump = pump_source(reader, tx, tracker, deadlines.write);
        tokio::pin!(pump);
        tokio::select! {
            response = &mut send => Some(response),
            pumped = &mut pump => {
                pumped?;
                None
            }
        }
    };

    match early {
        Some(response) => response,
        None => {
            tracker.finish()?;
            within(deadlines.read, "response", send).await?
        }
    }
}

/// Stream a response body into `sink`.
///
/// The announced `Content-Length` is passed to the sink and enforced once
/// the body ends. The sink only sees `finish` when everything checked out.
pub async fn download_into<S: DataSink + ?Sized>(
    response: ApiResponse,
    sink: &mut S,
    tracker: &mut ProgressTracker,
    read: Option<Duration>,
) -> ApiResult<u64> {
    sink.begin(response.content_length).await?;
    let mut body = with_read_deadline(response.body, read);
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        tracker.advance(chunk.len() as u64)?;
        sink.write(&chunk).await?;
    }
    let total = tracker.finish()?;
    sink.finish().await?;
    Ok(total)
}
