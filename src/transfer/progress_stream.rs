use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use crate::stats::SpeedCounter;

/// 请求体按这个大小切片，进度更新更平滑
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pin_project! {
    /// 统计已经交给 HTTP 客户端的字节数
    pub struct CountingStream<S> {
        #[pin]
        inner: S,
        in_flight: Arc<AtomicU64>,
        speeds: Arc<SpeedCounter>,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, in_flight: Arc<AtomicU64>, speeds: Arc<SpeedCounter>) -> Self {
        Self {
            inner,
            in_flight,
            speeds,
        }
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let len = chunk.len() as u64;
                if len > 0 {
                    this.in_flight.fetch_add(len, Ordering::Relaxed);
                    this.speeds.add(len);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// 把一个分片的数据切成小块，作为请求体的流
pub fn chunked_body(
    data: Bytes,
    in_flight: Arc<AtomicU64>,
    speeds: Arc<SpeedCounter>,
) -> CountingStream<futures::stream::Iter<std::vec::IntoIter<std::io::Result<Bytes>>>> {
    let mut pieces = Vec::with_capacity(data.len() / STREAM_CHUNK_SIZE + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + STREAM_CHUNK_SIZE).min(data.len());
        pieces.push(Ok(data.slice(offset..end)));
        offset = end;
    }

    CountingStream::new(futures::stream::iter(pieces), in_flight, speeds)
}
