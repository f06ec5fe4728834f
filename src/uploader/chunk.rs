//! Bounded streaming reads for upload segments.
//!
//! A segment is one `[offset, offset + len)` window of the source file. The
//! reader never holds more than the stream buffer in memory, so a 1 GB
//! upload costs kilobytes of RAM regardless of segment size.

use crate::uploader::progress::TransferTracker;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, BufReader, ReadBuf, SeekFrom};
use tokio_util::io::ReaderStream;

/// Buffer size for streaming reads (64 KB)
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Byte window of one transfer segment
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub is_last: bool,
}

/// Async reader limited to one segment's byte range
pub struct SegmentReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl SegmentReader {
    pub async fn new(path: &Path, offset: u64, size: u64) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
        reader.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            reader,
            remaining: size,
        })
    }
}

impl AsyncRead for SegmentReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        let max_read = (self.remaining as usize).min(buf.remaining());
        let mut limited = buf.take(max_read);
        let before = limited.filled().len();

        match Pin::new(&mut self.reader).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let read = limited.filled().len() - before;
                if read > 0 {
                    // The limited view shares buf's storage; account for the
                    // bytes it initialized before advancing
                    unsafe { buf.assume_init(read) };
                    buf.advance(read);
                    self.remaining -= read as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Byte stream over one segment, with progress accounting
pub struct SegmentStream {
    inner: ReaderStream<SegmentReader>,
    tracker: Arc<TransferTracker>,
    sent_this_attempt: u64,
}

impl SegmentStream {
    pub async fn open(
        path: &Path,
        segment: &SegmentInfo,
        tracker: Arc<TransferTracker>,
    ) -> Result<Self> {
        let reader = SegmentReader::new(path, segment.offset, segment.size).await?;
        Ok(Self {
            inner: ReaderStream::with_capacity(reader, STREAM_BUFFER_SIZE),
            tracker,
            sent_this_attempt: 0,
        })
    }

    /// Bytes counted so far by this attempt, for rewinding on retry.
    pub fn sent_so_far(&self) -> u64 {
        self.sent_this_attempt
    }
}

impl Stream for SegmentStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let len = bytes.len() as u64;
                self.sent_this_attempt += len;
                self.tracker.add_bytes(len);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

/// Split a file into transfer segments of `segment_size` bytes.
pub fn split_segments(total_size: u64, segment_size: u64) -> Vec<SegmentInfo> {
    if total_size == 0 {
        return vec![SegmentInfo {
            index: 0,
            offset: 0,
            size: 0,
            is_last: true,
        }];
    }
    let segment_size = segment_size.max(1);
    let count = total_size.div_ceil(segment_size);
    (0..count)
        .map(|index| {
            let offset = index * segment_size;
            SegmentInfo {
                index: index as usize,
                offset,
                size: (total_size - offset).min(segment_size),
                is_last: index == count - 1,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    #[test]
    fn segments_cover_the_file_exactly() {
        let segments = split_segments(150, 64);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].offset, 0);
        assert_eq!(segments[0].size, 64);
        assert_eq!(segments[2].offset, 128);
        assert_eq!(segments[2].size, 22);
        assert!(segments[2].is_last);
        assert!(!segments[0].is_last);
        assert_eq!(segments.iter().map(|s| s.size).sum::<u64>(), 150);
    }

    #[test]
    fn single_segment_for_small_files() {
        let segments = split_segments(10, 64);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_last);
        assert_eq!(segments[0].size, 10);
    }

    #[test]
    fn empty_file_still_gets_one_finalizing_segment() {
        let segments = split_segments(0, 64);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].size, 0);
        assert!(segments[0].is_last);
    }

    #[tokio::test]
    async fn segment_stream_reads_only_its_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&(0u8..=255).collect::<Vec<u8>>()).unwrap();

        let segment = SegmentInfo {
            index: 1,
            offset: 100,
            size: 50,
            is_last: false,
        };
        let tracker = TransferTracker::new(256, 2);
        let mut stream = SegmentStream::open(file.path(), &segment, Arc::clone(&tracker))
            .await
            .unwrap();

        let mut collected = Vec::new();
        while let Some(bytes) = stream.next().await {
            collected.extend_from_slice(&bytes.unwrap());
        }

        assert_eq!(collected.len(), 50);
        assert_eq!(collected[0], 100);
        assert_eq!(collected[49], 149);
        assert_eq!(stream.sent_so_far(), 50);
        assert_eq!(tracker.sent(), 50);
    }
}
