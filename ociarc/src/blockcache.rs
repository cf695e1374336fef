use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::trace;
use moka::future::Cache;

use crate::error::Error;
use crate::httpsource::ByteSource;

pub const DEFAULT_BLOCK_SIZE: u64 = 512 * 1024;
pub const DEFAULT_CAPACITY: u64 = 256 * 1024 * 1024;

// blocks are addressed by the wrapped source's identity plus their index,
// so two sources over the same content share cache entries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BlockKey {
    source: Arc<str>,
    index: u64,
}

/// Serves fixed-size aligned blocks of a wrapped [`ByteSource`] out of an
/// in-memory content-addressed cache. Concurrent reads of the same block
/// coalesce into a single upstream fetch; blocks inherit the wrapped
/// source's validator-pinned integrity.
#[derive(Clone)]
pub struct BlockSource {
    inner: Arc<dyn ByteSource>,
    block_size: u64,
    source: Arc<str>,
    cache: Cache<BlockKey, Bytes>,
}

impl BlockSource {
    pub fn new(inner: Arc<dyn ByteSource>, block_size: u64, capacity_bytes: u64) -> Self {
        let source: Arc<str> = Arc::from(inner.source_id());
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_k: &BlockKey, v: &Bytes| v.len().try_into().unwrap_or(u32::MAX))
            .build();
        BlockSource {
            inner,
            block_size: block_size.max(1),
            source,
            cache,
        }
    }

    async fn block(&self, index: u64) -> Result<Bytes, Error> {
        let key = BlockKey {
            source: self.source.clone(),
            index,
        };
        let entry = self
            .cache
            .entry(key)
            .or_try_insert_with(self.fetch_block(index))
            .await
            .map_err(Error::Shared)?;
        if entry.is_fresh() {
            trace!("block {}#{index} fetched", self.source);
        }
        Ok(entry.into_value())
    }

    async fn fetch_block(&self, index: u64) -> Result<Bytes, Error> {
        let offset = index * self.block_size;
        let len = self.block_size.min(self.inner.size() - offset);
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self
                .inner
                .read_at(offset + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                return Err(Error::SizeMismatch {
                    expected: buf.len() as u64,
                    actual: filled as u64,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ByteSource for BlockSource {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        &self.source
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let size = self.inner.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(size);
        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;
        let mut filled = 0usize;
        for index in first..=last {
            let block = self.block(index).await?;
            let block_start = index * self.block_size;
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_start + block.len() as u64) - block_start;
            let chunk = &block[from as usize..to as usize];
            buf[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
        }
        Ok(filled)
    }

    async fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        let size = self.inner.size();
        if offset >= size || length == 0 {
            return Ok(futures::stream::empty().boxed());
        }
        let end = (offset + length).min(size);
        let this = self.clone();
        let stream = futures::stream::try_unfold(
            (offset, this),
            move |(pos, this)| async move {
                if pos >= end {
                    return Ok(None);
                }
                let index = pos / this.block_size;
                let block = this.block(index).await?;
                let block_start = index * this.block_size;
                let from = (pos - block_start) as usize;
                let to = ((end - block_start).min(block.len() as u64)) as usize;
                let chunk = block.slice(from..to);
                Ok(Some((chunk, (block_start + to as u64, this))))
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSource {
        data: Vec<u8>,
        reads: AtomicU64,
    }

    #[async_trait]
    impl ByteSource for CountingSource {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn source_id(&self) -> &str {
            "sha256:counting"
        }

        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let data = &self.data;
            if offset >= data.len() as u64 {
                return Ok(0);
            }
            let end = ((offset as usize) + buf.len()).min(data.len());
            let n = end - offset as usize;
            buf[..n].copy_from_slice(&data[offset as usize..end]);
            Ok(n)
        }

        async fn read_range(
            &self,
            offset: u64,
            length: u64,
        ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
            let end = ((offset + length) as usize).min(self.data.len());
            let chunk = Bytes::copy_from_slice(&self.data[offset as usize..end]);
            Ok(futures::stream::once(async move { Ok(chunk) }).boxed())
        }
    }

    fn counting(n: usize) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            data: (0..n).map(|i| (i % 251) as u8).collect(),
            reads: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn test_read_at_spans_blocks() {
        let inner = counting(1000);
        let source = BlockSource::new(inner.clone(), 256, 1 << 20);
        let mut buf = vec![0u8; 600];
        let n = source.read_at(100, &mut buf).await.unwrap();
        assert_eq!(n, 600);
        assert_eq!(&buf[..], &inner.data[100..700]);
        // 100..700 covers blocks 0..=2
        assert_eq!(inner.reads.load(Ordering::Relaxed), 3);

        // the same region again comes from cache
        let n = source.read_at(100, &mut buf).await.unwrap();
        assert_eq!(n, 600);
        assert_eq!(inner.reads.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_tail_block_is_short() {
        let inner = counting(1000);
        let source = BlockSource::new(inner.clone(), 256, 1 << 20);
        let mut buf = vec![0u8; 300];
        // last block is 1000 - 768 = 232 bytes
        let n = source.read_at(900, &mut buf).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..100], &inner.data[900..1000]);
        assert_eq!(source.read_at(1000, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_range_stream() {
        let inner = counting(1000);
        let source = BlockSource::new(inner.clone(), 128, 1 << 20);
        let mut stream = source.read_range(50, 500).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(&collected[..], &inner.data[50..550]);
    }

    #[tokio::test]
    async fn test_concurrent_reads_single_flight() {
        let inner = counting(4096);
        let source = BlockSource::new(inner.clone(), 4096, 1 << 20);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                source.read_at(0, &mut buf).await.unwrap();
                buf
            }));
        }
        for handle in handles {
            let buf = handle.await.unwrap();
            assert_eq!(&buf[..], &inner.data[..]);
        }
        // every reader hit the same block key, one upstream fetch
        assert_eq!(inner.reads.load(Ordering::Relaxed), 1);
    }
}
