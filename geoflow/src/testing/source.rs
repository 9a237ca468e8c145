//! In-memory artifact source with range support and injectable faults.

use crate::fetch::{ArtifactSource, ByteStream, FetchError, SourceResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_CHUNK: usize = 4096;

/// An [`ArtifactSource`] serving one byte buffer.
///
/// Every `open` is recorded with its requested offset. Faults:
/// - `interrupt_at(n)`: the first transfer fails with a transient error once
///   it reaches byte `n`; later transfers complete.
/// - `stall_at(n)`: every transfer stops sending at byte `n` forever.
/// - `fail_every_open()`: every `open` fails with a transient error.
#[derive(Debug)]
pub struct MemorySource {
    data: Arc<Vec<u8>>,
    resources: HashMap<String, Vec<u8>>,
    supports_ranges: bool,
    interrupt_at: Mutex<Option<u64>>,
    stall_at: Option<u64>,
    fail_every_open: bool,
    chunk_size: usize,
    offsets: Mutex<Vec<u64>>,
}

impl MemorySource {
    /// Serves `data` for every URL.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            resources: HashMap::new(),
            supports_ranges: true,
            interrupt_at: Mutex::new(None),
            stall_at: None,
            fail_every_open: false,
            chunk_size: DEFAULT_CHUNK,
            offsets: Mutex::new(Vec::new()),
        }
    }

    /// Serves `body` for exactly `url` (e.g. a checksum file).
    #[must_use]
    pub fn with_resource(mut self, url: impl Into<String>, body: Vec<u8>) -> Self {
        self.resources.insert(url.into(), body);
        self
    }

    /// Ignores requested offsets and always sends the whole buffer.
    #[must_use]
    pub const fn without_ranges(mut self) -> Self {
        self.supports_ranges = false;
        self
    }

    /// Breaks the first transfer at byte `offset`.
    #[must_use]
    pub fn interrupt_at(self, offset: u64) -> Self {
        *self.interrupt_at.lock() = Some(offset);
        self
    }

    /// Stops every transfer at byte `offset` without closing it.
    #[must_use]
    pub const fn stall_at(mut self, offset: u64) -> Self {
        self.stall_at = Some(offset);
        self
    }

    /// Makes every `open` fail.
    #[must_use]
    pub const fn fail_every_open(mut self) -> Self {
        self.fail_every_open = true;
        self
    }

    /// Sets the chunk size of transfers.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Offsets requested by each `open` of the main buffer, in order.
    #[must_use]
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn open(&self, url: &str, offset: u64) -> Result<SourceResponse, FetchError> {
        if let Some(body) = self.resources.get(url) {
            return Ok(SourceResponse {
                start: 0,
                total_len: Some(body.len() as u64),
                body: Box::new(MemoryBody {
                    data: Arc::new(body.clone()),
                    position: 0,
                    interrupt_at: None,
                    stall_at: None,
                    chunk_size: self.chunk_size,
                    url: url.to_string(),
                }),
            });
        }

        self.offsets.lock().push(offset);
        if self.fail_every_open {
            return Err(FetchError::Transient {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let len = self.data.len() as u64;
        let start = if self.supports_ranges && offset <= len { offset } else { 0 };
        Ok(SourceResponse {
            start,
            total_len: Some(len),
            body: Box::new(MemoryBody {
                data: Arc::clone(&self.data),
                position: start,
                interrupt_at: self.interrupt_at.lock().take(),
                stall_at: self.stall_at,
                chunk_size: self.chunk_size,
                url: url.to_string(),
            }),
        })
    }
}

struct MemoryBody {
    data: Arc<Vec<u8>>,
    position: u64,
    interrupt_at: Option<u64>,
    stall_at: Option<u64>,
    chunk_size: usize,
    url: String,
}

#[async_trait]
impl ByteStream for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(None);
        }
        if self.interrupt_at.is_some_and(|at| self.position >= at) {
            return Err(FetchError::Transient {
                url: self.url.clone(),
                message: "connection reset by peer".to_string(),
            });
        }
        if self.stall_at.is_some_and(|at| self.position >= at) {
            std::future::pending::<()>().await;
        }

        let mut end = (self.position + self.chunk_size as u64).min(len);
        for limit in [self.interrupt_at, self.stall_at].into_iter().flatten() {
            if limit > self.position {
                end = end.min(limit);
            }
        }
        let start = usize::try_from(self.position).unwrap_or(usize::MAX);
        let stop = usize::try_from(end).unwrap_or(usize::MAX);
        let chunk = self.data[start..stop].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }
}
