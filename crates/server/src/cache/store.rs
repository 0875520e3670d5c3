//! Chunked blob store over Redis.
//!
//! Values larger than one slot are split into N chunks keyed
//! `key_1 .. key_N`; the first chunk carries a fixed-width header
//! encoding N. Reads assemble the chunks and clean up orphans when a
//! tail chunk has been evicted from under the head.

use anyhow::{Context, Result};
use redis::{AsyncCommands, Client as RedisClient};
use tracing::{debug, warn};

/// Bytes per chunk.
pub const SLOT_SIZE: usize = 512 * 1024;

/// Ceiling on chunks per value; larger values are not cacheable.
pub const MAX_CHUNKS: usize = 32;

/// Header magic on the first chunk.
const MAGIC: &[u8; 4] = b"RFB1";

/// Header length: magic plus a big-endian u32 chunk count.
const HEADER_LEN: usize = 8;

/// Capacity and usage of the backing store.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheUsage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

/// Chunk-splitting key/value store.
pub struct BlobStore {
    redis: RedisClient,
}

impl BlobStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn chunk_key(key: &str, n: usize) -> String {
        format!("{key}_{n}")
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.redis
            .get_multiplexed_async_connection()
            .await
            .context("failed to get Redis connection")
    }

    /// Store a value, splitting it across chunks. Fails when the value
    /// exceeds the chunk ceiling.
    pub async fn put(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let chunk_count = value.len().div_ceil(SLOT_SIZE).max(1);
        if chunk_count > MAX_CHUNKS {
            anyhow::bail!(
                "value of {} bytes exceeds {} chunk ceiling",
                value.len(),
                MAX_CHUNKS
            );
        }

        let mut conn = self.conn().await?;

        for (i, chunk) in value.chunks(SLOT_SIZE).enumerate().take(chunk_count) {
            let mut payload;
            let body: &[u8] = if i == 0 {
                payload = Vec::with_capacity(HEADER_LEN + chunk.len());
                payload.extend_from_slice(MAGIC);
                payload.extend_from_slice(&(chunk_count as u32).to_be_bytes());
                payload.extend_from_slice(chunk);
                &payload
            } else {
                chunk
            };

            let chunk_key = Self::chunk_key(key, i + 1);
            match ttl_secs {
                Some(ttl) => conn
                    .set_ex::<_, _, ()>(&chunk_key, body, ttl)
                    .await
                    .context("failed to set chunk")?,
                None => conn
                    .set::<_, _, ()>(&chunk_key, body)
                    .await
                    .context("failed to set chunk")?,
            }
        }

        // An empty value still writes the head chunk with its header.
        if value.is_empty() {
            let mut payload = Vec::with_capacity(HEADER_LEN);
            payload.extend_from_slice(MAGIC);
            payload.extend_from_slice(&1u32.to_be_bytes());
            let chunk_key = Self::chunk_key(key, 1);
            match ttl_secs {
                Some(ttl) => conn
                    .set_ex::<_, _, ()>(&chunk_key, payload, ttl)
                    .await
                    .context("failed to set chunk")?,
                None => conn
                    .set::<_, _, ()>(&chunk_key, payload)
                    .await
                    .context("failed to set chunk")?,
            }
        }

        debug!(key = %key, size = value.len(), chunks = chunk_count, "blob stored");
        Ok(())
    }

    /// Fetch and reassemble a value. A head chunk whose tail has been
    /// evicted deletes the orphan chunks and reads as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;

        let head: Option<Vec<u8>> = conn
            .get(Self::chunk_key(key, 1))
            .await
            .context("failed to get head chunk")?;
        let Some(head) = head else {
            return Ok(None);
        };

        if head.len() < HEADER_LEN || &head[..4] != MAGIC {
            warn!(key = %key, "malformed blob header, deleting");
            self.delete(key).await?;
            return Ok(None);
        }

        let chunk_count = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
        if chunk_count == 0 || chunk_count > MAX_CHUNKS {
            warn!(key = %key, chunks = chunk_count, "implausible chunk count, deleting");
            self.delete(key).await?;
            return Ok(None);
        }

        let mut value = head[HEADER_LEN..].to_vec();

        if chunk_count > 1 {
            let tail_keys: Vec<String> = (2..=chunk_count)
                .map(|i| Self::chunk_key(key, i))
                .collect();
            let tails: Vec<Option<Vec<u8>>> = conn
                .mget(&tail_keys)
                .await
                .context("failed to get tail chunks")?;

            for tail in tails {
                match tail {
                    Some(chunk) => value.extend_from_slice(&chunk),
                    None => {
                        // A tail was evicted: the value is unrecoverable
                        // and the surviving chunks are garbage.
                        warn!(key = %key, "missing tail chunk, deleting orphans");
                        self.delete(key).await?;
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(value))
    }

    /// Delete a value and all of its chunks.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        // The header says how many chunks exist; when it is gone or
        // unreadable, sweep the whole possible range.
        let head: Option<Vec<u8>> = conn
            .get(Self::chunk_key(key, 1))
            .await
            .context("failed to get head chunk")?;
        let chunk_count = match head {
            Some(h) if h.len() >= HEADER_LEN && &h[..4] == MAGIC => {
                (u32::from_be_bytes([h[4], h[5], h[6], h[7]]) as usize).min(MAX_CHUNKS)
            }
            Some(_) => MAX_CHUNKS,
            None => return Ok(()),
        };

        let keys: Vec<String> = (1..=chunk_count)
            .map(|i| Self::chunk_key(key, i))
            .collect();
        conn.del::<_, ()>(&keys)
            .await
            .context("failed to delete chunks")?;
        Ok(())
    }

    /// Store a small control value (no chunking).
    pub async fn put_raw(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl_secs {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl)
                .await
                .context("failed to set value")?,
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .context("failed to set value")?,
        }
        Ok(())
    }

    /// Fetch a control value.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.context("failed to get value")
    }

    /// Delete a control value.
    pub async fn delete_raw(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.context("failed to delete value")
    }

    /// Atomic add: set the key only when it is absent. Returns whether
    /// this caller won. This is the primitive behind every lock and
    /// marker; get-then-set would let two losers both write.
    pub async fn add_raw(&self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        let set: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .context("failed atomic add")?;
        Ok(set.is_some())
    }

    /// Drop everything in the backing store.
    pub async fn flush(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .context("failed to flush cache")?;
        Ok(())
    }

    /// Capacity and current usage, from the server's own accounting.
    pub async fn usage(&self) -> Result<CacheUsage> {
        let mut conn = self.conn().await?;
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .context("failed to read cache stats")?;

        let mut usage = CacheUsage::default();
        for line in info.lines() {
            if let Some(v) = line.strip_prefix("used_memory:") {
                usage.used_bytes = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("maxmemory:") {
                usage.capacity_bytes = v.trim().parse().unwrap_or(0);
            }
        }
        Ok(usage)
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn chunk_keys_are_suffixed() {
        assert_eq!(BlobStore::chunk_key("IMG:42,w200", 1), "IMG:42,w200_1");
        assert_eq!(BlobStore::chunk_key("IMG:42,w200", 32), "IMG:42,w200_32");
    }

    #[test]
    fn chunk_count_arithmetic() {
        assert_eq!(0usize.div_ceil(SLOT_SIZE).max(1), 1);
        assert_eq!(1usize.div_ceil(SLOT_SIZE).max(1), 1);
        assert_eq!(SLOT_SIZE.div_ceil(SLOT_SIZE).max(1), 1);
        assert_eq!((SLOT_SIZE + 1).div_ceil(SLOT_SIZE).max(1), 2);
        assert_eq!((SLOT_SIZE * MAX_CHUNKS).div_ceil(SLOT_SIZE).max(1), MAX_CHUNKS);
    }

    #[test]
    fn header_layout() {
        let count = 7u32;
        let mut header = Vec::new();
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&count.to_be_bytes());
        assert_eq!(header.len(), HEADER_LEN);
        assert_eq!(
            u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            7
        );
    }
}
