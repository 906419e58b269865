//! Pseudo-random download payload
//!
//! Payload bytes come from a ChaCha8 stream seeded from the OS, so they do
//! not compress on the way. Every zero byte is replaced so the payload never
//! contains the footer [`SENTINEL`](crate::footer::SENTINEL).

use crate::footer::SENTINEL;
use crate::http::clamp_len;
use crate::interceptor::RawResponseWriter;
use log::trace;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io;
use tokio::io::AsyncWrite;

/// Bytes produced and written per step.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Stands in for [`SENTINEL`] in generated bytes.
pub const SUBSTITUTE: u8 = 1;

/// Produces sentinel-free random bytes.
pub struct PayloadGenerator {
    rng: ChaCha8Rng,
}

impl PayloadGenerator {
    /// A generator with a fresh OS-provided seed.
    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    /// A reproducible generator.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha8Rng::from_seed(seed),
        }
    }

    /// Fills `buf` with random bytes, none of them [`SENTINEL`].
    pub fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
        for byte in buf.iter_mut().filter(|b| **b == SENTINEL) {
            *byte = SUBSTITUTE;
        }
    }

    /// Generates the next piece of a payload with `remaining` bytes left.
    ///
    /// The piece is at most `chunk.len()` bytes and lives in `chunk`.
    pub fn next_piece<'a>(&mut self, chunk: &'a mut [u8], remaining: u64) -> &'a [u8] {
        let len = clamp_len(chunk.len(), remaining);
        let piece = &mut chunk[..len];
        self.fill(piece);
        piece
    }

    /// Writes exactly `len` payload bytes to `writer`, one chunk at a time.
    ///
    /// `chunk` is scratch space and sets the step size; the writer is flushed
    /// after every chunk so bytes leave at the rate the network accepts them.
    /// Returns the number of bytes written.
    pub async fn stream_to<W>(
        &mut self,
        writer: &mut RawResponseWriter<W>,
        len: u64,
        chunk: &mut [u8],
    ) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        if chunk.is_empty() && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload chunk buffer is empty",
            ));
        }

        let mut remaining = len;
        while remaining > 0 {
            let piece = self.next_piece(chunk, remaining);
            writer.write(piece).await?;
            writer.flush().await?;
            remaining -= piece.len() as u64;
        }

        trace!("Streamed {} payload bytes", len);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    async fn streamed(len: u64, chunk_size: usize) -> (u64, Vec<u8>) {
        let mut generator = PayloadGenerator::from_seed([7; 32]);
        let mut writer = RawResponseWriter::new(Vec::new(), Duration::from_secs(5));
        let mut chunk = vec![0u8; chunk_size];

        let n = generator.stream_to(&mut writer, len, &mut chunk).await.unwrap();
        writer.flush().await.unwrap();

        let out = writer.into_inner();
        let head_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        (n, out[head_end..].to_vec())
    }

    #[tokio::test]
    async fn test_exact_length_with_partial_chunk() {
        let len = (CHUNK_SIZE * 2 + 1234) as u64;
        let (n, body) = streamed(len, CHUNK_SIZE).await;

        assert_eq!(n, len);
        assert_eq!(body.len() as u64, len);
        assert!(!body.contains(&SENTINEL));
    }

    #[tokio::test]
    async fn test_zero_length() {
        let mut generator = PayloadGenerator::from_entropy();
        let mut writer = RawResponseWriter::new(Vec::new(), Duration::from_secs(5));

        let n = generator.stream_to(&mut writer, 0, &mut []).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(writer.bytes_written(), 0);
        assert_eq!(writer.status(), None);
    }

    #[test]
    fn test_piece_bounded_by_remaining_and_chunk() {
        let mut generator = PayloadGenerator::from_seed([1; 32]);
        let mut chunk = vec![0u8; 4096];

        assert_eq!(generator.next_piece(&mut chunk, 10).len(), 10);
        assert_eq!(generator.next_piece(&mut chunk, u64::MAX).len(), 4096);
        assert_eq!(generator.next_piece(&mut chunk, (1 << 32) + 3).len(), 4096);
        assert!(generator.next_piece(&mut chunk, 0).is_empty());
    }

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = PayloadGenerator::from_seed([3; 32]);
        let mut b = PayloadGenerator::from_seed([3; 32]);
        let (mut x, mut y) = (vec![0u8; 4096], vec![0u8; 4096]);

        a.fill(&mut x);
        b.fill(&mut y);
        assert_eq!(x, y);
    }

    proptest! {
        #[test]
        fn test_fill_never_emits_sentinel(seed in any::<[u8; 32]>(), len in 0usize..20_000) {
            let mut generator = PayloadGenerator::from_seed(seed);
            let mut buf = vec![0u8; len];
            generator.fill(&mut buf);
            prop_assert!(!buf.contains(&SENTINEL));
        }
    }
}
