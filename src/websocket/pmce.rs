//! Permessage-deflate (RFC 7692): two independent raw-deflate streams,
//! one per direction, each flushed per message.
//!
//! Grounded on `original_source/poseidon/socket/wss_server_session.cpp`'s
//! `wss_send` (compression threshold, context-takeover reset-before-use)
//! and `do_on_https_upgraded_stream`'s inflate-then-swap-buffer handling.
//! Uses `flate2`'s raw-deflate streaming `Compress`/`Decompress`, which
//! speak the same window exactly as negotiated (no zlib header/trailer,
//! matching RFC 7692's wire format).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Negotiated PMCE parameters for one direction.
#[derive(Debug, Clone, Copy)]
pub struct PmceParams {
    pub server_window_bits: u8,
    pub client_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl Default for PmceParams {
    fn default() -> Self {
        PmceParams {
            server_window_bits: 15,
            client_window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

/// Below this payload size, compressing isn't worth the CPU; rises when
/// `no_context_takeover` is negotiated because every message pays a full
/// deflate-reset regardless of size.
pub fn compression_threshold(no_context_takeover: bool) -> usize {
    if no_context_takeover {
        1024
    } else {
        64
    }
}

/// One direction's deflate context. `is_server` selects which side's
/// window/context-takeover parameters this context uses.
pub struct Deflator {
    compress: Compress,
    no_context_takeover: bool,
}

impl Deflator {
    pub fn new(params: &PmceParams, is_server: bool) -> Deflator {
        let (no_context_takeover, window_bits) = if is_server {
            (params.server_no_context_takeover, params.server_window_bits)
        } else {
            (params.client_no_context_takeover, params.client_window_bits)
        };
        Deflator {
            compress: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            no_context_takeover,
        }
    }

    pub fn no_context_takeover(&self) -> bool {
        self.no_context_takeover
    }

    /// Compresses one complete message, returning raw deflate bytes with
    /// the final empty-block trailer already stripped (RFC 7692 §7.2.1:
    /// the last 4 bytes `00 00 ff ff` are removed from the wire).
    pub fn deflate_message(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        let mut chunk = vec![0u8; 8192];
        let mut input = data;
        loop {
            let before_out = self.compress.total_out();
            let before_in = self.compress.total_in();
            let status = self
                .compress
                .compress(input, &mut chunk, FlushCompress::Sync)
                .map_err(Error::Deflate)?;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];
            if input.is_empty() && status == Status::Ok {
                break;
            }
            if status == Status::BufError {
                break;
            }
        }
        if out.ends_with(&[0x00, 0x00, 0xff, 0xff]) {
            out.truncate(out.len() - 4);
        }
        if self.no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }
}

/// One direction's inflate context.
pub struct Inflator {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl Inflator {
    pub fn new(params: &PmceParams, is_server: bool) -> Inflator {
        let (no_context_takeover, window_bits) = if is_server {
            (params.client_no_context_takeover, params.client_window_bits)
        } else {
            (params.server_no_context_takeover, params.server_window_bits)
        };
        Inflator {
            decompress: Decompress::new_with_window_bits(false, window_bits),
            no_context_takeover,
        }
    }

    /// Inflates one complete message. The caller re-appends the
    /// `00 00 ff ff` trailer `deflate_message` stripped, per RFC 7692.
    pub fn inflate_message(&mut self, data: &[u8], max_output: usize) -> Result<Vec<u8>> {
        let mut input = data.to_vec();
        input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);

        let mut out = Vec::new();
        let mut chunk = vec![0u8; 8192];
        let mut remaining = &input[..];
        loop {
            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();
            let status = self
                .decompress
                .decompress(remaining, &mut chunk, FlushDecompress::Sync)
                .map_err(Error::Inflate)?;
            let produced = (self.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if out.len() > max_output {
                return Err(Error::protocol(
                    crate::websocket::CloseStatus::MessageTooLarge,
                    "inflated message exceeds max_message_length",
                ));
            }
            let consumed = (self.decompress.total_in() - before_in) as usize;
            remaining = &remaining[consumed..];
            if remaining.is_empty() || status == Status::StreamEnd {
                break;
            }
            if status == Status::BufError && produced == 0 {
                break;
            }
        }
        if self.no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_then_inflate_round_trips() {
        let params = PmceParams::default();
        let mut deflator = Deflator::new(&params, true);
        let mut inflator = Inflator::new(&params, false);

        let message = b"the quick brown fox jumps over the lazy dog, repeatedly, for compressibility";
        let compressed = deflator.deflate_message(message).unwrap();
        let decompressed = inflator.inflate_message(&compressed, 1 << 20).unwrap();
        assert_eq!(decompressed, message);
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let params = PmceParams {
            server_no_context_takeover: true,
            ..PmceParams::default()
        };
        let mut deflator = Deflator::new(&params, true);
        let mut inflator = Inflator::new(&params, false);

        for _ in 0..3 {
            let compressed = deflator.deflate_message(b"hello world").unwrap();
            let decompressed = inflator.inflate_message(&compressed, 1 << 20).unwrap();
            assert_eq!(decompressed, b"hello world");
        }
    }

    #[test]
    fn threshold_rises_with_no_context_takeover() {
        assert_eq!(compression_threshold(false), 64);
        assert_eq!(compression_threshold(true), 1024);
    }

    #[test]
    fn reduced_window_bits_still_round_trip() {
        let params = PmceParams {
            server_window_bits: 9,
            client_window_bits: 9,
            ..PmceParams::default()
        };
        let mut deflator = Deflator::new(&params, true);
        let mut inflator = Inflator::new(&params, false);

        let message = b"the quick brown fox jumps over the lazy dog, repeatedly, for compressibility";
        let compressed = deflator.deflate_message(message).unwrap();
        let decompressed = inflator.inflate_message(&compressed, 1 << 20).unwrap();
        assert_eq!(decompressed, message);
    }
}
