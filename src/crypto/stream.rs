//! # Streaming Encryption
//!
//! `io::Write` / `io::Read` adapters for large payloads such as file
//! attachments.
//!
//! The stream layout is the one-shot [`AeadEngine`] layout
//! (`nonce || ciphertext || tag`), so a file written through
//! [`EncryptWriter`] can be decrypted with [`AeadEngine::decrypt`] on either
//! backend and the other way round. The stream is the RFC 8439 construction
//! driven block by block:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CHACHA20-POLY1305 STREAM                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  keystream block 0 ──► first 32 bytes ──► Poly1305 one-time key        │
//! │  keystream block 1.. ──► XOR with plaintext ──► ciphertext             │
//! │                                                                         │
//! │  MAC input: aad || pad16 || ciphertext || pad16 || le64(aad) || le64(ct)│
//! │                                                                         │
//! │  encrypt: nonce at start, each write() emits its ciphertext,          │
//! │           finish() emits the tag                                       │
//! │  decrypt: ciphertext read and authenticated first, keystream applied  │
//! │           inside read() so no plaintext copy is retained               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Encryption memory is bounded by [`STREAM_CHUNK_SIZE`]. Decryption holds
//! the ciphertext until the tag has been verified, since unauthenticated
//! plaintext is never handed out.
//!
//! [`AeadEngine`]: super::AeadEngine
//! [`AeadEngine::decrypt`]: super::AeadEngine::decrypt

use std::fmt;
use std::io::{self, Read, Write};

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Block, Poly1305};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::aead::{random_nonce, NONCE_SIZE, TAG_SIZE};
use super::keys::SymmetricKey;
use crate::error::{Error, Result};

/// Largest plaintext slice encrypted per `write` call
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const MAC_BLOCK: usize = 16;

fn io_failure(context: &str, source: io::Error) -> Error {
    Error::CryptoIoFailure {
        context: context.to_string(),
        source,
    }
}

/// Cipher positioned at block 1 plus the Poly1305 state keyed from block 0
fn stream_cipher(key: &SymmetricKey, nonce: &[u8; NONCE_SIZE]) -> (ChaCha20, Poly1305) {
    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(key.as_bytes()),
        chacha20::Nonce::from_slice(nonce),
    );
    let mut block0 = Zeroizing::new([0u8; 64]);
    cipher.apply_keystream(block0.as_mut_slice());
    let mac = Poly1305::new(poly1305::Key::from_slice(&block0[..32]));
    (cipher, mac)
}

/// Poly1305 over `aad || pad16 || ciphertext || pad16 || lengths`, fed in
/// arbitrary slices
struct StreamMac {
    mac: Poly1305,
    pending: [u8; MAC_BLOCK],
    pending_len: usize,
    aad_len: u64,
    cipher_len: u64,
}

impl StreamMac {
    fn new(mut mac: Poly1305, aad: &[u8]) -> Self {
        mac.update_padded(aad);
        Self {
            mac,
            pending: [0u8; MAC_BLOCK],
            pending_len: 0,
            aad_len: aad.len() as u64,
            cipher_len: 0,
        }
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.cipher_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (MAC_BLOCK - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < MAC_BLOCK {
                return;
            }
            self.mac.update(&[Block::clone_from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let mut blocks = data.chunks_exact(MAC_BLOCK);
        for block in &mut blocks {
            self.mac.update(&[Block::clone_from_slice(block)]);
        }
        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn tag(mut self) -> [u8; TAG_SIZE] {
        if self.pending_len > 0 {
            self.mac.update_padded(&self.pending[..self.pending_len]);
        }
        let mut lengths = Block::default();
        lengths[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lengths[8..].copy_from_slice(&self.cipher_len.to_le_bytes());
        self.mac.update(&[lengths]);

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(self.mac.finalize().as_slice());
        tag
    }
}

// ============================================================================
// ENCRYPTION
// ============================================================================

/// Writer that encrypts everything written to it
///
/// Each `write` emits its ciphertext to the sink right away; the tag is
/// only written by [`EncryptWriter::finish`]. A stream dropped without
/// finishing has no tag and never authenticates.
pub struct EncryptWriter<W: Write> {
    sink: W,
    cipher: ChaCha20,
    mac: StreamMac,
    scratch: Zeroizing<Vec<u8>>,
    failed: bool,
}

impl<W: Write> EncryptWriter<W> {
    /// Write the tag, flush the sink and return it
    pub fn finish(self) -> Result<W> {
        let Self {
            mut sink,
            mac,
            failed,
            ..
        } = self;

        if failed {
            return Err(io_failure(
                "encrypt stream",
                io::Error::new(io::ErrorKind::Other, "an earlier write failed"),
            ));
        }
        sink.write_all(&mac.tag())
            .map_err(|e| io_failure("encrypt stream write", e))?;
        sink.flush().map_err(|e| io_failure("encrypt stream flush", e))?;
        Ok(sink)
    }

    /// Number of plaintext bytes encrypted so far
    pub fn bytes_written(&self) -> u64 {
        self.mac.cipher_len
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::Other, "encrypt stream failed earlier"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let chunk = &buf[..buf.len().min(STREAM_CHUNK_SIZE)];
        self.scratch.clear();
        self.scratch.extend_from_slice(chunk);
        self.cipher.apply_keystream(self.scratch.as_mut_slice());

        // The keystream has moved on, so a partial write cannot be retried.
        if let Err(e) = self.sink.write_all(&self.scratch) {
            self.failed = true;
            return Err(e);
        }
        self.mac.absorb(&self.scratch);
        Ok(chunk.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write> fmt::Debug for EncryptWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptWriter")
            .field("bytes_written", &self.mac.cipher_len)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// Start an encrypting stream into `sink`
///
/// The nonce is written to the sink before this returns.
pub fn encrypt_stream<W: Write>(
    mut sink: W,
    key: &SymmetricKey,
    aad: Option<&[u8]>,
) -> Result<EncryptWriter<W>> {
    let nonce = random_nonce();
    sink.write_all(&nonce)
        .map_err(|e| io_failure("encrypt stream write", e))?;

    let (cipher, mac) = stream_cipher(key, &nonce);
    Ok(EncryptWriter {
        sink,
        cipher,
        mac: StreamMac::new(mac, aad.unwrap_or_default()),
        scratch: Zeroizing::new(Vec::with_capacity(STREAM_CHUNK_SIZE)),
        failed: false,
    })
}

// ============================================================================
// DECRYPTION
// ============================================================================

/// Reader over an authenticated payload
///
/// Holds the verified ciphertext and decrypts into the caller's buffer on
/// each `read`.
pub struct DecryptReader {
    ciphertext: Vec<u8>,
    position: usize,
    cipher: ChaCha20,
}

impl DecryptReader {
    /// Total plaintext length
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    /// Check whether the plaintext is empty
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl Read for DecryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.ciphertext[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cipher.apply_keystream(&mut buf[..n]);
        self.position += n;
        Ok(n)
    }
}

impl fmt::Debug for DecryptReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptReader")
            .field("len", &self.ciphertext.len())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Read and authenticate an encrypted payload from `source`
///
/// I/O errors surface as [`Error::CryptoIoFailure`], tag mismatches and
/// truncated payloads as [`Error::CryptoAuthFailure`].
pub fn decrypt_stream<R: Read>(
    mut source: R,
    key: &SymmetricKey,
    aad: Option<&[u8]>,
) -> Result<DecryptReader> {
    let mut nonce = [0u8; NONCE_SIZE];
    source.read_exact(&mut nonce).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::CryptoAuthFailure("stream (shorter than nonce and tag)".into())
        }
        _ => io_failure("decrypt stream read", e),
    })?;

    let mut payload = Vec::new();
    source
        .read_to_end(&mut payload)
        .map_err(|e| io_failure("decrypt stream read", e))?;
    if payload.len() < TAG_SIZE {
        return Err(Error::CryptoAuthFailure(
            "stream (shorter than nonce and tag)".into(),
        ));
    }
    let stored_tag = payload.split_off(payload.len() - TAG_SIZE);

    let (cipher, mac) = stream_cipher(key, &nonce);
    let mut mac = StreamMac::new(mac, aad.unwrap_or_default());
    mac.absorb(&payload);
    if !bool::from(mac.tag().as_slice().ct_eq(&stored_tag)) {
        return Err(Error::CryptoAuthFailure("stream (tag mismatch)".into()));
    }

    Ok(DecryptReader {
        ciphertext: payload,
        position: 0,
        cipher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::{engine_for, AeadBackend};
    use crate::error::ErrorKind;
    use std::io::Cursor;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))
        }
    }

    /// Accepts `limit` bytes, then reports a full disk
    #[derive(Debug)]
    struct FailingWriter {
        limit: usize,
        written: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_stream_roundtrip_in_chunks() {
        let key = SymmetricKey::generate();
        let data = sample(10_000);

        let mut writer = encrypt_stream(Vec::new(), &key, Some(b"file")).unwrap();
        for chunk in data.chunks(777) {
            writer.write_all(chunk).unwrap();
        }
        assert_eq!(writer.bytes_written(), data.len() as u64);
        let encrypted = writer.finish().unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + data.len() + TAG_SIZE);

        let mut reader = decrypt_stream(Cursor::new(encrypted), &key, Some(b"file")).unwrap();
        assert_eq!(reader.len(), data.len());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_stream_matches_one_shot_format() {
        let key = SymmetricKey::generate();
        let data = sample(1_000);

        for backend in [AeadBackend::RustCrypto, AeadBackend::Ring] {
            let engine = engine_for(backend);

            let mut writer = encrypt_stream(Vec::new(), &key, Some(b"ctx")).unwrap();
            for chunk in data.chunks(33) {
                writer.write_all(chunk).unwrap();
            }
            let encrypted = writer.finish().unwrap();
            let plain = engine.decrypt(&encrypted, key.as_bytes(), Some(b"ctx")).unwrap();
            assert_eq!(plain.as_slice(), data.as_slice());

            let one_shot = engine.encrypt(&data, key.as_bytes(), Some(b"ctx")).unwrap();
            let mut out = Vec::new();
            decrypt_stream(Cursor::new(one_shot), &key, Some(b"ctx"))
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_empty_stream() {
        let key = SymmetricKey::generate();
        let encrypted = encrypt_stream(Vec::new(), &key, None).unwrap().finish().unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + TAG_SIZE);

        let plain = engine_for(AeadBackend::Ring)
            .decrypt(&encrypted, key.as_bytes(), None)
            .unwrap();
        assert!(plain.is_empty());
        assert!(decrypt_stream(Cursor::new(encrypted), &key, None).unwrap().is_empty());
    }

    #[test]
    fn test_large_stream_is_written_incrementally() {
        let key = SymmetricKey::generate();
        let data = sample(3 * 1024 * 1024 + 5);

        let mut writer = encrypt_stream(Vec::new(), &key, None).unwrap();
        let (head, tail) = data.split_at(2 * 1024 * 1024);
        writer.write_all(head).unwrap();
        // Ciphertext for everything written so far is already in the sink.
        assert_eq!(writer.sink.len(), NONCE_SIZE + head.len());

        writer.write_all(tail).unwrap();
        let encrypted = writer.finish().unwrap();

        let plain = engine_for(AeadBackend::RustCrypto)
            .decrypt(&encrypted, key.as_bytes(), None)
            .unwrap();
        assert!(plain.as_slice() == data.as_slice());
    }

    #[test]
    fn test_stream_through_file() {
        let key = SymmetricKey::generate();
        let file = tempfile::NamedTempFile::new().unwrap();

        let mut writer = encrypt_stream(file.reopen().unwrap(), &key, None).unwrap();
        writer.write_all(b"stored on disk").unwrap();
        writer.finish().unwrap();

        let mut reader = decrypt_stream(file.reopen().unwrap(), &key, None).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "stored on disk");
    }

    #[test]
    fn test_read_failure_is_io_failure() {
        let key = SymmetricKey::generate();
        let err = decrypt_stream(FailingReader, &key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoIoFailure);
    }

    #[test]
    fn test_write_failure_is_io_failure() {
        let key = SymmetricKey::generate();
        let err = encrypt_stream(FailingWriter { limit: 0, written: 0 }, &key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoIoFailure);

        let sink = FailingWriter {
            limit: NONCE_SIZE + 4,
            written: 0,
        };
        let mut writer = encrypt_stream(sink, &key, None).unwrap();
        assert!(writer.write_all(b"payload").is_err());
        assert!(writer.write_all(b"more").is_err());
        let err = writer.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoIoFailure);
    }

    #[test]
    fn test_tampered_stream_is_auth_failure() {
        let key = SymmetricKey::generate();
        let mut writer = encrypt_stream(Vec::new(), &key, None).unwrap();
        writer.write_all(b"payload").unwrap();
        let mut encrypted = writer.finish().unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x80;

        let err = decrypt_stream(Cursor::new(encrypted.clone()), &key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoAuthFailure);

        encrypted.truncate(NONCE_SIZE + 3);
        let err = decrypt_stream(Cursor::new(encrypted), &key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoAuthFailure);
    }

    #[test]
    fn test_wrong_aad_is_auth_failure() {
        let key = SymmetricKey::generate();
        let mut writer = encrypt_stream(Vec::new(), &key, Some(b"item")).unwrap();
        writer.write_all(b"payload").unwrap();
        let encrypted = writer.finish().unwrap();

        let err = decrypt_stream(Cursor::new(encrypted), &key, Some(b"edition")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoAuthFailure);
    }

    #[test]
    fn test_debug_hides_contents() {
        let key = SymmetricKey::generate();
        let mut writer = encrypt_stream(Vec::new(), &key, None).unwrap();
        writer.write_all(b"hunter2").unwrap();
        assert!(format!("{:?}", writer).contains("bytes_written: 7"));

        let encrypted = writer.finish().unwrap();
        let reader = decrypt_stream(Cursor::new(encrypted), &key, None).unwrap();
        let rendered = format!("{:?}", reader);
        assert!(rendered.starts_with("DecryptReader"));
        assert!(!rendered.contains("hunter2"));
    }
}
