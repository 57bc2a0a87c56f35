/*!
Passphrase encryption stage.

The passphrase is stretched with Argon2id into an AES-256-GCM key. The stream is
sealed in fixed-size frames so that neither side ever buffers more than one chunk:

```text
header: magic(8) | version(1) | m_cost(4) | t_cost(4) | p_cost(4) | salt(16) | nonce prefix(7)
frame:  flag(1) | ciphertext length(4, big endian) | ciphertext + tag
```

Each frame nonce is `prefix || counter || flag`, and the flag is also bound as
associated data. Reordered, dropped, or appended frames therefore fail
authentication, and a stream that ends before a frame flagged as last is rejected
as truncated.
*/

use std::io::{self, Read};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;

use super::{ByteStream, StreamTransform};
use crate::credentials::Secret;
use crate::{BackupError, Result};

const MAGIC: &[u8; 8] = b"BKSTENC1";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 7;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1 + 12 + SALT_LEN + NONCE_PREFIX_LEN;

/// Plaintext bytes per frame
pub const CHUNK_SIZE: usize = 64 * 1024;
const MAX_FRAME_LEN: usize = CHUNK_SIZE + TAG_LEN;
/// Refuse headers that ask for more than 1 GiB of KDF memory
const MAX_M_COST_KIB: u32 = 1024 * 1024;

const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;

/// Argon2id cost parameters, stored in the stream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

fn derive_key(passphrase: &Secret, salt: &[u8], kdf: KdfParams) -> Result<Aes256Gcm> {
    if kdf.m_cost > MAX_M_COST_KIB {
        return Err(BackupError::transform(format!(
            "key derivation memory cost of {} KiB exceeds the limit",
            kdf.m_cost
        )));
    }
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(KEY_LEN))
        .map_err(|e| BackupError::transform(format!("invalid key derivation parameters: {e}")))?;
    let mut key = [0u8; KEY_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.expose().as_bytes(), salt, &mut key)
        .map_err(|e| BackupError::transform(format!("key derivation failed: {e}")))?;
    Aes256Gcm::new_from_slice(&key)
        .map_err(|e| BackupError::transform(format!("invalid cipher key: {e}")))
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, flag: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = flag;
    nonce
}

fn invalid_data<S: Into<String>>(msg: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Authenticated encryption with a passphrase-derived key
///
/// A fresh salt and nonce prefix are drawn for every stream, so two encryptions of
/// the same dump never share ciphertext.
#[derive(Debug, Clone)]
pub struct PassphraseEncryptor {
    passphrase: Secret,
    kdf: KdfParams,
}

impl PassphraseEncryptor {
    pub fn new(passphrase: Secret) -> Self {
        Self {
            passphrase,
            kdf: KdfParams::default(),
        }
    }

    /// Override the Argon2id costs used for new streams.
    ///
    /// Decryption always uses the costs recorded in the stream header.
    pub fn with_kdf_params(mut self, m_cost: u32, t_cost: u32, p_cost: u32) -> Self {
        self.kdf = KdfParams {
            m_cost,
            t_cost,
            p_cost,
        };
        self
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.kdf
    }

    /// Encrypt with caller-chosen salt and nonce prefix.
    ///
    /// Reusing a salt and prefix pair with the same passphrase reuses nonces; this
    /// exists so that output can be reproduced exactly.
    pub fn apply_with_parameters(
        &self,
        input: ByteStream,
        salt: [u8; SALT_LEN],
        nonce_prefix: [u8; NONCE_PREFIX_LEN],
    ) -> Result<ByteStream> {
        let cipher = derive_key(&self.passphrase, &salt, self.kdf)?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        header.extend_from_slice(&self.kdf.m_cost.to_be_bytes());
        header.extend_from_slice(&self.kdf.t_cost.to_be_bytes());
        header.extend_from_slice(&self.kdf.p_cost.to_be_bytes());
        header.extend_from_slice(&salt);
        header.extend_from_slice(&nonce_prefix);

        Ok(Box::new(EncryptReader {
            inner: input,
            cipher,
            nonce_prefix,
            counter: 0,
            carry: Vec::new(),
            out: header,
            pos: 0,
            done: false,
        }))
    }
}

impl StreamTransform for PassphraseEncryptor {
    fn apply(&self, input: ByteStream) -> Result<ByteStream> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_prefix);
        self.apply_with_parameters(input, salt, nonce_prefix)
    }

    fn invert(&self, mut input: ByteStream) -> Result<ByteStream> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_truncated(&mut input, &mut header).map_err(BackupError::from_stream_error)?;

        if &header[..MAGIC.len()] != MAGIC {
            return Err(BackupError::transform("not a passphrase-encrypted artifact"));
        }
        if header[MAGIC.len()] != FORMAT_VERSION {
            return Err(BackupError::transform(format!(
                "unsupported encryption format version {}",
                header[MAGIC.len()]
            )));
        }

        let field = |offset: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&header[offset..offset + 4]);
            u32::from_be_bytes(bytes)
        };
        let costs_at = MAGIC.len() + 1;
        let kdf = KdfParams {
            m_cost: field(costs_at),
            t_cost: field(costs_at + 4),
            p_cost: field(costs_at + 8),
        };
        let salt_at = costs_at + 12;
        let salt = &header[salt_at..salt_at + SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&header[salt_at + SALT_LEN..]);

        let cipher = derive_key(&self.passphrase, salt, kdf)?;
        Ok(Box::new(DecryptReader {
            inner: input,
            cipher,
            nonce_prefix,
            counter: 0,
            out: Vec::new(),
            pos: 0,
            done: false,
        }))
    }

    fn extension(&self) -> Option<&str> {
        Some("enc")
    }

    fn algorithm_name(&self) -> &str {
        "aes-256-gcm"
    }
}

/// Copy buffered output into `buf`, returning how much was served
fn serve(out: &[u8], pos: &mut usize, buf: &mut [u8]) -> usize {
    let n = buf.len().min(out.len() - *pos);
    buf[..n].copy_from_slice(&out[*pos..*pos + n]);
    *pos += n;
    n
}

fn read_exact_or_truncated<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            invalid_data("encrypted stream is truncated")
        } else {
            e
        }
    })
}

struct EncryptReader {
    inner: ByteStream,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    /// Byte read ahead to learn whether the current chunk is the last
    carry: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    done: bool,
}

impl EncryptReader {
    fn seal_next_frame(&mut self) -> io::Result<()> {
        let mut chunk = std::mem::take(&mut self.carry);
        let wanted = (CHUNK_SIZE + 1 - chunk.len()) as u64;
        self.inner.by_ref().take(wanted).read_to_end(&mut chunk)?;

        let last = chunk.len() <= CHUNK_SIZE;
        if !last {
            self.carry = chunk.split_off(CHUNK_SIZE);
        }
        let flag = if last { FLAG_LAST } else { FLAG_MORE };

        let nonce = frame_nonce(&self.nonce_prefix, self.counter, flag);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &chunk,
                    aad: &[flag],
                },
            )
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "frame encryption failed"))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream exceeds frame limit"))?;

        self.out.clear();
        self.pos = 0;
        self.out.push(flag);
        self.out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&sealed);
        self.done = last;
        Ok(())
    }
}

impl Read for EncryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                return Ok(serve(&self.out, &mut self.pos, buf));
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.seal_next_frame()?;
        }
    }
}

struct DecryptReader {
    inner: ByteStream,
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    out: Vec<u8>,
    pos: usize,
    done: bool,
}

impl DecryptReader {
    fn open_next_frame(&mut self) -> io::Result<()> {
        let mut frame_header = [0u8; 5];
        read_exact_or_truncated(&mut self.inner, &mut frame_header)?;
        let flag = frame_header[0];
        if flag != FLAG_MORE && flag != FLAG_LAST {
            return Err(invalid_data(format!("invalid frame flag {flag}")));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&frame_header[1..]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if !(TAG_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(invalid_data(format!("invalid frame length {len}")));
        }

        let mut sealed = vec![0u8; len];
        read_exact_or_truncated(&mut self.inner, &mut sealed)?;
        let nonce = frame_nonce(&self.nonce_prefix, self.counter, flag);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &[flag],
                },
            )
            .map_err(|_| {
                invalid_data("authentication failed: wrong passphrase or corrupted artifact")
            })?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| invalid_data("stream exceeds frame limit"))?;

        self.out = plain;
        self.pos = 0;
        if flag == FLAG_LAST {
            let mut peek = [0u8; 1];
            loop {
                match self.inner.read(&mut peek) {
                    Ok(0) => break,
                    Ok(_) => return Err(invalid_data("unexpected data after final frame")),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            self.done = true;
        }
        Ok(())
    }
}

impl Read for DecryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                return Ok(serve(&self.out, &mut self.pos, buf));
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.open_next_frame()?;
        }
    }
}
