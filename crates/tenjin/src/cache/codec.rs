/*
 * cache/codec.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! On-disk encodings for cached artifacts.
//!
//! Every codec starts with a four-byte magic number and a format version so
//! that a file written by one codec is never misread by another.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::artifact::{Artifact, CacheEntry};
use crate::error::{CacheError, CacheResult};
use crate::runtime;

/// Converts artifacts to and from bytes.
pub trait ArtifactCodec: Send + Sync + Debug {
    fn encode(&self, artifact: &Artifact) -> CacheResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> CacheResult<Artifact>;
}

const BYTECODE_MAGIC: &[u8; 4] = b"TJNB";
const BYTECODE_VERSION: u8 = 2;
const DIGEST_LEN: usize = 32;
const PORTABLE_MAGIC: &[u8; 4] = b"TJNP";
const PORTABLE_VERSION: u8 = 1;
const TEXT_FORMAT: &str = "tenjin-text";
const TEXT_VERSION: u32 = 1;

fn check_header<'a>(bytes: &'a [u8], magic: &[u8; 4], version: u8) -> CacheResult<&'a [u8]> {
    let Some((head, rest)) = bytes.split_at_checked(5) else {
        return Err(CacheError::Decode("truncated header".to_string()));
    };
    if &head[..4] != magic {
        return Err(CacheError::Decode("bad magic number".to_string()));
    }
    if head[4] != version {
        return Err(CacheError::Incompatible(format!(
            "format version {} (expected {version})",
            head[4]
        )));
    }
    Ok(rest)
}

fn take_prefixed(bytes: &[u8]) -> CacheResult<(&[u8], &[u8])> {
    let truncated = || CacheError::Decode("truncated entry".to_string());
    let (len, rest) = bytes.split_at_checked(4).ok_or_else(truncated)?;
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    rest.split_at_checked(len).ok_or_else(truncated)
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> CacheResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CacheError::Encode("entry too large".to_string()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Lua bytecode plus a bincode-encoded entry.
///
/// Fastest to reload: the chunk is loaded straight from bytecode without
/// parsing. Files are tagged with the Lua build that wrote them and
/// rejected as [`CacheError::Incompatible`] by any other build. The entry
/// and bytecode are covered by a SHA-256 digest; the Lua loader does not
/// validate binary chunks, so a mismatch is a [`CacheError::Decode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BytecodeCodec;

impl ArtifactCodec for BytecodeCodec {
    fn encode(&self, artifact: &Artifact) -> CacheResult<Vec<u8>> {
        let bytecode =
            runtime::compile_bytecode(artifact).map_err(|e| CacheError::Encode(e.to_string()))?;
        let entry = bincode::serialize(&artifact.to_entry())
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        let mut payload = Vec::with_capacity(entry.len() + bytecode.len() + 4);
        put_prefixed(&mut payload, &entry)?;
        payload.extend_from_slice(&bytecode);

        let mut out = Vec::with_capacity(payload.len() + DIGEST_LEN + 64);
        out.extend_from_slice(BYTECODE_MAGIC);
        out.push(BYTECODE_VERSION);
        put_prefixed(&mut out, runtime::runtime_tag().as_bytes())?;
        out.extend_from_slice(&Sha256::digest(&payload));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<Artifact> {
        let rest = check_header(bytes, BYTECODE_MAGIC, BYTECODE_VERSION)?;
        let (tag, rest) = take_prefixed(rest)?;
        let expected = runtime::runtime_tag();
        if tag != expected.as_bytes() {
            return Err(CacheError::Incompatible(format!(
                "written by {}, this build is {expected}",
                String::from_utf8_lossy(tag)
            )));
        }
        let (digest, payload) = rest
            .split_at_checked(DIGEST_LEN)
            .ok_or_else(|| CacheError::Decode("truncated digest".to_string()))?;
        if Sha256::digest(payload).as_slice() != digest {
            return Err(CacheError::Decode("checksum mismatch".to_string()));
        }
        let (entry, bytecode) = take_prefixed(payload)?;
        let entry: CacheEntry =
            bincode::deserialize(entry).map_err(|e| CacheError::Decode(e.to_string()))?;

        let artifact = Artifact::from_entry(entry);
        if !bytecode.is_empty() {
            artifact.set_bytecode(bytecode.to_vec());
        }
        Ok(artifact)
    }
}

/// CBOR-encoded entry. Independent of the Lua build; the chunk is
/// regenerated and parsed on first execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableCodec;

impl ArtifactCodec for PortableCodec {
    fn encode(&self, artifact: &Artifact) -> CacheResult<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(PORTABLE_MAGIC);
        out.push(PORTABLE_VERSION);
        ciborium::into_writer(&artifact.to_entry(), &mut out)
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<Artifact> {
        let rest = check_header(bytes, PORTABLE_MAGIC, PORTABLE_VERSION)?;
        let entry: CacheEntry =
            ciborium::from_reader(rest).map_err(|e| CacheError::Decode(e.to_string()))?;
        Ok(Artifact::from_entry(entry))
    }
}

/// Pretty-printed JSON, including the generated Lua chunk for inspection.
/// The chunk is informational; decoding rebuilds it from the instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

#[derive(Serialize, Deserialize)]
struct TextEntry {
    format: String,
    version: u32,
    #[serde(flatten)]
    entry: CacheEntry,
    script: String,
}

impl ArtifactCodec for TextCodec {
    fn encode(&self, artifact: &Artifact) -> CacheResult<Vec<u8>> {
        let text = TextEntry {
            format: TEXT_FORMAT.to_string(),
            version: TEXT_VERSION,
            entry: artifact.to_entry(),
            script: artifact.script().to_string(),
        };
        serde_json::to_vec_pretty(&text).map_err(|e| CacheError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<Artifact> {
        let text: TextEntry =
            serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))?;
        if text.format != TEXT_FORMAT {
            return Err(CacheError::Decode(format!("unknown format {:?}", text.format)));
        }
        if text.version != TEXT_VERSION {
            return Err(CacheError::Incompatible(format!(
                "format version {} (expected {TEXT_VERSION})",
                text.version
            )));
        }
        Ok(Artifact::from_entry(text.entry))
    }
}
