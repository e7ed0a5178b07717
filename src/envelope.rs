//! Chunk framing for inscription envelopes

use {
    bitcoin::{
        Opcode, PublicKey, Script, ScriptBuf,
        blockdata::{
            constants::MAX_SCRIPT_ELEMENT_SIZE,
            opcodes::{
                self,
                all::{OP_CHECKSIGVERIFY, OP_DROP, OP_PUSHNUM_1, OP_PUSHNUM_16},
            },
            script::Instruction::{Op, PushBytes},
        },
        script::{Builder, PushBytesBuf},
    },
    thiserror::Error,
};

/// The literal pushed at the start of every envelope
pub const MARKER: &[u8] = b"ord";

/// Maximum number of payload bytes carried by one data chunk
pub const MAX_CHUNK_LEN: usize = 240;

/// Maximum serialized size of the chunks revealed by a single transaction
pub const MAX_PARTIAL_LEN: usize = 1500;

/// Errors that can occur while framing or parsing an envelope
#[derive(Debug, Error)]
pub enum Error {
    /// Content type does not fit in a single script element
    #[error("content type too long ({0} bytes, max {max})", max = MAX_SCRIPT_ELEMENT_SIZE)]
    ContentTypeTooLong(usize),
    /// Nothing to inscribe
    #[error("no data to inscribe")]
    EmptyPayload,
    /// Part count cannot be represented by a two byte push
    #[error("payload splits into {0} parts, max {max}", max = u16::MAX)]
    TooManyParts(usize),
    /// A raw push exceeds the script element limit
    #[error("push of {0} bytes exceeds the script element limit")]
    ElementTooLarge(usize),
    /// Script bytes could not be parsed into instructions
    #[error("invalid script: {0}")]
    Script(#[from] bitcoin::script::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A single element of an envelope script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw byte push of at most [`MAX_SCRIPT_ELEMENT_SIZE`] bytes
    Push(PushBytesBuf),
    /// Number push: inline opcode for 0 through 16, otherwise a one or two byte push
    Number(u16),
    /// Bare opcode without operand
    Op(Opcode),
}

/// Ordered chunks encoding one content type and payload
pub type Envelope = Vec<Chunk>;

impl Chunk {
    /// Creates a raw push, rejecting data larger than a script element
    pub fn push(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(Error::ElementTooLarge(bytes.len()));
        }

        let bytes =
            PushBytesBuf::try_from(bytes.to_vec()).map_err(|_| Error::ElementTooLarge(bytes.len()))?;
        Ok(Chunk::Push(bytes))
    }

    /// Returns the pushed bytes of a raw push
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Push(bytes) => Some(bytes.as_bytes()),
            _ => None,
        }
    }

    /// Appends the chunk to a script builder
    pub fn append_to_builder(&self, builder: Builder) -> Builder {
        match *self {
            Chunk::Push(ref bytes) => builder.push_slice(bytes),
            Chunk::Number(0) => builder.push_opcode(opcodes::OP_0),
            Chunk::Number(n @ 1..=16) => {
                builder.push_opcode(Opcode::from(OP_PUSHNUM_1.to_u8() + n as u8 - 1))
            }
            Chunk::Number(n @ 17..=127) => builder.push_slice([n as u8]),
            Chunk::Number(n) => builder.push_slice([(n % 256) as u8, (n / 256) as u8]),
            Chunk::Op(op) => builder.push_opcode(op),
        }
    }

    /// Interprets the chunk as a number the way envelope parts are counted.
    ///
    /// An empty push is zero, a one byte push is its byte and `OP_1` through `OP_16`
    /// are their values. A two byte push decodes as `byte1 * 255 + byte0`, which is
    /// not the little-endian base the encoder uses. Deployed decoders read counts
    /// this way, so it is kept as is.
    pub fn number(&self) -> Option<u32> {
        match self {
            Chunk::Push(bytes) => match bytes.as_bytes() {
                [] => Some(0),
                [b0] => Some(*b0 as u32),
                [b0, b1] => Some(*b1 as u32 * 255 + *b0 as u32),
                _ => None,
            },
            Chunk::Number(n @ 0..=127) => Some(*n as u32),
            Chunk::Number(n) => Some((n / 256) as u32 * 255 + (n % 256) as u32),
            Chunk::Op(op) => {
                let code = op.to_u8();
                if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
                    Some((code - OP_PUSHNUM_1.to_u8() + 1) as u32)
                } else {
                    None
                }
            }
        }
    }
}

/// Frames a content type and payload into envelope chunks.
///
/// Layout: marker, part count, content type, then for each part of at most
/// [`MAX_CHUNK_LEN`] bytes the number of parts remaining after it followed by the
/// part itself. The remaining count reaches zero on the last part.
pub fn encode(content_type: &[u8], payload: &[u8]) -> Result<Envelope> {
    if content_type.len() > MAX_SCRIPT_ELEMENT_SIZE {
        return Err(Error::ContentTypeTooLong(content_type.len()));
    }

    if payload.is_empty() {
        return Err(Error::EmptyPayload);
    }

    let parts: Vec<&[u8]> = payload.chunks(MAX_CHUNK_LEN).collect();
    let count = u16::try_from(parts.len()).map_err(|_| Error::TooManyParts(parts.len()))?;

    let mut envelope = Vec::with_capacity(3 + 2 * parts.len());
    envelope.push(Chunk::push(MARKER)?);
    envelope.push(Chunk::Number(count));
    envelope.push(Chunk::push(content_type)?);

    for (n, part) in parts.into_iter().enumerate() {
        envelope.push(Chunk::Number(count - n as u16 - 1));
        envelope.push(Chunk::push(part)?);
    }

    Ok(envelope)
}

/// Serializes chunks into a script
pub fn to_script(chunks: &[Chunk]) -> ScriptBuf {
    append_to_builder(chunks, Builder::new()).into_script()
}

/// Appends chunks to a script builder
pub fn append_to_builder(chunks: &[Chunk], builder: Builder) -> Builder {
    chunks
        .iter()
        .fold(builder, |builder, chunk| chunk.append_to_builder(builder))
}

/// Parses a script into chunks. Pushes become [`Chunk::Push`] (`OP_0` is an empty
/// push) and every other instruction becomes [`Chunk::Op`]. Numbers therefore come
/// back as pushes or `OP_1` through `OP_16`; read them with [`Chunk::number`].
/// Serializing the result gives back the same script bytes.
pub fn from_script(script: &Script) -> Result<Vec<Chunk>> {
    script
        .instructions()
        .map(|instruction| match instruction? {
            PushBytes(push) => Chunk::push(push.as_bytes()),
            Op(op) => Ok(Chunk::Op(op)),
        })
        .collect()
}

/// A run of envelope chunks revealed by one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partial {
    chunks: Vec<Chunk>,
}

impl Partial {
    /// Creates an empty partial
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the chunks in reveal order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Appends a chunk
    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// Removes the last chunk
    pub fn pop(&mut self) -> Option<Chunk> {
        self.chunks.pop()
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the partial holds no chunks
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Serialized size of the chunks as script bytes
    pub fn script_len(&self) -> usize {
        to_script(&self.chunks).len()
    }

    /// Builds the redeem script committing to this partial:
    /// `<pubkey> OP_CHECKSIGVERIFY OP_DROP*n OP_TRUE`, one drop per chunk.
    pub fn lock_script(&self, public_key: &PublicKey) -> ScriptBuf {
        let mut builder = Builder::new()
            .push_key(public_key)
            .push_opcode(OP_CHECKSIGVERIFY);

        for _ in &self.chunks {
            builder = builder.push_opcode(OP_DROP);
        }

        builder.push_opcode(opcodes::OP_TRUE).into_script()
    }

    /// Builds the script spending a commitment to `lock`: the chunks, the signature
    /// and the serialized lock script.
    pub fn unlock_script(&self, signature: &[u8], lock: &Script) -> Result<ScriptBuf> {
        let signature = Chunk::push(signature)?;
        let lock = Chunk::push(lock.as_bytes())?;

        let builder = append_to_builder(&self.chunks, Builder::new());
        let builder = signature.append_to_builder(builder);
        Ok(lock.append_to_builder(builder).into_script())
    }
}

impl From<Vec<Chunk>> for Partial {
    fn from(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}
