//! Error types for repository operations

use std::error::Error;
use std::fmt;
use thicket_common::{CidError, DecodeError, IpldCid};

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Bytes were not a canonical object, or an object had the wrong structure
    Decode,
    /// A block did not hash to its CID, or a tree violated its invariants
    Integrity,
    /// Referenced block or record missing
    NotFound,
    /// Revision went backwards
    Order,
    /// A write's precondition did not hold (record exists, prev mismatch)
    Conflict,
    /// Storage operation failed
    Storage,
    /// Invalid record key
    InvalidKey,
    /// Invalid commit structure
    InvalidCommit,
    /// CAR container framing failed
    Container,
    /// Signing or signature verification failed
    Crypto,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// Context attached to the error, if any
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    // Constructors for different error kinds

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create a decode error
    pub fn decode(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Decode, Some(Box::new(source)))
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Integrity, Some(msg.into().into()))
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::integrity(msg).with_help("MST nodes must follow protocol structure")
    }

    /// Create a CID mismatch error
    pub fn cid_mismatch(cid: &IpldCid) -> Self {
        Self::new(RepoErrorKind::Integrity, None)
            .with_context(format!("block does not hash to {}", cid))
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys must match [a-zA-Z0-9._:~/-]+, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }

    /// Create an already exists error
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::Conflict, None)
            .with_context(format!("{} already exists: {}", resource, id))
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Conflict, Some(msg.into().into()))
    }

    /// Create an ordering error
    pub fn order(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Order, Some(msg.into().into()))
            .with_help("revisions must never decrease")
    }

    /// Create a crypto error
    pub fn crypto(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Crypto, Some(Box::new(source)))
    }

    /// Create a CAR container error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Container, Some(Box::new(source)))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<DecodeError> for RepoError {
    fn from(e: DecodeError) -> Self {
        RepoError::decode(e)
    }
}

impl From<CidError> for RepoError {
    fn from(e: CidError) -> Self {
        RepoError::decode(e)
    }
}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::io(e)
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// The same key given twice with different values
    #[error("Conflicting values for key {key}")]
    #[diagnostic(help("each key may appear once per build"))]
    ConflictingDuplicate {
        /// The repeated key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            e @ MstError::ConflictingDuplicate { .. } => {
                RepoError::new(RepoErrorKind::Conflict, Some(Box::new(e)))
            }
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(i64),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature not in low-S form
    #[error("Signature is not low-S normalized")]
    #[diagnostic(help("ECDSA signatures must use the lower of the two valid S values"))]
    HighS,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// The signer failed to produce a signature
    #[error("Signing failed")]
    Signing(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::InvalidSignature(msg) => {
                RepoError::new(RepoErrorKind::Crypto, Some(msg.into()))
                    .with_context("invalid signature format".to_string())
            }
            CommitError::HighS => RepoError::new(RepoErrorKind::Crypto, None)
                .with_context("signature is not low-S".to_string()),
            CommitError::SignatureVerificationFailed => RepoError::new(RepoErrorKind::Crypto, None)
                .with_context("signature verification failed".to_string()),
            CommitError::InvalidKey(msg) => RepoError::new(RepoErrorKind::Crypto, Some(msg.into()))
                .with_context("invalid key format".to_string()),
            CommitError::Signing(e) => {
                RepoError::new(RepoErrorKind::Crypto, Some(e)).with_context("signing failed")
            }
        }
    }
}

/// Typed decode attempt failures for commits and MST nodes.
///
/// `Mismatch` means the value is some other kind of object; `Invalid` means
/// it has the right shape but breaks a rule of that kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum ShapeError {
    /// Value is not this kind of object
    #[error("not a {0}")]
    #[diagnostic(code(shape::mismatch))]
    Mismatch(&'static str),

    /// Value has the shape but invalid content
    #[error("invalid {what}: {reason}")]
    #[diagnostic(code(shape::invalid))]
    Invalid {
        /// Kind of object
        what: &'static str,
        /// What was wrong
        reason: String,
    },
}

impl ShapeError {
    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        ShapeError::Invalid {
            what,
            reason: reason.into(),
        }
    }
}

impl From<ShapeError> for RepoError {
    fn from(e: ShapeError) -> Self {
        RepoError::decode(e)
    }
}

/// CAR container errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ContainerError {
    /// Underlying reader or writer failed
    #[error("container I/O failed")]
    #[diagnostic(code(car::io))]
    Io(#[from] std::io::Error),

    /// Stream ended inside the header or a section
    #[error("container truncated at byte {offset}")]
    #[diagnostic(code(car::truncated))]
    Truncated {
        /// Stream offset where input ran out
        offset: u64,
    },

    /// Length varint overflowed or was not minimal
    #[error("malformed length varint at byte {offset}")]
    #[diagnostic(code(car::varint))]
    Varint {
        /// Stream offset of the varint
        offset: u64,
    },

    /// Header length exceeds the configured maximum
    #[error("header is {size} bytes, max {max}")]
    #[diagnostic(code(car::header_too_large))]
    HeaderTooLarge {
        /// Declared size
        size: u64,
        /// Configured maximum
        max: usize,
    },

    /// Header was not a valid canonical `{roots, version}` map
    #[error("invalid container header: {0}")]
    #[diagnostic(
        code(car::header),
        help("the header must be a canonical map {{roots: [link], version: 1}}")
    )]
    Header(String),

    /// Header version other than 1
    #[error("unsupported container version {0}")]
    #[diagnostic(code(car::version))]
    UnsupportedVersion(u64),

    /// Section CID could not be parsed; the section was skipped
    #[error("invalid CID in section at byte {offset}")]
    #[diagnostic(code(car::section_cid))]
    InvalidCid {
        /// Stream offset of the section
        offset: u64,
        /// Parse failure
        #[source]
        source: CidError,
    },

    /// Section declared an implausibly long CID; the section was skipped
    #[error("section at byte {offset} declares a {len}-byte CID")]
    #[diagnostic(code(car::cid_too_long))]
    CidTooLong {
        /// Stream offset of the section
        offset: u64,
        /// Declared CID length
        len: u64,
    },

    /// Section block exceeds the configured maximum; the section was skipped
    #[error("block at byte {offset} is {size} bytes, max {max}")]
    #[diagnostic(code(car::block_too_large))]
    BlockTooLarge {
        /// Stream offset of the section
        offset: u64,
        /// Declared size
        size: u64,
        /// Configured maximum
        max: usize,
    },
}

impl ContainerError {
    /// Whether the reader is still positioned at a section boundary, so the
    /// caller may report this section and keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContainerError::InvalidCid { .. }
                | ContainerError::CidTooLong { .. }
                | ContainerError::BlockTooLarge { .. }
        )
    }
}

impl From<ContainerError> for RepoError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Io(io) => RepoError::io(io),
            e => RepoError::car(e),
        }
    }
}

/// Per-block problem reported by the walker.
///
/// Faults are delivered on their own channel; the walk continues past them
/// unless the visitor asks to stop.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BlockFault {
    /// Block bytes do not hash to the section's CID
    #[error("block {index} does not match its CID {cid}")]
    #[diagnostic(code(walk::cid_mismatch))]
    CidMismatch {
        /// Position in the stream
        index: usize,
        /// CID from the section
        cid: IpldCid,
    },

    /// Block bytes are not a canonical object
    #[error("block {index} ({cid}) is not canonical")]
    #[diagnostic(code(walk::undecodable))]
    Undecodable {
        /// Position in the stream
        index: usize,
        /// CID from the section
        cid: IpldCid,
        /// Decode failure
        #[source]
        source: DecodeError,
    },

    /// Block looks like a commit or MST node but breaks its rules
    #[error("block {index} ({cid}) is malformed")]
    #[diagnostic(code(walk::malformed))]
    Malformed {
        /// Position in the stream
        index: usize,
        /// CID from the section
        cid: IpldCid,
        /// Structure failure
        #[source]
        source: ShapeError,
    },

    /// Section could not be read but the stream is still aligned
    #[error("section {index} skipped")]
    #[diagnostic(code(walk::section))]
    Section {
        /// Position in the stream
        index: usize,
        /// Recoverable container failure
        #[source]
        source: ContainerError,
    },
}

impl BlockFault {
    /// Position of the faulty section in the stream
    pub fn index(&self) -> usize {
        match self {
            BlockFault::CidMismatch { index, .. }
            | BlockFault::Undecodable { index, .. }
            | BlockFault::Malformed { index, .. }
            | BlockFault::Section { index, .. } => *index,
        }
    }

    /// CID of the faulty block, when the section carried a readable one
    pub fn cid(&self) -> Option<&IpldCid> {
        match self {
            BlockFault::CidMismatch { cid, .. }
            | BlockFault::Undecodable { cid, .. }
            | BlockFault::Malformed { cid, .. } => Some(cid),
            BlockFault::Section { .. } => None,
        }
    }

    /// Error category this fault belongs to
    pub fn kind(&self) -> RepoErrorKind {
        match self {
            BlockFault::CidMismatch { .. } => RepoErrorKind::Integrity,
            BlockFault::Undecodable { .. } | BlockFault::Malformed { .. } => RepoErrorKind::Decode,
            BlockFault::Section { .. } => RepoErrorKind::Container,
        }
    }
}

impl From<BlockFault> for RepoError {
    fn from(e: BlockFault) -> Self {
        let kind = e.kind();
        RepoError::new(kind, Some(Box::new(e)))
    }
}
