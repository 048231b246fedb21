//! Commit structures and signature verification for repositories.
//!
//! A commit binds a tree root to a revision and the previous commit, and is
//! signed over its canonical encoding without the `sig` field.

pub mod rev;
pub mod sign;

pub use rev::{Revision, TidClock};
pub use sign::{FnSigner, PublicKey, Signer, Verifier};

use crate::car::Block;
use crate::error::{CommitError, RepoError, Result, ShapeError};
use bytes::Bytes;
use smol_str::SmolStr;
use thicket_common::{IpldCid, Map, Value, compute_cid, decode, encode};

/// Version written by this crate
pub const COMMIT_VERSION: u64 = 3;

const COMMIT: &str = "commit";

/// Commit fields before signing
///
/// `did` is optional: it is carried through when present and omitted from the
/// encoding when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCommit {
    /// Repository DID
    pub did: Option<SmolStr>,
    /// Commit version (2 or 3)
    pub version: u64,
    /// MST root CID
    pub data: IpldCid,
    /// Revision
    pub rev: Revision,
    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,
}

impl UnsignedCommit {
    /// Version 3 commit without a DID
    pub fn new(data: IpldCid, rev: Revision, prev: Option<IpldCid>) -> Self {
        Self {
            did: None,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
        }
    }

    /// Set the repository DID
    pub fn with_did(mut self, did: impl Into<SmolStr>) -> Self {
        self.did = Some(did.into());
        self
    }

    /// Next commit after `prev`, whose CID is `prev_cid`.
    ///
    /// Revisions never go backwards: a `rev` lower than the previous
    /// commit's is an `Order` error. An equal revision is accepted.
    pub fn successor(prev: &Commit, prev_cid: IpldCid, data: IpldCid, rev: Revision) -> Result<Self> {
        check_rev(&prev.rev, &rev)?;
        Ok(Self {
            did: prev.did.clone(),
            version: COMMIT_VERSION,
            data,
            rev,
            prev: Some(prev_cid),
        })
    }

    fn fields(&self) -> Map {
        let mut map = Map::new();
        if let Some(did) = &self.did {
            map.insert("did".into(), Value::Text(did.clone()));
        }
        map.insert("version".into(), Value::Unsigned(self.version));
        map.insert("data".into(), Value::Link(self.data));
        map.insert("rev".into(), Value::text(self.rev.as_str()));
        map.insert("prev".into(), Value::from(self.prev));
        map
    }

    /// Canonical object form (no `sig` key)
    pub fn to_value(&self) -> Value {
        Value::Map(self.fields())
    }

    /// Canonical signing payload
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.to_value())
    }

    /// Sign this commit
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(rev = %self.rev)))]
    pub fn sign(self, signer: &impl Signer) -> Result<Commit> {
        let sig = signer.sign(&self.to_bytes())?;
        Ok(Commit {
            did: self.did,
            version: self.version,
            data: self.data,
            rev: self.rev,
            prev: self.prev,
            sig,
        })
    }
}

/// Repository commit object
///
/// Stored as a block in CAR files, identified by its CID.
///
/// **Version compatibility**: v2 and v3 commits share one layout; `prev` is
/// always written, as null when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Repository DID
    pub did: Option<SmolStr>,
    /// Commit version (2 or 3)
    pub version: u64,
    /// MST root CID
    pub data: IpldCid,
    /// Revision
    pub rev: Revision,
    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,
    /// Signature bytes
    pub sig: Bytes,
}

/// `next` may follow `prev` only if it does not sort before it
pub(crate) fn check_rev(prev: &Revision, next: &Revision) -> Result<()> {
    if next < prev {
        return Err(RepoError::order(format!(
            "revision {} is older than previous revision {}",
            next, prev
        )));
    }
    Ok(())
}

fn field<'v>(map: &'v Map, key: &str) -> std::result::Result<&'v Value, ShapeError> {
    map.get(key)
        .ok_or_else(|| ShapeError::invalid(COMMIT, format!("missing {}", key)))
}

impl Commit {
    /// Get the repository DID
    pub fn did(&self) -> Option<&str> {
        self.did.as_deref()
    }

    /// Get the MST root CID
    pub fn data(&self) -> &IpldCid {
        &self.data
    }

    /// Get the revision
    pub fn rev(&self) -> &Revision {
        &self.rev
    }

    /// Get the previous commit CID
    pub fn prev(&self) -> Option<&IpldCid> {
        self.prev.as_ref()
    }

    /// Get the signature bytes
    pub fn sig(&self) -> &Bytes {
        &self.sig
    }

    /// The fields that were signed
    pub fn unsigned(&self) -> UnsignedCommit {
        UnsignedCommit {
            did: self.did.clone(),
            version: self.version,
            data: self.data,
            rev: self.rev.clone(),
            prev: self.prev,
        }
    }

    /// Canonical object form
    pub fn to_value(&self) -> Value {
        let mut map = self.unsigned().fields();
        map.insert("sig".into(), Value::Bytes(self.sig.clone()));
        Value::Map(map)
    }

    /// Typed decode attempt.
    ///
    /// A map whose key set is not `{data, prev, rev, sig, version}` (plus an
    /// optional `did`) is a [`ShapeError::Mismatch`]. A commit-shaped map with
    /// wrong field types or an unsupported version is [`ShapeError::Invalid`].
    pub fn from_value(value: &Value) -> std::result::Result<Self, ShapeError> {
        const REQUIRED: [&str; 5] = ["data", "prev", "rev", "sig", "version"];
        let map = value
            .as_map()
            .filter(|m| {
                let extra = usize::from(m.contains_key("did"));
                m.len() == REQUIRED.len() + extra && REQUIRED.iter().all(|k| m.contains_key(*k))
            })
            .ok_or(ShapeError::Mismatch(COMMIT))?;

        let version = field(map, "version")?
            .as_u64()
            .filter(|v| matches!(v, 2 | 3))
            .ok_or_else(|| ShapeError::invalid(COMMIT, "version must be 2 or 3"))?;
        let data = *field(map, "data")?
            .as_link()
            .ok_or_else(|| ShapeError::invalid(COMMIT, "data must be a link"))?;
        let rev = field(map, "rev")?
            .as_str()
            .ok_or_else(|| ShapeError::invalid(COMMIT, "rev must be text"))?;
        let prev = match field(map, "prev")? {
            Value::Null => None,
            Value::Link(cid) => Some(*cid),
            _ => return Err(ShapeError::invalid(COMMIT, "prev must be a link or null")),
        };
        let sig = field(map, "sig")?
            .as_bytes()
            .ok_or_else(|| ShapeError::invalid(COMMIT, "sig must be a byte string"))?
            .clone();
        let did = match map.get("did") {
            None => None,
            Some(Value::Text(did)) => Some(did.clone()),
            Some(_) => return Err(ShapeError::invalid(COMMIT, "did must be text")),
        };

        Ok(Self {
            did,
            version,
            data,
            rev: Revision::new(rev),
            prev,
            sig,
        })
    }

    /// Canonical bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.to_value())
    }

    /// Decode canonical bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value = decode(data)?;
        Self::from_value(&value).map_err(|e| match e {
            ShapeError::Mismatch(_) => RepoError::invalid_commit(e.to_string()),
            e => e.into(),
        })
    }

    /// Compute CID of this commit
    pub fn cid(&self) -> Result<IpldCid> {
        Ok(compute_cid(&self.to_bytes())?)
    }

    /// Encoded block with its CID
    pub fn to_block(&self) -> Result<Block> {
        Ok(Block::encode(&self.to_value())?)
    }

    /// Verify the signature over the unsigned bytes
    pub fn verify(&self, verifier: &impl Verifier) -> std::result::Result<(), CommitError> {
        if !matches!(self.version, 2 | 3) {
            return Err(CommitError::InvalidVersion(self.version as i64));
        }
        verifier.verify(&self.unsigned().to_bytes(), &self.sig)
    }
}

/// Build and sign a commit from its unsigned state.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(rev = %state.rev, data = %state.data)))]
pub fn create_commit(state: UnsignedCommit, signer: &impl Signer) -> Result<Commit> {
    if !matches!(state.version, 2 | 3) {
        return Err(CommitError::InvalidVersion(state.version as i64).into());
    }
    state.sign(signer)
}

/// Whether the commit's signature checks out
pub fn verify_commit(commit: &Commit, verifier: &impl Verifier) -> bool {
    commit.verify(verifier).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;

    fn key() -> k256::ecdsa::SigningKey {
        k256::ecdsa::SigningKey::from_slice(&[3u8; 32]).unwrap()
    }

    fn test_cid(n: u8) -> IpldCid {
        compute_cid(&[n]).unwrap()
    }

    fn signed(rev: &str) -> Commit {
        UnsignedCommit::new(test_cid(1), Revision::new(rev), None)
            .with_did("did:plc:abc123")
            .sign(&key())
            .unwrap()
    }

    #[test]
    fn unsigned_bytes_have_no_sig() {
        let state = UnsignedCommit::new(test_cid(1), Revision::new("3jzfcijpj2z2a"), None);
        let value = decode(&state.to_bytes()).unwrap();
        let map = value.as_map().unwrap();
        assert!(!map.contains_key("sig"));
        assert!(!map.contains_key("did"));
        assert_eq!(map["prev"], Value::Null);
        assert_eq!(map["version"], Value::Unsigned(3));
    }

    #[test]
    fn sign_and_verify() {
        let commit = signed("3jzfcijpj2z2a");
        assert_eq!(commit.sig.len(), 64);
        commit.verify(key().verifying_key()).unwrap();
        assert!(verify_commit(&commit, key().verifying_key()));

        let other = k256::ecdsa::SigningKey::from_slice(&[4u8; 32]).unwrap();
        assert!(!verify_commit(&commit, other.verifying_key()));

        let mut tampered = commit.clone();
        tampered.data = test_cid(2);
        assert!(!verify_commit(&tampered, key().verifying_key()));
    }

    #[test]
    fn bytes_round_trip_and_cid() {
        let commit = signed("3jzfcijpj2z2a");
        let bytes = commit.to_bytes();
        let decoded = Commit::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, commit);
        assert_eq!(decoded.cid().unwrap(), compute_cid(&bytes).unwrap());
        assert_eq!(commit.to_block().unwrap().cid, commit.cid().unwrap());
    }

    #[test]
    fn shape_checks() {
        let record = Value::map([("$type", Value::text("app.bsky.feed.post"))]);
        assert_eq!(Commit::from_value(&record), Err(ShapeError::Mismatch("commit")));

        let node = Value::map([("e", Value::Array(vec![])), ("l", Value::Null)]);
        assert!(matches!(Commit::from_value(&node), Err(ShapeError::Mismatch(_))));

        let mut fields = signed("3jzfcijpj2z2a").to_value().as_map().unwrap().clone();
        fields.insert("version".into(), Value::Unsigned(1));
        assert!(matches!(
            Commit::from_value(&Value::Map(fields.clone())),
            Err(ShapeError::Invalid { .. })
        ));

        fields.insert("version".into(), Value::Unsigned(3));
        fields.insert("data".into(), Value::text("not a link"));
        assert!(matches!(
            Commit::from_value(&Value::Map(fields.clone())),
            Err(ShapeError::Invalid { .. })
        ));

        fields.insert("extra".into(), Value::Null);
        assert!(matches!(
            Commit::from_value(&Value::Map(fields)),
            Err(ShapeError::Mismatch(_))
        ));
    }

    #[test]
    fn v2_commits_decode() {
        let mut commit = signed("3jzfcijpj2z2a");
        commit.version = 2;
        commit.prev = Some(test_cid(5));
        let decoded = Commit::from_bytes(&commit.to_bytes()).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.prev, Some(test_cid(5)));
    }

    #[test]
    fn successor_rejects_older_revision() {
        let first = signed("3jzfcijpj2z2b");
        let first_cid = first.cid().unwrap();

        let next = UnsignedCommit::successor(&first, first_cid, test_cid(2), Revision::new("3jzfcijpj2z2c"))
            .unwrap();
        assert_eq!(next.prev, Some(first_cid));
        assert_eq!(next.did.as_deref(), Some("did:plc:abc123"));

        // equal revisions are fine
        UnsignedCommit::successor(&first, first_cid, test_cid(2), Revision::new("3jzfcijpj2z2b")).unwrap();

        let err = UnsignedCommit::successor(&first, first_cid, test_cid(2), Revision::new("3jzfcijpj2z2a"))
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Order);
    }

    #[test]
    fn create_commit_checks_version() {
        let mut state = UnsignedCommit::new(test_cid(1), Revision::new("3jzfcijpj2z2a"), None);
        create_commit(state.clone(), &key()).unwrap();
        state.version = 4;
        let err = create_commit(state, &key()).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidCommit);
    }

    #[test]
    fn signer_failure_is_crypto_error() {
        let failing = FnSigner(|_: &[u8]| -> std::result::Result<Vec<u8>, std::io::Error> {
            Err(std::io::Error::other("unavailable"))
        });
        let state = UnsignedCommit::new(test_cid(1), Revision::new("3jzfcijpj2z2a"), None);
        let err = create_commit(state, &failing).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Crypto);
    }
}
