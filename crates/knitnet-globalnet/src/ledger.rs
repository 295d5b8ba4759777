//! Versioned storage for the allocation record
//!
//! Every read returns an opaque [`Version`]; a write only lands if the
//! stored version still matches, otherwise it fails with
//! [`Error::Conflict`] and the caller re-reads.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use knitnet_common::{Error, Result};

use crate::record::{GlobalAllocationRecord, GLOBALNET_CONFIG_MAP};

/// Opaque token identifying one revision of the ledger
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    /// Wrap a storage-specific revision token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare-and-swap storage for a [`GlobalAllocationRecord`]
#[async_trait]
pub trait VersionedLedger: Send + Sync {
    /// Human-readable name used in errors and logs
    fn name(&self) -> String;

    /// Current record and its version. A missing ledger is [`Error::NotFound`].
    async fn read(&self) -> Result<(GlobalAllocationRecord, Version)>;

    /// Replace the record only if the stored version is still `expected`.
    ///
    /// Fails with [`Error::Conflict`] when another writer got there first.
    async fn write_if_unchanged(
        &self,
        record: &GlobalAllocationRecord,
        expected: &Version,
    ) -> Result<()>;

    /// Create the ledger. Returns `false` if it already existed.
    async fn create(&self, record: &GlobalAllocationRecord) -> Result<bool>;
}

struct Stored {
    data: BTreeMap<String, String>,
    version: u64,
}

#[derive(Default)]
struct State {
    stored: Option<Stored>,
    writes: u32,
    conflicts: u32,
}

/// Process-local ledger.
///
/// Stores the encoded key/value form so the codec is exercised on every
/// round trip, and bumps a counter as its version.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    /// A ledger that has not been created yet
    pub fn empty() -> Self {
        Self::default()
    }

    /// A ledger already holding `record`
    pub fn with_record(record: &GlobalAllocationRecord) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(State {
                stored: Some(Stored {
                    data: record.to_data()?,
                    version: 1,
                }),
                ..Default::default()
            }),
        })
    }

    /// Successful writes (create excluded)
    pub fn writes(&self) -> u32 {
        self.lock().map(|s| s.writes).unwrap_or_default()
    }

    /// Writes rejected because of a stale version
    pub fn conflicts(&self) -> u32 {
        self.lock().map(|s| s.conflicts).unwrap_or_default()
    }

    /// Stored record, decoded
    pub fn snapshot(&self) -> Result<Option<GlobalAllocationRecord>> {
        let state = self.lock()?;
        state
            .stored
            .as_ref()
            .map(|s| GlobalAllocationRecord::from_data(&s.data))
            .transpose()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::internal_with_context("ledger", "in-memory ledger lock poisoned"))
    }
}

#[async_trait]
impl VersionedLedger for InMemoryLedger {
    fn name(&self) -> String {
        format!("memory/{GLOBALNET_CONFIG_MAP}")
    }

    async fn read(&self) -> Result<(GlobalAllocationRecord, Version)> {
        let state = self.lock()?;
        let stored = state
            .stored
            .as_ref()
            .ok_or_else(|| Error::not_found("ledger", self.name()))?;
        let record = GlobalAllocationRecord::from_data(&stored.data)?;
        Ok((record, Version::new(stored.version.to_string())))
    }

    async fn write_if_unchanged(
        &self,
        record: &GlobalAllocationRecord,
        expected: &Version,
    ) -> Result<()> {
        let data = record.to_data()?;
        let mut state = self.lock()?;
        let current = match state.stored.as_ref() {
            Some(stored) => stored.version,
            None => return Err(Error::not_found("ledger", self.name())),
        };
        if current.to_string() != expected.as_str() {
            state.conflicts += 1;
            return Err(Error::conflict(self.name()));
        }
        state.stored = Some(Stored {
            data,
            version: current + 1,
        });
        state.writes += 1;
        Ok(())
    }

    async fn create(&self, record: &GlobalAllocationRecord) -> Result<bool> {
        let data = record.to_data()?;
        let mut state = self.lock()?;
        if state.stored.is_some() {
            return Ok(false);
        }
        state.stored = Some(Stored { data, version: 1 });
        Ok(true)
    }
}
