//! Persistent storage for the DAG.
//!
//! Provides a `Storage` trait and a sled-backed implementation for persisting
//! units, their consensus props, balls, the stable watermark, unhandled units
//! and known-bad units.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use super::dependencies::{KnownBadUnit, UnhandledUnit};
use crate::consensus::state::{ConsensusState, StateChanges};
use crate::consensus::{BallId, Unit, UnitId, UnitProps};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stored state is inconsistent: {0}")]
    Corrupted(String),
}

const LAST_STABLE_MCI_KEY: &[u8] = b"last_stable_mci";

/// Trait for persistent storage backends.
pub trait Storage: Send + Sync {
    fn put_unit(&self, unit: &Unit) -> Result<(), StorageError>;
    fn get_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError>;
    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError>;

    fn get_props(&self, id: &UnitId) -> Result<Option<UnitProps>, StorageError>;

    /// Every stored unit with its props, in no particular order.
    fn load_records(&self) -> Result<Vec<(Unit, UnitProps)>, StorageError>;

    fn unit_by_ball(&self, ball: &BallId) -> Result<Option<UnitId>, StorageError>;

    fn last_stable_mci(&self) -> Result<Option<u64>, StorageError>;

    /// Apply the outcome of one consensus update atomically.
    fn apply_consensus_batch(&self, batch: &ConsensusBatch) -> Result<(), StorageError>;

    fn put_unhandled(&self, unhandled: &UnhandledUnit) -> Result<(), StorageError>;
    fn remove_unhandled(&self, id: &UnitId) -> Result<(), StorageError>;
    fn get_all_unhandled(&self) -> Result<Vec<UnhandledUnit>, StorageError>;

    fn put_known_bad(&self, id: &UnitId, record: &KnownBadUnit) -> Result<(), StorageError>;
    fn get_known_bad(&self, id: &UnitId) -> Result<Option<KnownBadUnit>, StorageError>;
    fn get_all_known_bad(&self) -> Result<Vec<(UnitId, KnownBadUnit)>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Writes produced by one consensus update.
#[derive(Debug, Default)]
pub struct ConsensusBatch {
    /// Unit bodies: new units, and archived units whose content was stripped
    pub units: Vec<Unit>,
    pub props: Vec<(UnitId, UnitProps)>,
    pub balls: Vec<(BallId, UnitId)>,
    pub last_stable_mci: Option<u64>,
}

impl ConsensusBatch {
    /// Collect everything `changes` reports as modified in `state`.
    pub fn from_changes(state: &ConsensusState, changes: &StateChanges) -> Self {
        let mut batch = ConsensusBatch {
            balls: changes.new_balls.clone(),
            last_stable_mci: changes.last_stable_mci,
            ..Default::default()
        };
        for &idx in &changes.new_units {
            let record = state.get(idx);
            batch.units.push(record.unit.clone());
            batch.props.push((record.id(), record.props.clone()));
        }
        for &idx in &changes.touched {
            let record = state.get(idx);
            if record.props.archived {
                batch.units.push(record.unit.clone());
            }
            batch.props.push((record.id(), record.props.clone()));
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
            && self.props.is_empty()
            && self.balls.is_empty()
            && self.last_stable_mci.is_none()
    }
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    units: sled::Tree,
    props: sled::Tree,
    balls: sled::Tree,
    meta: sled::Tree,
    unhandled: sled::Tree,
    known_bad: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let open = |name: &str| db.open_tree(name).map_err(|e| StorageError::Io(e.to_string()));
        Ok(SledStorage {
            units: open("units")?,
            props: open("props")?,
            balls: open("balls")?,
            meta: open("meta")?,
            unhandled: open("unhandled")?,
            known_bad: open("known_bad")?,
            db,
        })
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(
        tree: &sled::Tree,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        match tree.get(key).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(bytes) => {
                let value = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    crate::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn unit_id_from_key(key: &[u8]) -> Result<UnitId, StorageError> {
    let hash: crate::Hash = key
        .try_into()
        .map_err(|_| StorageError::Serialization("invalid unit id key".into()))?;
    Ok(UnitId(hash))
}

impl Storage for SledStorage {
    fn put_unit(&self, unit: &Unit) -> Result<(), StorageError> {
        self.units
            .insert(unit.id.0, encode(unit)?)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError> {
        Self::get_decoded(&self.units, &id.0)
    }

    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError> {
        self.units
            .contains_key(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn get_props(&self, id: &UnitId) -> Result<Option<UnitProps>, StorageError> {
        Self::get_decoded(&self.props, &id.0)
    }

    fn load_records(&self) -> Result<Vec<(Unit, UnitProps)>, StorageError> {
        let mut records = Vec::new();
        for entry in self.units.iter() {
            let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let unit: Unit = crate::deserialize(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let props = self.get_props(&unit_id_from_key(&key)?)?.ok_or_else(|| {
                StorageError::Corrupted(format!("unit {} stored without props", unit.id))
            })?;
            records.push((unit, props));
        }
        Ok(records)
    }

    fn unit_by_ball(&self, ball: &BallId) -> Result<Option<UnitId>, StorageError> {
        match self
            .balls
            .get(ball.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(unit_id_from_key(&bytes)?)),
            None => Ok(None),
        }
    }

    fn last_stable_mci(&self) -> Result<Option<u64>, StorageError> {
        match self
            .meta
            .get(LAST_STABLE_MCI_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("bad stable mci".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn apply_consensus_batch(&self, batch: &ConsensusBatch) -> Result<(), StorageError> {
        // Encode up front: the transaction closure may run more than once.
        let units = batch
            .units
            .iter()
            .map(|u| Ok((u.id.0, encode(u)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let props = batch
            .props
            .iter()
            .map(|(id, p)| Ok((id.0, encode(p)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        (&self.units, &self.props, &self.balls, &self.meta)
            .transaction(|(units_tx, props_tx, balls_tx, meta_tx)| {
                for (key, value) in &units {
                    units_tx.insert(&key[..], value.as_slice())?;
                }
                for (key, value) in &props {
                    props_tx.insert(&key[..], value.as_slice())?;
                }
                for (ball, unit) in &batch.balls {
                    balls_tx.insert(&ball.0[..], &unit.0[..])?;
                }
                if let Some(mci) = batch.last_stable_mci {
                    meta_tx.insert(LAST_STABLE_MCI_KEY, &mci.to_be_bytes()[..])?;
                }
                Ok::<(), ConflictableTransactionError<StorageError>>(())
            })
            .map_err(|e: TransactionError<StorageError>| match e {
                TransactionError::Abort(inner) => inner,
                TransactionError::Storage(err) => StorageError::Io(err.to_string()),
            })?;

        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn put_unhandled(&self, unhandled: &UnhandledUnit) -> Result<(), StorageError> {
        self.unhandled
            .insert(unhandled.unit.id.0, encode(unhandled)?)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn remove_unhandled(&self, id: &UnitId) -> Result<(), StorageError> {
        self.unhandled
            .remove(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_all_unhandled(&self) -> Result<Vec<UnhandledUnit>, StorageError> {
        let mut out = Vec::new();
        for entry in self.unhandled.iter() {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let record: UnhandledUnit = crate::deserialize(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    fn put_known_bad(&self, id: &UnitId, record: &KnownBadUnit) -> Result<(), StorageError> {
        self.known_bad
            .insert(id.0, encode(record)?)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_known_bad(&self, id: &UnitId) -> Result<Option<KnownBadUnit>, StorageError> {
        Self::get_decoded(&self.known_bad, &id.0)
    }

    fn get_all_known_bad(&self) -> Result<Vec<(UnitId, KnownBadUnit)>, StorageError> {
        let mut out = Vec::new();
        for entry in self.known_bad.iter() {
            let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let record: KnownBadUnit = crate::deserialize(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push((unit_id_from_key(&key)?, record));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}
