//! Per-record transform and validation applied to every snapshot.

use crate::error::Result;
use crate::types::{Record, Snapshot};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rewrites a raw record into its normalized form. `Ok(None)` drops it.
pub type Transform = Arc<dyn Fn(Record) -> Result<Option<Record>> + Send + Sync>;

/// Rejects records that do not satisfy the schema.
pub type Validator = Arc<dyn Fn(&Record) -> Result<()> + Send + Sync>;

/// Called with every record that made it through the pipeline.
pub type RecordHook = Arc<dyn Fn(&Record) + Send + Sync>;

/// Transform then validation, run on each record of a snapshot.
///
/// A record the transform drops or that fails either step is logged and
/// left out; the rest of the snapshot is kept.
#[derive(Clone, Default)]
pub struct RecordPipeline {
    transform: Option<Transform>,
    validate: Option<Validator>,
    on_record: Option<RecordHook>,
}

impl RecordPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Result<Option<Record>> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Checked against the transformed record.
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Result<()> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn on_record<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.on_record = Some(Arc::new(f));
        self
    }

    /// Run the pipeline over one snapshot's records.
    pub fn apply(&self, records: Vec<Record>) -> Snapshot {
        let received = records.len();
        let out: Vec<Record> = records
            .into_iter()
            .filter_map(|record| self.accept(record))
            .collect();
        if out.len() < received {
            debug!(received, kept = out.len(), "records filtered");
        }
        Arc::from(out)
    }

    fn accept(&self, record: Record) -> Option<Record> {
        let record = match self.transform {
            Some(ref transform) => {
                let id = record.id.clone();
                match transform(record) {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        debug!(id = %id, "record dropped by transform");
                        return None;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "record transform failed");
                        return None;
                    }
                }
            }
            None => record,
        };
        if let Some(ref validate) = self.validate {
            if let Err(e) = validate(&record) {
                warn!(id = %record.id, error = %e, "record rejected");
                return None;
            }
        }
        if let Some(ref hook) = self.on_record {
            hook(&record);
        }
        Some(record)
    }
}

impl fmt::Debug for RecordPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordPipeline")
            .field("transform", &self.transform.is_some())
            .field("validate", &self.validate.is_some())
            .field("on_record", &self.on_record.is_some())
            .finish()
    }
}
