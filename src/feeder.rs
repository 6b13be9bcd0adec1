//! Per-iteration test data read from a CSV file.
//!
//! A feeder hands one record to each virtual user iteration, cycling through the records
//! of the file forever. The first row of the file names the keys:
//!
//! ```text
//! username,password
//! alice,secret1
//! bob,secret2
//! ```
//!
//! Records are merged into the session of the user, so `${username}` placeholders
//! resolve to `alice` in one iteration and `bob` in the next.

use std::collections::HashMap;
use std::path::Path;

use crate::StampedeError;

/// One row of feeder data, keyed by column name.
pub type FeederRecord = HashMap<String, String>;

/// Records loaded and ready to be handed out.
#[derive(Debug, Clone)]
pub struct Feeder {
    records: Vec<FeederRecord>,
}
impl Feeder {
    /// Read a CSV file with a header row.
    pub fn from_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Feeder, StampedeError> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut records = Vec::new();
        for record in reader.deserialize() {
            let record: FeederRecord = record?;
            records.push(record);
        }
        info!("loaded {} feeder records from {}", records.len(), path.display());
        Feeder::from_records(records).map_err(|_| StampedeError::InvalidPlan {
            detail: format!("feeder file {} has no records", path.display()),
        })
    }

    /// Build a feeder from records already in memory.
    pub fn from_records(records: Vec<FeederRecord>) -> Result<Feeder, StampedeError> {
        if records.is_empty() {
            return Err(StampedeError::InvalidPlan {
                detail: "feeder has no records".to_string(),
            });
        }
        Ok(Feeder { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Start the feeder task, returning a handle to take records from.
    ///
    /// Records are handed over a one slot channel. The task exits once every handle
    /// has been dropped.
    pub fn spawn(self) -> FeederHandle {
        let (sender, receiver) = flume::bounded(1);
        tokio::spawn(feeder_main(self.records, sender));
        FeederHandle { receiver }
    }
}

async fn feeder_main(records: Vec<FeederRecord>, sender: flume::Sender<FeederRecord>) {
    let mut delivered: usize = 0;
    for record in records.iter().cycle() {
        if sender.send_async(record.clone()).await.is_err() {
            break;
        }
        delivered += 1;
    }
    debug!("feeder exiting after delivering {} records", delivered);
}

/// Takes records from a running feeder.
#[derive(Debug, Clone)]
pub struct FeederHandle {
    receiver: flume::Receiver<FeederRecord>,
}
impl FeederHandle {
    /// The next record, or `None` if the feeder is gone.
    pub async fn next(&self) -> Option<FeederRecord> {
        self.receiver.recv_async().await.ok()
    }
}
