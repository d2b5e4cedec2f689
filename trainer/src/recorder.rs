use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    time::Duration,
};

use log::warn;

use crate::Result;

/// Where a recorded value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Batch,
    Train,
    Validation,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Batch => "batch",
            Phase::Train => "train",
            Phase::Validation => "validation",
        }
    }
}

/// A single recorded metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub phase: Phase,
    pub epoch: usize,
    /// The batch within the epoch, the amount of batches for epoch records.
    pub nbatch: usize,
    pub name: String,
    pub value: f64,
}

/// Records the metrics of a training session.
///
/// Records are kept in memory and, once opened, written to a csv file. Dropping the
/// recorder flushes the file, `close` does the same but reports failures.
#[derive(Default)]
pub struct TrainingMetricsRecorder {
    writer: Option<BufWriter<File>>,
    records: Vec<Record>,
    epoch_times: Vec<Duration>,
}

impl TrainingMetricsRecorder {
    /// Creates a recorder that only keeps the records in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that also writes every record to the file at `path`.
    ///
    /// # Returns
    /// An io error if the file can't be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "phase,epoch,nbatch,name,value")?;

        Ok(Self {
            writer: Some(writer),
            records: Vec::new(),
            epoch_times: Vec::new(),
        })
    }

    /// Records a metric value.
    ///
    /// # Returns
    /// An io error if writing to the file failed.
    pub fn record(&mut self, phase: Phase, epoch: usize, nbatch: usize, name: &str, value: f64) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writeln!(writer, "{},{epoch},{nbatch},{name},{value}", phase.as_str())?;
        }

        self.records.push(Record {
            phase,
            epoch,
            nbatch,
            name: name.to_string(),
            value,
        });

        Ok(())
    }

    /// Records how long an epoch took.
    pub fn record_epoch_time(&mut self, elapsed: Duration) {
        self.epoch_times.push(elapsed);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The records of a single phase.
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(move |r| r.phase == phase)
    }

    pub fn epoch_times(&self) -> &[Duration] {
        &self.epoch_times
    }

    /// Flushes and closes the file.
    ///
    /// # Returns
    /// An io error if the last records couldn't be written.
    pub fn close(mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => Ok(writer.flush()?),
            None => Ok(()),
        }
    }
}

impl Drop for TrainingMetricsRecorder {
    fn drop(&mut self) {
        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.flush() {
                warn!("couldn't flush the training metrics: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn in_memory() {
        let mut recorder = TrainingMetricsRecorder::new();
        recorder.record(Phase::Batch, 0, 1, "mse", 0.5).unwrap();
        recorder.record(Phase::Train, 0, 1, "mse", 0.5).unwrap();

        assert_eq!(recorder.records().len(), 2);
        assert_eq!(recorder.phase(Phase::Train).count(), 1);
        recorder.close().unwrap();
    }

    #[test]
    fn writes_a_csv_file() {
        let path = std::env::temp_dir().join(format!("recorder-{}.csv", std::process::id()));

        let mut recorder = TrainingMetricsRecorder::open(&path).unwrap();
        recorder.record(Phase::Validation, 2, 4, "accuracy", 0.75).unwrap();
        recorder.close().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(contents, "phase,epoch,nbatch,name,value\nvalidation,2,4,accuracy,0.75\n");
    }

    #[test]
    fn drop_flushes() {
        let path = std::env::temp_dir().join(format!("recorder-drop-{}.csv", std::process::id()));

        {
            let mut recorder = TrainingMetricsRecorder::open(&path).unwrap();
            recorder.record(Phase::Train, 0, 3, "mae", 1.).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(contents.ends_with("train,0,3,mae,1\n"));
    }
}
