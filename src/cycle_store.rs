use crate::error::StoreError;
use chrono::Utc;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};

pub const DEFAULT_STATE_FILE: &str = "~/.spin-cycle/cycle.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_start_timestamp: f64,
    /// Where the wheel comes to rest after the last planned spin.
    #[serde(default)]
    pub resting_angle: f64,
    #[serde(default)]
    pub saved_at: Option<String>,
}

/// The small JSON file holding the last confirmed cycle boundary.
#[derive(Clone, Debug)]
pub struct CycleStore {
    path: PathBuf,
}

impl CycleStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<f64>, StoreError> {
        Ok(self.load_record()?.map(|r| r.cycle_start_timestamp))
    }

    pub fn load_record(&self) -> Result<Option<CycleRecord>, StoreError> {
        read_record(&self.path)
    }

    pub fn save(&self, cycle_start_timestamp: f64, resting_angle: f64) -> Result<(), StoreError> {
        let record = CycleRecord {
            cycle_start_timestamp,
            resting_angle,
            saved_at: Some(Utc::now().to_rfc3339()),
        };
        write_record(&self.path, &record)
    }
}

fn read_record(path: &Path) -> Result<Option<CycleRecord>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let record: CycleRecord = serde_json::from_slice(&data)?;
    if !record.cycle_start_timestamp.is_finite() {
        return Ok(None);
    }
    let resting_angle = if record.resting_angle.is_finite() {
        record.resting_angle.rem_euclid(360.0)
    } else {
        0.0
    };
    Ok(Some(CycleRecord {
        resting_angle,
        ..record
    }))
}

// tmp + rename so a crash mid-write never leaves a truncated file behind
fn write_record(path: &Path, record: &CycleRecord) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
