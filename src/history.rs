use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::Result,
    storage::{load_versioned, save_versioned, KeyValueStore},
    types::{HealthSample, WireHealthRecord},
};

/// Key of the persisted chart history
pub const HEALTH_HISTORY_KEY: &str = "@health_history";

/// Number of points kept for the heart rate and SpO2 charts
pub const HISTORY_POINTS: usize = 12;

/// Parallel series of the most recent readings, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthHistoryData {
    /// Heart rate readings in bpm
    pub heart_rate: Vec<u32>,
    /// SpO2 readings in percent
    pub spo2: Vec<u32>,
    /// ISO-8601 receive times
    pub timestamps: Vec<String>,
}

/// Rolling window of recent readings backing the dashboard charts
#[derive(Clone)]
pub struct HealthHistory {
    store: Arc<dyn KeyValueStore>,
}

impl HealthHistory {
    /// Create a history persisted in `store`
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Append a sample, keeping only the last [`HISTORY_POINTS`] readings
    ///
    /// # Errors
    ///
    /// Returns the underlying store or serialization error.
    pub async fn add(&self, sample: &HealthSample) -> Result<()> {
        let mut history = self.get().await?;

        history.heart_rate.push(sample.heart_rate);
        history.spo2.push(sample.spo2);
        history
            .timestamps
            .push(WireHealthRecord::from(sample).timestamp);

        if history.heart_rate.len() > HISTORY_POINTS {
            let excess = history.heart_rate.len() - HISTORY_POINTS;
            history.heart_rate.drain(..excess);
            history.spo2.drain(..excess);
            history.timestamps.drain(..excess);
        }

        save_versioned(self.store.as_ref(), HEALTH_HISTORY_KEY, &history).await?;
        debug!("Health history holds {} points", history.heart_rate.len());
        Ok(())
    }

    /// Current history
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn get(&self) -> Result<HealthHistoryData> {
        Ok(load_versioned(self.store.as_ref(), HEALTH_HISTORY_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Drop all readings
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(HEALTH_HISTORY_KEY).await
    }

    /// Heart rate chart series, left padded with zeros to [`HISTORY_POINTS`]
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn heart_rate_chart(&self) -> Result<Vec<u32>> {
        Ok(pad_series(&self.get().await?.heart_rate))
    }

    /// SpO2 chart series, left padded with zeros to [`HISTORY_POINTS`]
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn spo2_chart(&self) -> Result<Vec<u32>> {
        Ok(pad_series(&self.get().await?.spo2))
    }
}

fn pad_series(values: &[u32]) -> Vec<u32> {
    let recent = &values[values.len().saturating_sub(HISTORY_POINTS)..];
    let mut padded = vec![0; HISTORY_POINTS - recent.len()];
    padded.extend_from_slice(recent);
    padded
}
