use chrono::Utc;
use std::borrow::Cow;
use serde_json::{Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    ble::Subscription,
    error::{Result, WearableError},
    types::{HealthSample, TransferConfig},
};

/// Firmware field carrying heart rate in bpm
pub const FIELD_HEART_RATE: &str = "hr";
/// Firmware field carrying SpO2 in percent
pub const FIELD_SPO2: &str = "spo2";
/// Firmware field carrying the cumulative step count
pub const FIELD_STEPS: &str = "steps";
/// Firmware field carrying calories in kcal
pub const FIELD_CALORIES: &str = "cal";
/// Firmware field carrying the on-device alert score
pub const FIELD_ALERT: &str = "alert";

/// Reassembles chunked JSON health records from one notify characteristic
///
/// The firmware writes one JSON object per record and the radio splits it
/// into MTU sized notifications. Raw chunk bytes are appended to a buffer until
/// it looks like a complete object, at which point it is decoded and cleared.
/// Text is only decoded from the whole buffer, so a multi-byte character split
/// across two notifications survives.
///
/// A malformed record never wedges the buffer: once the buffer ends with `}`
/// but fails to parse, decoding is retried from every later `{`. The first
/// suffix that decodes wins and the garbage in front of it is dropped.
///
/// # Examples
///
/// ```
/// use wearlink::protocol::PayloadReassembler;
///
/// let mut reassembler = PayloadReassembler::new();
/// assert!(reassembler.push(b"{\"hr\":7").is_none());
///
/// let sample = reassembler
///     .push(b"0,\"spo2\":98,\"steps\":1,\"cal\":2}")
///     .unwrap();
/// assert_eq!(sample.heart_rate, 70);
/// assert_eq!(sample.spo2, 98);
/// assert!(reassembler.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct PayloadReassembler {
    buffer: Vec<u8>,
    max_payload_bytes: usize,
}

impl Default for PayloadReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadReassembler {
    /// Create a reassembler with the default payload bound
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(TransferConfig::default().max_payload_bytes)
    }

    /// Create a reassembler that discards payloads growing past `max_payload_bytes`
    #[must_use]
    pub const fn with_limit(max_payload_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload_bytes,
        }
    }

    /// Feed one raw chunk, returning a sample when a record completes
    pub fn push(&mut self, chunk: &[u8]) -> Option<HealthSample> {
        if chunk.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        self.buffer.extend_from_slice(chunk);

        let decoded = self.try_decode();
        if decoded.is_some() {
            self.reset();
            return decoded;
        }

        if self.buffer.len() > self.max_payload_bytes {
            warn!(
                "Discarding {} byte payload without a decodable record",
                self.buffer.len()
            );
            self.reset();
        }

        None
    }

    /// Drop any partially received record
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Text received since the last complete record
    #[must_use]
    pub fn pending(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    /// Whether no partial record is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn try_decode(&self) -> Option<HealthSample> {
        let text = String::from_utf8_lossy(&self.buffer);
        let trimmed = text.trim();
        if !trimmed.ends_with('}') {
            return None;
        }

        if trimmed.starts_with('{') {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => match sample_from_value(&value) {
                    Ok(sample) => return Some(sample),
                    Err(e) => warn!("Dropping record: {}", e),
                },
                // Looks closed but is not, e.g. a `}` inside a string value
                Err(e) if e.is_eof() => return None,
                Err(e) => warn!("Malformed health payload: {}", e),
            }
        }

        Self::recover(trimmed)
    }

    fn recover(trimmed: &str) -> Option<HealthSample> {
        trimmed
            .match_indices('{')
            .filter(|(index, _)| *index > 0)
            .find_map(|(index, _)| {
                let value = serde_json::from_str::<Value>(&trimmed[index..]).ok()?;
                let sample = sample_from_value(&value).ok()?;
                debug!("Recovered record after dropping {} bytes", index);
                Some(sample)
            })
    }
}

/// Decode a complete payload, e.g. the value of a characteristic read
///
/// # Errors
///
/// Returns [`WearableError::ParseError`] if the payload is not a JSON object.
pub fn decode_sample(payload: &[u8]) -> Result<HealthSample> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| WearableError::ParseError(format!("payload is not UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| WearableError::ParseError(e.to_string()))?;
    sample_from_value(&value)
}

fn sample_from_value(value: &Value) -> Result<HealthSample> {
    let object = value
        .as_object()
        .ok_or_else(|| WearableError::ParseError("expected a JSON object".to_string()))?;

    Ok(HealthSample {
        heart_rate: u32::try_from(count_field(object, FIELD_HEART_RATE)).unwrap_or(u32::MAX),
        spo2: u32::try_from(count_field(object, FIELD_SPO2)).unwrap_or(u32::MAX),
        steps: count_field(object, FIELD_STEPS),
        calories: object
            .get(FIELD_CALORIES)
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        alert_score: object.get(FIELD_ALERT).and_then(Value::as_f64),
        timestamp: Utc::now(),
    })
}

/// Read a non-negative integer, truncating floats and clamping negatives to 0
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count_field(object: &Map<String, Value>, key: &str) -> u64 {
    match object.get(key) {
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        None => 0,
    }
}

/// Decoded health samples from one live subscription
///
/// Owns a background task that runs a [`PayloadReassembler`] over the
/// subscription's chunks. Dropping the stream aborts the task, which drops
/// the subscription and with it the reassembly buffer.
#[derive(Debug)]
pub struct HealthStream {
    receiver: mpsc::UnboundedReceiver<HealthSample>,
    task: JoinHandle<()>,
}

impl HealthStream {
    /// Start decoding a subscription
    #[must_use]
    pub fn spawn(mut subscription: Subscription, config: &TransferConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let max_payload_bytes = config.max_payload_bytes;

        let task = tokio::spawn(async move {
            let mut reassembler = PayloadReassembler::with_limit(max_payload_bytes);
            while let Some(chunk) = subscription.next_chunk().await {
                if let Some(sample) = reassembler.push(&chunk) {
                    if sender.send(sample).is_err() {
                        break;
                    }
                }
            }
            debug!("Health stream ended");
        });

        Self { receiver, task }
    }

    /// Wait for the next decoded sample, `None` once the subscription ended
    pub async fn recv(&mut self) -> Option<HealthSample> {
        self.receiver.recv().await
    }

    /// Unsubscribe and release the reassembly buffer
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for HealthStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
