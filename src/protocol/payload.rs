//! Characteristic payload decoding.
//!
//! Decoding is strict: a payload that does not match the expected schema
//! is rejected as a whole rather than partially extracted. A rejected
//! payload discards that sample only; the pipeline continues.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Weight characteristic payload: `{"w": <float kg>}`.
#[derive(Debug, Clone, Copy, Deserialize)]
struct WeightPayload {
    w: f64,
}

/// Inclination characteristic payload: `{"p": <float>, "r": <float>}`.
#[derive(Debug, Clone, Copy, Deserialize)]
struct InclinationPayload {
    p: f64,
    r: f64,
}

/// One buffered offline sample as transmitted by the sensor.
///
/// `t` is the number of milliseconds elapsed since the sample was taken,
/// relative to the moment the page is read.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct HistoryEntry {
    /// Total weight in kilograms.
    pub w: f64,
    /// Milliseconds elapsed since the sample was taken.
    pub t: u64,
}

/// Decoded result of one history-characteristic read.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryPayload {
    /// The sensor has no more buffered data; the sync session is finished.
    End,
    /// A page of buffered samples.
    Entries(Vec<HistoryEntry>),
}

fn malformed(context: impl Into<String>) -> Error {
    Error::MalformedPayload {
        context: context.into(),
    }
}

fn payload_str(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|_| malformed("payload is not valid UTF-8"))
}

/// Decode a weight payload into kilograms.
pub fn parse_weight(data: &[u8]) -> Result<f64> {
    let payload: WeightPayload = serde_json::from_str(payload_str(data)?)
        .map_err(|e| malformed(format!("weight payload: {e}")))?;

    if !payload.w.is_finite() {
        return Err(malformed("weight payload: non-finite value"));
    }

    Ok(payload.w)
}

/// Decode an inclination payload into `(pitch, roll)` degrees.
pub fn parse_inclination(data: &[u8]) -> Result<(f64, f64)> {
    let payload: InclinationPayload = serde_json::from_str(payload_str(data)?)
        .map_err(|e| malformed(format!("inclination payload: {e}")))?;

    if !payload.p.is_finite() || !payload.r.is_finite() {
        return Err(malformed("inclination payload: non-finite value"));
    }

    Ok((payload.p, payload.r))
}

/// Decode one page of the offline-history characteristic.
///
/// End-of-data sentinels: an empty or blank payload, `[]`, `{}`, the
/// literal `0`, or `END` (case-insensitive).
pub fn parse_history(data: &[u8]) -> Result<HistoryPayload> {
    let text = payload_str(data)?.trim();

    if text.is_empty()
        || text == "0"
        || text == "\"0\""
        || text == "{}"
        || text.eq_ignore_ascii_case("end")
        || text.eq_ignore_ascii_case("\"end\"")
    {
        return Ok(HistoryPayload::End);
    }

    let entries: Vec<HistoryEntry> = serde_json::from_str(text)
        .map_err(|e| malformed(format!("history payload: {e}")))?;

    if entries.iter().any(|entry| !entry.w.is_finite()) {
        return Err(malformed("history payload: non-finite weight"));
    }
    // Ages convert to signed epoch arithmetic downstream.
    if entries.iter().any(|entry| i64::try_from(entry.t).is_err()) {
        return Err(malformed("history payload: age out of range"));
    }

    if entries.is_empty() {
        Ok(HistoryPayload::End)
    } else {
        Ok(HistoryPayload::Entries(entries))
    }
}
