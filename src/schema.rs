use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------
// Rate observation
// ------------------------------------------------------------
//
// One TT buy rate produced by exactly one collector invocation.
//
// INVARIANT:
// - tt_buy_rate > 0
// - "no observation" is modelled by the absence of a value,
//   never by a zero rate
//
// The serialized shape is the persisted record:
//   { "bank": "...", "tt_buy_rate": 83.25, "timestamp": "..." }
//
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ObservationRecord", into = "ObservationRecord")]
pub struct RateObservation {
    bank: String,
    tt_buy_rate: Decimal,
    timestamp: DateTime<FixedOffset>,
}

impl RateObservation {
    /// Returns `None` when the rate is not strictly positive.
    pub fn new(
        bank: impl Into<String>,
        tt_buy_rate: Decimal,
        timestamp: DateTime<FixedOffset>,
    ) -> Option<Self> {
        if tt_buy_rate <= Decimal::ZERO {
            return None;
        }

        Some(Self {
            bank: bank.into(),
            tt_buy_rate,
            timestamp,
        })
    }

    /// Source name the observation is keyed by inside a day.
    pub fn bank(&self) -> &str {
        &self.bank
    }

    pub fn tt_buy_rate(&self) -> Decimal {
        self.tt_buy_rate
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }
}

// ------------------------------------------------------------
// Wire record
// ------------------------------------------------------------
//
// Plain serde mirror of the persisted JSON object. Validation
// into `RateObservation` happens in `TryFrom`.
//
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObservationRecord {
    bank: String,

    #[serde(with = "rust_decimal::serde::float")]
    tt_buy_rate: Decimal,

    #[serde(with = "timestamp")]
    timestamp: DateTime<FixedOffset>,
}

impl TryFrom<ObservationRecord> for RateObservation {
    type Error = String;

    fn try_from(r: ObservationRecord) -> Result<Self, Self::Error> {
        let rate = r.tt_buy_rate;
        RateObservation::new(r.bank, r.tt_buy_rate, r.timestamp)
            .ok_or_else(|| format!("tt_buy_rate must be positive, got {rate}"))
    }
}

impl From<RateObservation> for ObservationRecord {
    fn from(o: RateObservation) -> Self {
        Self {
            bank: o.bank,
            tt_buy_rate: o.tt_buy_rate,
            timestamp: o.timestamp,
        }
    }
}

/// RFC 3339 timestamps (`Z` for UTC).
///
/// Older datasets carry naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` values
/// written in local time; those are accepted and read as local.
pub mod timestamp {
    use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<FixedOffset>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<FixedOffset>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp {raw:?}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts);
        }

        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        match Local.from_local_datetime(&naive).earliest() {
            Some(local) => Some(local.fixed_offset()),
            None => Some(Utc.from_utc_datetime(&naive).fixed_offset()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).unwrap()
    }

    #[test]
    fn rejects_non_positive_rates() {
        assert!(RateObservation::new("Test", dec!(0), ts("2024-01-01T10:00:00Z")).is_none());
        assert!(RateObservation::new("Test", dec!(-1.5), ts("2024-01-01T10:00:00Z")).is_none());
        assert!(RateObservation::new("Test", dec!(0.01), ts("2024-01-01T10:00:00Z")).is_some());
    }

    #[test]
    fn serializes_to_persisted_shape() {
        let obs = RateObservation::new("Test", dec!(83.25), ts("2024-01-01T10:00:00Z")).unwrap();
        let v = serde_json::to_value(&obs).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "bank": "Test",
                "tt_buy_rate": 83.25,
                "timestamp": "2024-01-01T10:00:00Z"
            })
        );
    }

    #[test]
    fn deserialize_rejects_zero_rate() {
        let raw = r#"{"bank":"X","tt_buy_rate":0,"timestamp":"2024-01-01T10:00:00Z"}"#;
        assert!(serde_json::from_str::<RateObservation>(raw).is_err());
    }

    #[test]
    fn accepts_naive_legacy_timestamps() {
        let raw = r#"{"bank":"HSBC","tt_buy_rate":83.1,"timestamp":"2024-01-01T10:00:00.123456"}"#;
        let obs: RateObservation = serde_json::from_str(raw).unwrap();
        assert_eq!(obs.bank(), "HSBC");
        assert_eq!(obs.tt_buy_rate(), dec!(83.1));
    }

    #[test]
    fn keeps_non_utc_offsets() {
        let obs = RateObservation::new("Kotak Bank", dec!(83.4), ts("2024-01-01T15:30:00+05:30"))
            .unwrap();
        let v = serde_json::to_value(&obs).unwrap();
        assert_eq!(v["timestamp"], "2024-01-01T15:30:00+05:30");
    }
}
