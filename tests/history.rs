use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use forex_rate_collector::history::{DailyEntry, HistoryDataset, HistoryStore};
use forex_rate_collector::schema::RateObservation;

fn store(path: &Path) -> HistoryStore {
    HistoryStore::new(path, 15, Duration::from_secs(2))
}

fn obs(bank: &str, rate: Decimal, ts: &str) -> RateObservation {
    RateObservation::new(bank, rate, DateTime::parse_from_rfc3339(ts).unwrap()).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn dates(ds: &HistoryDataset) -> Vec<NaiveDate> {
    ds.historical_data.iter().map(|e| e.date).collect()
}

#[tokio::test]
async fn first_merge_produces_exact_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all_banks_data.json");

    store(&path)
        .merge_on(date(2024, 1, 1), &[obs("Test", dec!(83.25), "2024-01-01T10:00:00Z")])
        .await
        .unwrap();

    let doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        doc,
        json!({
            "historical_data": [
                {
                    "date": "2024-01-01",
                    "rates": [
                        { "bank": "Test", "tt_buy_rate": 83.25, "timestamp": "2024-01-01T10:00:00Z" }
                    ]
                }
            ]
        })
    );
}

#[tokio::test]
async fn merging_the_same_observation_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    let s = store(&path);
    let batch = [
        obs("A", dec!(83.1), "2024-02-01T09:00:00+05:30"),
        obs("B", dec!(82.75), "2024-02-01T09:05:00+05:30"),
    ];

    s.merge_on(date(2024, 2, 1), &batch).await.unwrap();
    let once = fs::read(&path).unwrap();

    let summary = s.merge_on(date(2024, 2, 1), &batch).await.unwrap();
    let twice = fs::read(&path).unwrap();

    assert_eq!(once, twice);
    assert_eq!((summary.inserted, summary.replaced, summary.unchanged), (0, 0, 2));
}

#[tokio::test]
async fn later_observation_overwrites_and_other_bank_is_added() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(&dir.path().join("h.json"));
    let day = date(2024, 3, 5);

    s.merge_on(day, &[obs("A", dec!(83.00), "2024-03-05T09:00:00Z")]).await.unwrap();
    s.merge_on(day, &[obs("A", dec!(83.40), "2024-03-05T15:00:00Z")]).await.unwrap();
    s.merge_on(day, &[obs("B", dec!(82.10), "2024-03-05T15:01:00Z")]).await.unwrap();

    let ds = s.load().await.unwrap();
    assert_eq!(ds.historical_data.len(), 1);
    let entry = &ds.historical_data[0];
    assert_eq!(entry.rates.len(), 2);
    assert_eq!(entry.get("A").unwrap().tt_buy_rate(), dec!(83.40));
    assert_eq!(
        entry.get("A").unwrap().timestamp(),
        DateTime::parse_from_rfc3339("2024-03-05T15:00:00Z").unwrap()
    );
    assert_eq!(entry.get("B").unwrap().tt_buy_rate(), dec!(82.10));
}

#[tokio::test]
async fn retention_keeps_the_fifteen_most_recent_days() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");

    let existing = HistoryDataset {
        historical_data: (1..=16)
            .map(|d| DailyEntry {
                date: date(2024, 1, d),
                rates: vec![obs("A", dec!(83), "2024-01-01T10:00:00Z")],
            })
            .collect(),
    };
    fs::write(&path, serde_json::to_string_pretty(&existing).unwrap()).unwrap();

    let s = store(&path);
    s.merge_on(date(2024, 1, 17), &[obs("A", dec!(84), "2024-01-17T10:00:00Z")])
        .await
        .unwrap();

    let ds = s.load().await.unwrap();
    let got = dates(&ds);
    assert_eq!(got.len(), 15);
    assert_eq!(got[0], date(2024, 1, 17));
    assert_eq!(got[14], date(2024, 1, 3));
    assert!(!got.contains(&date(2024, 1, 1)));
}

#[tokio::test]
async fn corrupt_file_is_preserved_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    fs::write(&path, "{ \"historical_data\": [ { \"date\": ").unwrap();

    let s = store(&path);
    assert!(s.load().await.is_err());

    s.merge_on(date(2024, 4, 1), &[obs("A", dec!(83.3), "2024-04-01T10:00:00Z")])
        .await
        .unwrap();

    let backup = dir.path().join("h.json.corrupt");
    assert_eq!(
        fs::read_to_string(backup).unwrap(),
        "{ \"historical_data\": [ { \"date\": "
    );
    let ds = s.load().await.unwrap();
    assert_eq!(dates(&ds), vec![date(2024, 4, 1)]);
}

#[tokio::test]
async fn non_positive_rate_in_file_counts_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    fs::write(
        &path,
        r#"{"historical_data":[{"date":"2024-01-01","rates":[{"bank":"A","tt_buy_rate":0,"timestamp":"2024-01-01T10:00:00Z"}]}]}"#,
    )
    .unwrap();

    assert!(store(&path).load().await.is_err());
}

#[tokio::test]
async fn legacy_naive_timestamps_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    fs::write(
        &path,
        r#"{"historical_data":[{"date":"2024-01-01","rates":[{"bank":"A","tt_buy_rate":83.2,"timestamp":"2024-01-01T10:15:30.123456"}]}]}"#,
    )
    .unwrap();

    let ds = store(&path).load().await.unwrap();
    assert_eq!(ds.historical_data[0].rates[0].tt_buy_rate(), dec!(83.2));
}

#[tokio::test]
async fn concurrent_stores_on_one_file_do_not_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    let (a, b) = (store(&path), store(&path));
    let day = date(2024, 5, 1);

    let batch_a = [obs("A", dec!(83.1), "2024-05-01T10:00:00Z")];
    let batch_b = [obs("B", dec!(83.2), "2024-05-01T10:00:00Z")];
    let (ra, rb) = tokio::join!(a.merge_on(day, &batch_a), b.merge_on(day, &batch_b));
    ra.unwrap();
    rb.unwrap();

    let ds = a.load().await.unwrap();
    let entry = ds.entry(day).unwrap();
    assert!(entry.get("A").is_some());
    assert!(entry.get("B").is_some());
    assert!(!dir.path().join("h.json.lock").exists());
}

/// Small deterministic generator; enough to vary dates and banks.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

fn assert_invariants(ds: &HistoryDataset) {
    let got = dates(ds);
    assert!(got.len() <= 15, "{} entries", got.len());
    assert!(got.windows(2).all(|w| w[0] > w[1]), "not strictly descending: {got:?}");
    for entry in &ds.historical_data {
        let mut banks: Vec<&str> = entry.rates.iter().map(|r| r.bank()).collect();
        banks.sort();
        banks.dedup();
        assert_eq!(banks.len(), entry.rates.len(), "duplicate bank on {}", entry.date);
    }
}

#[test]
fn invariants_hold_for_arbitrary_merge_sequences() {
    let base = date(2024, 1, 1);
    for seed in 0..20 {
        let mut rng = Lcg(seed);
        let mut ds = HistoryDataset::default();

        for _ in 0..60 {
            let day = base + chrono::Days::new(rng.next(40));
            let n = rng.next(4) as usize;
            let batch: Vec<RateObservation> = (0..n)
                .map(|_| {
                    let bank = ["A", "B", "C", "D"][rng.next(4) as usize];
                    let rate = Decimal::new(8000 + rng.next(500) as i64, 2);
                    obs(bank, rate, "2024-01-01T10:00:00Z")
                })
                .collect();
            ds.merge(day, &batch, 15);
            assert_invariants(&ds);
        }
    }
}

#[tokio::test]
async fn invariants_hold_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(&dir.path().join("h.json"));
    let mut rng = Lcg(7);

    for _ in 0..25 {
        let day = date(2024, 6, 1) + chrono::Days::new(rng.next(30));
        let bank = ["A", "B", "C"][rng.next(3) as usize];
        s.merge_on(day, &[obs(bank, dec!(83.5), "2024-06-01T10:00:00Z")]).await.unwrap();
        assert_invariants(&s.load().await.unwrap());
    }
}
