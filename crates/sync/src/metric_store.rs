//! Metrics normalizer and append-only metric store.
//!
//! Raw rows arrive in each platform's native shape and units; the
//! normalizer maps them onto [`MetricSample`]. The store keeps one row per
//! (campaign, timestamp, source) and ignores re-ingestion.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use campaign_adapters::meta::purchase_total;
use campaign_adapters::RawMetricSample;
use campaign_core::error::{CoreResult, PlatformError};
use campaign_core::types::{Metric, MetricSample, Platform, TimeWindow};

/// Convert one raw platform row into the unified schema.
pub fn normalize(raw: &RawMetricSample, campaign_id: Uuid) -> CoreResult<MetricSample> {
    let f = &raw.fields;
    let (impressions, clicks, spend, conversions, conversion_value) = match raw.platform {
        Platform::Google => (
            number(f, "impressions")?,
            number(f, "clicks")?,
            number(f, "costMicros")? / 1_000_000.0,
            number(f, "conversions")?,
            number(f, "conversionsValue")?,
        ),
        Platform::Meta => (
            number(f, "impressions")?,
            number(f, "clicks")?,
            number(f, "spend")?,
            purchase_total(f.get("actions")),
            purchase_total(f.get("action_values")),
        ),
        Platform::Tiktok => (
            number(f, "impressions")?,
            number(f, "clicks")?,
            number(f, "spend")?,
            number(f, "conversion")?,
            number(f, "total_purchase_value")?,
        ),
    };

    for (name, value) in [
        ("impressions", impressions),
        ("clicks", clicks),
        ("spend", spend),
        ("conversions", conversions),
        ("conversion_value", conversion_value),
    ] {
        if value < 0.0 || !value.is_finite() {
            return Err(PlatformError::Validation(format!(
                "{} row for {} has invalid {name} {value}",
                raw.platform, raw.native_campaign_id
            ))
            .into());
        }
    }

    Ok(MetricSample {
        campaign_id,
        timestamp: raw.period_start,
        impressions: impressions.round() as u64,
        clicks: clicks.round() as u64,
        spend,
        conversions,
        conversion_value,
        source: raw.platform,
    })
}

/// Missing fields count as zero; present but unparseable ones are an error.
fn number(fields: &Value, key: &str) -> CoreResult<f64> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(0.0)),
        Some(Value::String(s)) if s.trim().is_empty() || s == "-" => Ok(0.0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| PlatformError::Validation(format!("non-numeric {key} '{s}'")).into()),
        Some(other) => Err(PlatformError::Validation(format!("non-numeric {key} {other}")).into()),
    }
}

type SampleKey = (Uuid, DateTime<Utc>, Platform);

#[derive(Default)]
pub struct MetricStore {
    samples: DashMap<SampleKey, MetricSample>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a sample. Returns `false` when the (campaign, timestamp,
    /// source) row already exists; the stored row is left untouched.
    pub fn ingest(&self, sample: MetricSample) -> bool {
        match self
            .samples
            .entry((sample.campaign_id, sample.timestamp, sample.source))
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(sample);
                true
            }
        }
    }

    /// Samples for one campaign with timestamps in `window`, oldest first.
    pub fn query(&self, campaign_id: Uuid, window: &TimeWindow) -> Vec<MetricSample> {
        let mut rows: Vec<MetricSample> = self
            .samples
            .iter()
            .filter(|s| s.campaign_id == campaign_id && window.contains(s.timestamp))
            .map(|s| s.value().clone())
            .collect();
        rows.sort_by_key(|s| s.timestamp);
        rows
    }

    pub fn totals(&self, campaign_ids: &[Uuid], window: &TimeWindow) -> MetricTotals {
        let mut totals = MetricTotals::default();
        for id in campaign_ids {
            for sample in self.query(*id, window) {
                totals.add(&sample);
            }
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Window sums over one or more campaigns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricTotals {
    pub samples: usize,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub conversions: f64,
    pub conversion_value: f64,
}

impl MetricTotals {
    pub fn add(&mut self, sample: &MetricSample) {
        self.samples += 1;
        self.impressions += sample.impressions;
        self.clicks += sample.clicks;
        self.spend += sample.spend;
        self.conversions += sample.conversions;
        self.conversion_value += sample.conversion_value;
    }

    /// Value of `metric` over the window. `None` means no data: no samples
    /// at all, or a ratio whose denominator is zero.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        let ratio = |num: f64, den: f64| if den > 0.0 { Some(num / den) } else { None };
        match metric {
            Metric::Impressions => Some(self.impressions as f64),
            Metric::Clicks => Some(self.clicks as f64),
            Metric::Spend => Some(self.spend),
            Metric::Conversions => Some(self.conversions),
            Metric::ConversionValue => Some(self.conversion_value),
            Metric::Ctr => ratio(self.clicks as f64, self.impressions as f64),
            Metric::Cpc => ratio(self.spend, self.clicks as f64),
            Metric::Cpa => ratio(self.spend, self.conversions),
            Metric::Roas => ratio(self.conversion_value, self.spend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_adapters::{native_metric_fields, parse_day, DailyTotals};

    fn raw(platform: Platform, totals: DailyTotals) -> RawMetricSample {
        RawMetricSample {
            platform,
            native_campaign_id: "native-1".into(),
            period_start: parse_day("2024-05-01").unwrap(),
            fields: native_metric_fields(platform, &totals),
        }
    }

    #[test]
    fn test_every_platform_normalizes_to_the_same_sample() {
        let totals = DailyTotals {
            impressions: 1200,
            clicks: 36,
            spend: 48.5,
            conversions: 3.0,
            conversion_value: 120.0,
        };
        let campaign = Uuid::new_v4();
        for platform in Platform::ALL {
            let sample = normalize(&raw(platform, totals), campaign).unwrap();
            assert_eq!(sample.impressions, 1200, "{platform}");
            assert_eq!(sample.clicks, 36, "{platform}");
            assert!((sample.spend - 48.5).abs() < 1e-9, "{platform}");
            assert!((sample.conversions - 3.0).abs() < 1e-9, "{platform}");
            assert!((sample.conversion_value - 120.0).abs() < 1e-9, "{platform}");
            assert_eq!(sample.source, platform);
        }
    }

    #[test]
    fn test_negative_values_are_rejected() {
        let mut row = raw(Platform::Tiktok, DailyTotals::default());
        row.fields["spend"] = Value::String("-3.0".into());
        assert!(normalize(&row, Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_same_key_ingested_twice_stores_one_row() {
        let store = MetricStore::new();
        let sample = normalize(
            &raw(Platform::Google, DailyTotals { clicks: 5, ..DailyTotals::default() }),
            Uuid::new_v4(),
        )
        .unwrap();

        assert!(store.ingest(sample.clone()));
        assert!(!store.ingest(MetricSample { clicks: 99, ..sample.clone() }));
        assert_eq!(store.len(), 1);

        let window = TimeWindow::trailing(sample.timestamp + chrono::Duration::days(1), 86_400 * 2);
        let rows = store.query(sample.campaign_id, &window);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].clicks, 5);
    }

    #[test]
    fn test_ratio_with_zero_denominator_is_no_data() {
        let totals = MetricTotals {
            samples: 2,
            impressions: 100,
            clicks: 0,
            spend: 0.0,
            conversions: 0.0,
            conversion_value: 0.0,
        };
        assert_eq!(totals.value(Metric::Roas), None);
        assert_eq!(totals.value(Metric::Cpc), None);
        assert_eq!(totals.value(Metric::Ctr), Some(0.0));
        assert_eq!(MetricTotals::default().value(Metric::Spend), None);
    }
}
