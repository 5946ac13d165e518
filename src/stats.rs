use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::broker::PublishReport;
use crate::grid::GridBucketMap;
use crate::gtfs_rt::FeedMessage;

/// Summary of one pipeline pass, logged after the response is built.
#[derive(Debug, Default, Serialize)]
pub struct PassStats {
    pub timestamp: DateTime<Utc>,
    pub feed_timestamp: Option<DateTime<Utc>>,
    pub feed_age_secs: Option<i64>,
    pub total_entities: usize,

    pub vehicles: usize,
    pub without_position: usize,
    pub cells: usize,

    pub published_cells: usize,
    pub failed_cells: usize,
    pub publish_skipped: bool,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl PassStats {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let now = Utc::now();
        let feed_timestamp = feed
            .header
            .timestamp
            .and_then(|t| i64::try_from(t).ok())
            .and_then(|t| Utc.timestamp_opt(t, 0).single());

        let mut s = PassStats {
            timestamp: now,
            feed_timestamp,
            feed_age_secs: feed_timestamp.map(|t| (now - t).num_seconds()),
            total_entities: feed.entity.len(),
            ..Default::default()
        };

        for v in feed.entity.iter().filter_map(|e| e.vehicle.as_ref()) {
            s.vehicles += 1;
            if v.position.is_none() {
                s.without_position += 1;
            }
        }

        s
    }

    pub fn from_error(error_type: &str, error_message: &str) -> Self {
        PassStats {
            timestamp: Utc::now(),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_buckets(mut self, buckets: &GridBucketMap) -> Self {
        self.cells = buckets.len();
        self
    }

    pub fn with_publish(mut self, report: &PublishReport) -> Self {
        self.published_cells = report.published.len();
        self.failed_cells = report.failed.len();
        self.publish_skipped = report.skipped.is_some();
        self
    }
}
