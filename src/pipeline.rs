//! Fetch → decode → bucket → publish, one pass per request.
//!
//! Degradation policy:
//! - a [`crate::error::FetchError`] or [`crate::error::DecodeError`] yields an
//!   empty bucket map for this pass;
//! - a broker connect failure skips publishing for this pass only;
//! - a per-cell publish failure is counted and logged.
//!
//! None of these reach the caller. The bucket map is always returned.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::{BrokerPublisher, PublishReport};
use crate::fetch::FeedSource;
use crate::grid::{GridBucketMap, GridSpec};
use crate::model::VehicleRecord;
use crate::parser::{parse_feed, vehicles_from_feed};
use crate::stats::PassStats;

/// Everything one pass produced.
#[derive(Debug)]
pub struct PassReport {
    pub buckets: GridBucketMap,
    pub publish: PublishReport,
    pub stats: PassStats,
}

pub struct Pipeline {
    source: Arc<dyn FeedSource>,
    publisher: Arc<BrokerPublisher>,
    grid: GridSpec,
}

impl Pipeline {
    pub fn new(source: impl FeedSource + 'static, publisher: Arc<BrokerPublisher>) -> Self {
        Self {
            source: Arc::new(source),
            publisher,
            grid: GridSpec::OTTAWA,
        }
    }

    pub fn with_grid(mut self, grid: GridSpec) -> Self {
        self.grid = grid;
        self
    }

    pub fn publisher(&self) -> &Arc<BrokerPublisher> {
        &self.publisher
    }

    /// Runs a full pass and returns the bucket map for the HTTP response.
    pub async fn handle_request(&self) -> GridBucketMap {
        self.run_pass().await.buckets
    }

    #[tracing::instrument(name = "pipeline_pass", skip(self))]
    pub async fn run_pass(&self) -> PassReport {
        let (buckets, stats) = self.collect().await;
        let publish = self.publisher.publish(&buckets).await;
        let stats = stats.with_publish(&publish);

        info!(
            entities = stats.total_entities,
            vehicles = stats.vehicles,
            cells = stats.cells,
            published = stats.published_cells,
            failed = stats.failed_cells,
            publish_skipped = stats.publish_skipped,
            feed_age_secs = stats.feed_age_secs,
            "Pipeline pass complete"
        );

        PassReport {
            buckets,
            publish,
            stats,
        }
    }

    /// Fetches, decodes and buckets without publishing.
    pub async fn collect(&self) -> (GridBucketMap, PassStats) {
        let (records, stats) = self.load_records().await;
        let buckets = self.grid.bucket(records);
        let stats = stats.with_buckets(&buckets);
        (buckets, stats)
    }

    async fn load_records(&self) -> (Vec<VehicleRecord>, PassStats) {
        let bytes = match self.source.fetch().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Error fetching vehicle positions");
                return (Vec::new(), PassStats::from_error("fetch_error", &e.to_string()));
            }
        };

        match parse_feed(&bytes) {
            Ok(feed) => (vehicles_from_feed(&feed), PassStats::from_feed(&feed)),
            Err(e) => {
                error!(error = %e, bytes = bytes.len(), "Feed parse failed");
                (Vec::new(), PassStats::from_error("decode_error", &e.to_string()))
            }
        }
    }
}
