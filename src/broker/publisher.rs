use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::{APP_MESSAGE_ID, BrokerConnection, Connector, OutboundMessage, PublishSession};
use crate::error::{ConnectError, PublishError};
use crate::grid::{GridBucketMap, GridCellId};
use crate::model::VehicleRecord;

type Slot = Option<Arc<dyn BrokerConnection>>;

/// Outcome of one [`BrokerPublisher::publish`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Cells whose message was handed to the broker.
    pub published: Vec<GridCellId>,
    /// Cells whose encode or send failed.
    pub failed: Vec<GridCellId>,
    /// Set when nothing was attempted because no connection or session
    /// could be obtained.
    pub skipped: Option<String>,
}

/// Owns the shared broker connection and publishes grid buckets.
///
/// The connection is created lazily and reused across passes. Connects are
/// serialized by an async mutex, so concurrent passes never open duplicate
/// connections. The current connection lives in a `watch` slot that can be
/// read without waiting for an in-flight connect. Sends hold neither.
pub struct BrokerPublisher {
    connector: Box<dyn Connector>,
    connecting: Mutex<()>,
    slot: watch::Sender<Slot>,
}

impl BrokerPublisher {
    pub fn new(connector: impl Connector + 'static) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            connector: Box::new(connector),
            connecting: Mutex::new(()),
            slot,
        }
    }

    fn current(&self) -> Slot {
        self.slot.borrow().clone()
    }

    /// Returns the live connection, connecting first if there is none or the
    /// previous one dropped.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectError`] of a failed attempt. The publisher stays
    /// disconnected and the next call tries again.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerConnection>, ConnectError> {
        let _connecting = self.connecting.lock().await;

        if let Some(conn) = self.current() {
            if conn.is_connected() {
                return Ok(conn);
            }
            warn!("Broker connection lost, reconnecting");
            self.slot.send_replace(None);
        }

        match self.connector.connect().await {
            Ok(conn) => {
                info!("Connected to broker");
                self.slot.send_replace(Some(Arc::clone(&conn)));
                Ok(conn)
            }
            Err(e) => {
                error!(error = %e, "Broker connection failed");
                Err(e)
            }
        }
    }

    /// Liveness of the held connection. Never waits on a connect attempt.
    pub fn is_connected(&self) -> bool {
        self.slot.borrow().as_ref().is_some_and(|c| c.is_connected())
    }

    /// Closes and forgets the current connection, if any.
    pub async fn close(&self) {
        let conn = {
            let _connecting = self.connecting.lock().await;
            self.slot.send_replace(None)
        };
        if let Some(conn) = conn {
            conn.close().await;
            info!("Broker connection closed");
        }
    }

    /// Publishes every bucket to `buses/grid/{cell}` as a JSON array.
    ///
    /// Best effort: each cell gets at most one attempt and a failure is
    /// logged without affecting the remaining cells. When the broker is
    /// unreachable the whole step is skipped.
    ///
    /// Once a session is open the sends and the session release run on their
    /// own task, so dropping this future does not cut the pass short.
    #[tracing::instrument(name = "publish_buckets", skip_all, fields(cells = buckets.len()))]
    pub async fn publish(&self, buckets: &GridBucketMap) -> PublishReport {
        let conn = match self.ensure_connected().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Skipping publish, broker unavailable");
                return PublishReport {
                    skipped: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        if buckets.is_empty() {
            debug!("No grid cells to publish");
            return PublishReport::default();
        }

        let mut session = match conn.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to set up publish session");
                return PublishReport {
                    skipped: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let buckets = buckets.clone();
        let task = tokio::spawn(async move {
            let report = publish_cells(&mut *session, &buckets).await;
            session.terminate().await;
            report
        });

        let report = match task.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Publish task failed");
                return PublishReport {
                    skipped: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        info!(
            published = report.published.len(),
            failed = report.failed.len(),
            "Published grid updates to broker"
        );
        report
    }
}

// No early return: the caller terminates the session afterwards.
async fn publish_cells(session: &mut dyn PublishSession, buckets: &GridBucketMap) -> PublishReport {
    let mut report = PublishReport::default();

    for (cell, records) in buckets {
        match send_cell(session, cell, records).await {
            Ok(()) => {
                debug!(%cell, vehicles = records.len(), "Grid cell published");
                report.published.push(*cell);
            }
            Err(e) => {
                error!(%cell, error = %e, "Failed to publish grid cell");
                report.failed.push(*cell);
            }
        }
    }

    report
}

async fn send_cell(
    session: &mut dyn PublishSession,
    cell: &GridCellId,
    records: &[VehicleRecord],
) -> Result<(), PublishError> {
    let message = OutboundMessage {
        topic: cell.topic(),
        app_message_id: APP_MESSAGE_ID.to_string(),
        payload: serde_json::to_vec(records)?,
    };
    session.publish(&message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::grid::bucket;
    use std::time::Duration;

    fn record(id: &str, lat: f64, lon: f64) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            trip_id: format!("trip-{id}"),
            route_id: "44".to_string(),
            latitude: lat,
            longitude: lon,
            speed: 8.0,
            timestamp: 1_700_000_000,
        }
    }

    fn three_cells() -> GridBucketMap {
        bucket(vec![
            record("a", 45.05, -75.95),
            record("b", 45.15, -75.95),
            record("c", 45.25, -75.95),
            record("d", 45.06, -75.94),
        ])
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let broker = MemoryBroker::new();
        let publisher = BrokerPublisher::new(broker.clone());

        publisher.ensure_connected().await.unwrap();
        publisher.ensure_connected().await.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_publisher_disconnected_and_retries() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let publisher = BrokerPublisher::new(broker.clone());

        assert!(publisher.ensure_connected().await.is_err());
        assert!(!publisher.is_connected());

        broker.refuse_connections(false);
        publisher.ensure_connected().await.unwrap();
        assert!(publisher.is_connected());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_drop() {
        let broker = MemoryBroker::new();
        let publisher = BrokerPublisher::new(broker.clone());

        publisher.ensure_connected().await.unwrap();
        broker.drop_connection();
        assert!(!publisher.is_connected());

        publisher.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_count(), 2);
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connect() {
        let broker = MemoryBroker::new();
        let publisher = Arc::new(BrokerPublisher::new(broker.clone()));

        let mut tasks = vec![];
        for _ in 0..8 {
            let publisher = Arc::clone(&publisher);
            tasks.push(tokio::spawn(async move {
                publisher.ensure_connected().await.is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_publishes_one_message_per_cell() {
        let broker = MemoryBroker::new();
        let publisher = BrokerPublisher::new(broker.clone());
        let buckets = three_cells();

        let report = publisher.publish(&buckets).await;

        assert_eq!(report.published.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped, None);

        let messages = broker.messages();
        let topics: Vec<_> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, ["buses/grid/0,0", "buses/grid/1,0", "buses/grid/2,0"]);
        assert!(messages.iter().all(|m| m.app_message_id == APP_MESSAGE_ID));

        let first: Vec<VehicleRecord> = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(first, buckets[&GridCellId::new(0, 0)]);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_one_cell_failure_does_not_stop_others() {
        let broker = MemoryBroker::new();
        broker.fail_topic("buses/grid/1,0");
        let publisher = BrokerPublisher::new(broker.clone());

        let report = publisher.publish(&three_cells()).await;

        assert_eq!(report.failed, vec![GridCellId::new(1, 0)]);
        assert_eq!(
            report.published,
            vec![GridCellId::new(0, 0), GridCellId::new(2, 0)]
        );
        let topics: Vec<_> = broker.messages().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, ["buses/grid/0,0", "buses/grid/2,0"]);
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_released_when_every_cell_fails() {
        let broker = MemoryBroker::new();
        for topic in ["buses/grid/0,0", "buses/grid/1,0", "buses/grid/2,0"] {
            broker.fail_topic(topic);
        }
        let publisher = BrokerPublisher::new(broker.clone());

        let report = publisher.publish(&three_cells()).await;

        assert_eq!(report.failed.len(), 3);
        assert!(report.published.is_empty());
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_publish_skipped_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let publisher = BrokerPublisher::new(broker.clone());

        let report = publisher.publish(&three_cells()).await;

        assert!(report.skipped.is_some());
        assert!(report.published.is_empty());
        assert!(broker.messages().is_empty());
        assert_eq!(broker.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_publish_skipped_when_session_cannot_open() {
        let broker = MemoryBroker::new();
        broker.refuse_sessions(true);
        let publisher = BrokerPublisher::new(broker.clone());

        let report = publisher.publish(&three_cells()).await;

        assert!(report.skipped.is_some());
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn test_empty_map_sends_nothing() {
        let broker = MemoryBroker::new();
        let publisher = BrokerPublisher::new(broker.clone());

        let report = publisher.publish(&GridBucketMap::new()).await;

        assert_eq!(report, PublishReport::default());
        assert!(broker.messages().is_empty());
        assert_eq!(broker.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_close_forgets_connection() {
        let broker = MemoryBroker::new();
        let publisher = BrokerPublisher::new(broker.clone());

        publisher.ensure_connected().await.unwrap();
        publisher.close().await;

        assert!(!publisher.is_connected());
        publisher.ensure_connected().await.unwrap();
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_publish_still_sends_every_cell() {
        let broker = MemoryBroker::new();
        broker.delay_sends(Duration::from_millis(40));
        let publisher = BrokerPublisher::new(broker.clone());

        let cut_short = tokio::time::timeout(
            Duration::from_millis(60),
            publisher.publish(&three_cells()),
        )
        .await;
        assert!(cut_short.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(broker.messages().len(), 3);
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_liveness_read_does_not_wait_for_connect() {
        let broker = MemoryBroker::new();
        broker.delay_connects(Duration::from_millis(200));
        let publisher = Arc::new(BrokerPublisher::new(broker.clone()));

        let connecting = {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { publisher.ensure_connected().await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!publisher.is_connected());
        assert!(connecting.await.unwrap());
        assert!(publisher.is_connected());
    }
}
