// =============================================================================
// Publisher — packages tick output into wire messages and hands them to Bus
// =============================================================================
//
// One per-instrument message per updated symbol, then one aggregate message,
// published in that fixed order for the tick (§5's documented, arbitrary
// ordering choice). Index messages mirror the stock ones on their own
// channels. Publishing is fire-and-forget: a bus failure is logged but never
// fails the tick, matching Publish's "real-time delivery is best-effort"
// contract.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::bus::Bus;
use crate::types::{IndexSnapshot, InstrumentSnapshot};

pub const CHANNEL_STOCKS: &str = "market:stocks";
pub const CHANNEL_INDICES: &str = "market:indices";

pub fn stock_channel(symbol: &str) -> String {
    format!("market:stock:{symbol}")
}

pub fn index_channel(code: &str) -> String {
    format!("market:index:{code}")
}

pub struct Publisher {
    bus: Arc<dyn Bus>,
}

#[derive(Serialize)]
struct StockRecord<'a> {
    symbol: &'a str,
    name: &'a str,
    price: f64,
    open: f64,
    high: f64,
    low: f64,
    change: f64,
    change_percent: f64,
    volume: f64,
    timestamp: i64,
}

#[derive(Serialize)]
struct IndexRecord<'a> {
    code: &'a str,
    name: &'a str,
    value: f64,
    change: f64,
    change_percent: f64,
    timestamp: i64,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Publish one tick's worth of instrument snapshots: a `stock_update`
    /// per symbol on its own channel, then a single `market_update`
    /// aggregate carrying every record, in that order.
    pub async fn publish_stocks(
        &self,
        snapshots: &[InstrumentSnapshot],
        opens: &[(String, f64, f64, f64, f64)],
    ) {
        let records: Vec<StockRecord> = snapshots
            .iter()
            .map(|s| {
                let (open, high, low, volume) = opens
                    .iter()
                    .find(|(sym, ..)| sym == &s.symbol)
                    .map(|(_, o, h, l, v)| (*o, *h, *l, *v))
                    .unwrap_or((s.price, s.price, s.price, 0.0));
                StockRecord {
                    symbol: &s.symbol,
                    name: &s.name,
                    price: s.price,
                    open,
                    high,
                    low,
                    change: s.change_value,
                    change_percent: s.change_pct,
                    volume,
                    timestamp: s.updated_at,
                }
            })
            .collect();

        for record in &records {
            let message = json!({ "type": "stock_update", "data": record }).to_string();
            self.publish(&stock_channel(record.symbol), &message).await;
        }

        let timestamp = records.first().map(|r| r.timestamp).unwrap_or(0);
        let aggregate = json!({
            "type": "market_update",
            "data": { "timestamp": timestamp, "stocks": records },
        })
        .to_string();
        self.publish(CHANNEL_STOCKS, &aggregate).await;
    }

    /// Publish one tick's worth of index snapshots, mirroring
    /// `publish_stocks` on the index channels.
    pub async fn publish_indices(&self, snapshots: &[IndexSnapshot]) {
        let timestamp = chrono::Utc::now().timestamp();
        let records: Vec<IndexRecord> = snapshots
            .iter()
            .map(|s| IndexRecord {
                code: &s.code,
                name: &s.name,
                value: s.current_value,
                change: s.change_value,
                change_percent: s.change_pct,
                timestamp,
            })
            .collect();

        for record in &records {
            let message = json!({ "type": "index_update", "data": record }).to_string();
            self.publish(&index_channel(record.code), &message).await;
        }

        let aggregate = json!({
            "type": "indices_update",
            "data": { "timestamp": timestamp, "indices": records },
        })
        .to_string();
        self.publish(CHANNEL_INDICES, &aggregate).await;
    }

    async fn publish(&self, channel: &str, message: &str) {
        if let Err(err) = self.bus.publish(channel, message).await {
            warn!(channel, error = %err, "publish failed, tick still committed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sample_snapshot(symbol: &str, price: f64) -> InstrumentSnapshot {
        InstrumentSnapshot {
            symbol: symbol.to_string(),
            name: format!("{symbol} Inc"),
            price,
            previous_close: 100.0,
            change_value: price - 100.0,
            change_pct: (price / 100.0 - 1.0) * 100.0,
            updated_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn publishes_per_instrument_then_aggregate() {
        let bus = InProcessBus::new();
        let order: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order_a = order.clone();
        bus.subscribe(
            &stock_channel("AAA"),
            Box::new(move |_ch, msg| order_a.lock().push(msg.to_string())),
        );
        let order_agg = order.clone();
        bus.subscribe(
            CHANNEL_STOCKS,
            Box::new(move |_ch, msg| order_agg.lock().push(msg.to_string())),
        );

        let publisher = Publisher::new(bus);
        let snapshots = vec![sample_snapshot("AAA", 110.0)];
        let opens = vec![("AAA".to_string(), 100.0, 111.0, 99.0, 12000.0)];
        publisher.publish_stocks(&snapshots, &opens).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let recorded = order.lock();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].contains("\"stock_update\""));
        assert!(recorded[1].contains("\"market_update\""));
    }

    #[tokio::test]
    async fn publish_failure_does_not_panic() {
        let bus = InProcessBus::new();
        let publisher = Publisher::new(bus);
        publisher.publish_indices(&[]).await;
    }

    fn sample_index_snapshot(code: &str, value: f64) -> IndexSnapshot {
        IndexSnapshot {
            code: code.to_string(),
            name: format!("{code} Index"),
            current_value: value,
            previous_close: 1000.0,
            change_value: value - 1000.0,
            change_pct: (value / 1000.0 - 1.0) * 100.0,
        }
    }

    #[tokio::test]
    async fn publishes_per_index_then_aggregate() {
        let bus = InProcessBus::new();
        let order: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order_a = order.clone();
        bus.subscribe(
            &index_channel("DEMO300"),
            Box::new(move |_ch, msg| order_a.lock().push(msg.to_string())),
        );
        let order_agg = order.clone();
        bus.subscribe(
            CHANNEL_INDICES,
            Box::new(move |_ch, msg| order_agg.lock().push(msg.to_string())),
        );

        let publisher = Publisher::new(bus);
        let snapshots = vec![sample_index_snapshot("DEMO300", 1050.0)];
        publisher.publish_indices(&snapshots).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let recorded = order.lock();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].contains("\"index_update\""));
        assert!(recorded[1].contains("\"indices_update\""));
    }

    #[tokio::test]
    async fn stock_update_contains_expected_fields() {
        let bus = InProcessBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let captured: Arc<parking_lot::Mutex<String>> = Arc::new(parking_lot::Mutex::new(String::new()));
        let captured_clone = captured.clone();

        bus.subscribe(
            &stock_channel("ZZZ"),
            Box::new(move |_ch, msg| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                *captured_clone.lock() = msg.to_string();
            }),
        );

        let publisher = Publisher::new(bus);
        let snapshots = vec![sample_snapshot("ZZZ", 95.0)];
        publisher.publish_stocks(&snapshots, &[]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let payload = captured.lock();
        assert!(payload.contains("\"symbol\":\"ZZZ\""));
        assert!(payload.contains("\"change_percent\":-5"));
    }
}
