// =============================================================================
// Clock Watch — exchange clock-skew monitor
// =============================================================================
//
// Signed requests carry a bounded recvWindow, so a local clock drifting too
// far from the exchange makes orders fail. This loop compares the exchange
// server time against local time on a fixed interval and broadcasts a
// warning notice when the difference gets dangerous. Advisory only - skew is
// never surfaced as a command error.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;
use crate::notice::{ClientNoticeService, NoticeLevel};

/// Run the clock-skew check loop forever. Spawn once at startup.
pub async fn run_clock_watch(
    client: Arc<BinanceClient>,
    notices: Arc<ClientNoticeService>,
    interval_secs: u64,
    max_skew_ms: i64,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let request_start = Instant::now();
        let server_time = match client.get_server_time().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to fetch exchange time for clock check");
                continue;
            }
        };
        let round_trip = request_start.elapsed();

        let now_ms = Utc::now().timestamp_millis();
        let skew_ms = (now_ms - server_time).abs();

        if skew_ms > max_skew_ms {
            warn!(
                skew_ms,
                round_trip_ms = round_trip.as_millis() as u64,
                "clock difference from exchange may be too large; orders may fail"
            );
            notices.broadcast(
                NoticeLevel::Warning,
                format!(
                    "Clock difference from the exchange is {skew_ms} ms; orders may fail."
                ),
            );
        } else {
            debug!(
                skew_ms,
                round_trip_ms = round_trip.as_millis() as u64,
                "exchange clock check ok"
            );
        }
    }
}
