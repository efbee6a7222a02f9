// =============================================================================
// Trade Service — the trade lifecycle state machine
// =============================================================================
//
// Owns the authoritative in-memory trade set. Every mutating operation -
// whether a command (place buy, set stop-loss, sell, archive, abandon) or
// event intake (execution report, price tick) - runs its whole
// validate -> remote-call -> persist -> apply sequence while holding a single
// FIFO write gate, so no two mutations to the same trade can ever interleave.
//
// The store write is the commit point: if persistence fails, the in-memory
// view is left untouched and the caller sees a persistence error. Reads
// (`get`/`query`) never wait on the gate; they take a brief read lock on the
// trade map, which writers hold only for the final in-memory apply.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::binance::exchange_info::ExchangeInfoService;
use crate::binance::trade_stream::{PriceTick, TradeStreamManager};
use crate::binance::user_stream::{self, ExecutionReport};
use crate::errors::TradeError;
use crate::notice::{ClientNoticeService, NoticeLevel};
use crate::trade::gateway::{NewOrder, OrderGateway, OrderKind};
use crate::trade::model::{ExitStrategy, OrderRef, StopLossSpec, Trade, TradeStatus};
use crate::trade::store::TradeStore;
use crate::types::{OrderSide, OrderStatus};

/// Broadcast capacity for committed trade snapshots.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Command inputs
// ---------------------------------------------------------------------------

/// Parameters for a new buy order.
#[derive(Debug, Clone)]
pub struct BuyOrder {
    pub symbol: String,
    pub quantity: f64,
    /// Limit price; `None` places a market buy.
    pub limit_price: Option<f64>,
}

/// Read filter for `query`.
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub symbol: Option<String>,
    pub include_archived: bool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The trade lifecycle state machine. Constructed once and shared via `Arc`.
pub struct TradeService {
    gateway: Arc<dyn OrderGateway>,
    store: TradeStore,
    info: Arc<ExchangeInfoService>,
    notices: Arc<ClientNoticeService>,
    streams: Arc<TradeStreamManager>,

    /// The authoritative trade set. Writers hold the lock only for the final
    /// in-memory apply; readers snapshot without blocking on persistence.
    trades: RwLock<HashMap<String, Trade>>,

    /// The single-writer serialization point. FIFO, so execution reports for
    /// one order are applied in arrival order.
    write_gate: Mutex<()>,

    /// Committed trade snapshots for observers.
    updates_tx: broadcast::Sender<Trade>,

    /// Price-tick forwarder task per symbol with trades needing evaluation.
    feeds: SyncMutex<HashMap<String, JoinHandle<()>>>,

    /// Handle on ourselves for spawning forwarder tasks.
    weak: Weak<TradeService>,
}

impl TradeService {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        store: TradeStore,
        info: Arc<ExchangeInfoService>,
        notices: Arc<ClientNoticeService>,
        streams: Arc<TradeStreamManager>,
    ) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Arc::new_cyclic(|weak| Self {
            gateway,
            store,
            info,
            notices,
            streams,
            trades: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            updates_tx,
            feeds: SyncMutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Snapshot of a single trade.
    pub fn get(&self, trade_id: &str) -> Option<Trade> {
        self.trades.read().get(trade_id).cloned()
    }

    /// Snapshot of all trades matching `filter`, newest first.
    pub fn query(&self, filter: &TradeQuery) -> Vec<Trade> {
        let trades = self.trades.read();
        let mut out: Vec<Trade> = trades
            .values()
            .filter(|t| filter.include_archived || !t.archived)
            .filter(|t| {
                filter
                    .symbol
                    .as_deref()
                    .map_or(true, |s| t.symbol == s)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Number of trades still accepting mutation, for health reporting.
    pub fn active_trade_count(&self) -> usize {
        self.trades.read().values().filter(|t| t.is_mutable()).count()
    }

    /// Committed trade snapshots for observers (e.g. the WebSocket feed).
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Trade> {
        self.updates_tx.subscribe()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Validate, submit, and track a new buy order. The trade is created in
    /// `EntryPending` and persisted before this returns.
    pub async fn place_buy(&self, order: BuyOrder) -> Result<Trade, TradeError> {
        let quantity = self.info.round_quantity(&order.symbol, order.quantity)?;
        if quantity <= 0.0 {
            return Err(TradeError::Validation(format!(
                "quantity {} rounds to zero for {}",
                order.quantity, order.symbol
            )));
        }

        let price = match order.limit_price {
            Some(p) => {
                let rounded = self.info.round_price(&order.symbol, p)?;
                if rounded <= 0.0 {
                    return Err(TradeError::Validation(format!(
                        "price {p} rounds to zero for {}",
                        order.symbol
                    )));
                }
                if !self.info.meets_min_notional(&order.symbol, quantity, rounded)? {
                    return Err(TradeError::Validation(format!(
                        "order notional {:.8} below exchange minimum for {}",
                        quantity * rounded,
                        order.symbol
                    )));
                }
                Some(rounded)
            }
            None => None,
        };

        let _gate = self.write_gate.lock().await;

        let new_order = NewOrder {
            symbol: order.symbol.clone(),
            side: OrderSide::Buy,
            kind: if price.is_some() {
                OrderKind::Limit
            } else {
                OrderKind::Market
            },
            quantity,
            price,
            client_order_id: new_client_order_id(),
        };

        let ack = self.gateway.submit_order(&new_order).await?;

        let entry = OrderRef {
            order_id: ack.order_id,
            client_order_id: ack.client_order_id,
            side: OrderSide::Buy,
            quantity,
            price,
            filled_qty: 0.0,
            cumulative_quote: 0.0,
            avg_fill_price: 0.0,
            status: ack.status,
        };

        let trade = Trade::new(&order.symbol, entry);
        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            order_id = ack.order_id,
            quantity,
            price = ?price,
            "buy order placed"
        );

        self.commit(trade).await
    }

    /// Cancel an unfilled or partially filled entry order.
    pub async fn cancel_buy(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let mut trade = self.get_for_update(trade_id)?;

        if trade.status != TradeStatus::EntryPending {
            return Err(TradeError::invalid_state(
                trade.status,
                "entry order is no longer cancellable",
            ));
        }

        self.gateway
            .cancel_order(&trade.symbol, trade.entry.order_id)
            .await?;

        trade.status = TradeStatus::Cancelled;
        trade.touch();
        info!(trade_id = %trade.id, "buy cancelled");

        self.commit(trade).await
    }

    /// Install (or replace) a stop-loss on an open trade.
    pub async fn set_stop_loss(
        &self,
        trade_id: &str,
        trigger: StopLossSpec,
    ) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let mut trade = self.get_for_update(trade_id)?;

        if trade.status != TradeStatus::Open {
            return Err(TradeError::invalid_state(
                trade.status,
                "stop-loss requires an open trade",
            ));
        }

        let trigger_price = match trigger {
            StopLossSpec::Price(p) => self.info.round_price(&trade.symbol, p)?,
            StopLossSpec::PercentBelowEntry(pct) => {
                if pct <= 0.0 || pct >= 100.0 {
                    return Err(TradeError::Validation(format!(
                        "stop-loss percent {pct} out of range (0, 100)"
                    )));
                }
                self.info
                    .round_price(&trade.symbol, trade.entry_avg_price() * (1.0 - pct / 100.0))?
            }
        };
        if trigger_price <= 0.0 {
            return Err(TradeError::Validation(format!(
                "stop-loss trigger {trigger_price} must be positive"
            )));
        }

        self.cancel_pending_exit(&mut trade).await?;
        trade.exit_strategy = ExitStrategy::StopLoss { trigger_price };
        trade.touch();

        info!(trade_id = %trade.id, trigger_price, "stop-loss set");
        self.commit(trade).await
    }

    /// Install (or replace) a trailing-profit strategy on an open trade.
    pub async fn set_trailing_profit(
        &self,
        trade_id: &str,
        activation_pct: f64,
        trailing_pct: f64,
    ) -> Result<Trade, TradeError> {
        if activation_pct <= 0.0 {
            return Err(TradeError::Validation(format!(
                "activation percent {activation_pct} must be positive"
            )));
        }
        if trailing_pct <= 0.0 || trailing_pct >= 100.0 {
            return Err(TradeError::Validation(format!(
                "trailing percent {trailing_pct} out of range (0, 100)"
            )));
        }

        let _gate = self.write_gate.lock().await;
        let mut trade = self.get_for_update(trade_id)?;

        if trade.status != TradeStatus::Open {
            return Err(TradeError::invalid_state(
                trade.status,
                "trailing profit requires an open trade",
            ));
        }

        self.cancel_pending_exit(&mut trade).await?;
        trade.exit_strategy = ExitStrategy::TrailingProfit {
            activation_pct,
            trailing_pct,
            activated: false,
            high_water: 0.0,
        };
        trade.touch();

        info!(trade_id = %trade.id, activation_pct, trailing_pct, "trailing profit set");
        self.commit(trade).await
    }

    /// Place a limit sell at `percent` above the entry's average fill price.
    pub async fn limit_sell_by_percent(
        &self,
        trade_id: &str,
        percent: f64,
    ) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let trade = self.get_for_update(trade_id)?;
        let price = trade.entry_avg_price() * (1.0 + percent / 100.0);
        self.place_exit_order(trade, OrderKind::Limit, Some(price))
            .await
    }

    /// Place a limit sell at an absolute price.
    pub async fn limit_sell_by_price(
        &self,
        trade_id: &str,
        price: f64,
    ) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let trade = self.get_for_update(trade_id)?;
        self.place_exit_order(trade, OrderKind::Limit, Some(price))
            .await
    }

    /// Cancel any pending exit order and sell at market.
    pub async fn market_sell(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        self.market_sell_inner(trade_id).await
    }

    /// Archive a closed or abandoned trade. Idempotent.
    pub async fn archive(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let mut trade = self
            .get(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;

        if !matches!(trade.status, TradeStatus::Closed | TradeStatus::Abandoned) {
            return Err(TradeError::invalid_state(
                trade.status,
                "only closed or abandoned trades can be archived",
            ));
        }
        if trade.archived {
            return Ok(trade);
        }

        trade.archived = true;
        trade.touch();
        info!(trade_id = %trade.id, "trade archived");
        self.commit(trade).await
    }

    /// Stop managing a trade without touching its exchange-side orders.
    /// Idempotent.
    pub async fn abandon(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let _gate = self.write_gate.lock().await;
        let mut trade = self
            .get(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;

        if trade.status == TradeStatus::Abandoned {
            return Ok(trade);
        }
        if trade.status.is_terminal() {
            return Err(TradeError::invalid_state(
                trade.status,
                "terminal trades cannot be abandoned",
            ));
        }

        trade.status = TradeStatus::Abandoned;
        trade.touch();
        warn!(trade_id = %trade.id, "trade abandoned - exchange-side orders are no longer managed");
        self.commit(trade).await
    }

    // =========================================================================
    // Event intake
    // =========================================================================

    /// Apply an execution report. The raw report is persisted unconditionally
    /// before any state is touched, so recovery is never lossy.
    pub async fn on_execution_report(&self, report: &ExecutionReport) -> Result<(), TradeError> {
        if let Err(e) = self
            .store
            .save_raw_execution_report(report.event_time, &report.raw)
            .await
        {
            error!(
                order_id = report.order_id,
                error = %e,
                "failed to persist raw execution report - event not applied"
            );
            return Err(e);
        }

        self.apply_execution_report(report).await
    }

    /// Evaluate price-driven exits for every trade on the tick's symbol.
    /// Performs no persistence by itself; a triggered exit persists through
    /// the resulting market sell.
    pub async fn on_price_update(&self, tick: &PriceTick) {
        let _gate = self.write_gate.lock().await;

        let mut triggered: Vec<(String, String)> = Vec::new();

        {
            let mut trades = self.trades.write();
            for trade in trades
                .values_mut()
                .filter(|t| t.symbol == tick.symbol && t.is_mutable())
            {
                let id = trade.id.clone();
                let status = trade.status;
                let entry_avg = trade.entry.avg_fill_price;

                match &mut trade.exit_strategy {
                    ExitStrategy::StopLoss { trigger_price } if status == TradeStatus::Open => {
                        if tick.price <= *trigger_price {
                            triggered.push((
                                id,
                                format!(
                                    "stop-loss triggered for {} at {} (trigger {})",
                                    tick.symbol, tick.price, trigger_price
                                ),
                            ));
                        }
                    }
                    ExitStrategy::TrailingProfit {
                        activation_pct,
                        trailing_pct,
                        activated,
                        high_water,
                    } if status == TradeStatus::Open => {
                        if !*activated {
                            let threshold = entry_avg * (1.0 + *activation_pct / 100.0);
                            if tick.price >= threshold {
                                *activated = true;
                                *high_water = tick.price;
                                debug!(
                                    trade_id = %id,
                                    high_water = tick.price,
                                    "trailing profit activated"
                                );
                            }
                        } else {
                            if tick.price > *high_water {
                                *high_water = tick.price;
                            }
                            let floor = *high_water * (1.0 - *trailing_pct / 100.0);
                            if tick.price <= floor {
                                triggered.push((
                                    id,
                                    format!(
                                        "trailing profit triggered for {} at {} (high water {})",
                                        tick.symbol, tick.price, high_water
                                    ),
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for (trade_id, reason) in triggered {
            info!(trade_id = %trade_id, %reason, "exit triggered");
            self.notices.broadcast(NoticeLevel::Warning, reason);

            if let Err(e) = self.market_sell_inner(&trade_id).await {
                error!(trade_id = %trade_id, error = %e, "triggered market sell failed");
                self.notices.broadcast(
                    NoticeLevel::Warning,
                    format!("failed to place triggered market sell: {e}"),
                );
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild the in-memory trade set from the store, then replay persisted
    /// raw reports newer than each trade's last-applied marker through the
    /// idempotent apply path.
    pub async fn restore(&self) -> Result<usize, TradeError> {
        let trades = self.store.load_all_trades().await?;
        let count = trades.len();

        {
            let mut map = self.trades.write();
            for trade in trades {
                map.insert(trade.id.clone(), trade);
            }
        }

        // Re-acquire price feeds for trades still needing evaluation.
        let symbols: HashSet<String> = self
            .trades
            .read()
            .values()
            .filter(|t| t.needs_price_feed())
            .map(|t| t.symbol.clone())
            .collect();
        for symbol in symbols {
            self.ensure_price_feed(&symbol);
        }

        // Replay raw reports. Application is idempotent, so reports that were
        // fully applied before shutdown are no-ops.
        let mut replayed = 0usize;
        for (_, payload) in self.store.load_all_raw_execution_reports().await? {
            if let Some(report) = user_stream::parse_execution_report(&payload) {
                match self.apply_execution_report(&report).await {
                    Ok(()) => replayed += 1,
                    Err(e) => {
                        warn!(order_id = report.order_id, error = %e, "report replay failed");
                    }
                }
            }
        }

        info!(trades = count, replayed, "recovery complete");
        Ok(count)
    }

    // =========================================================================
    // Internals (write gate held)
    // =========================================================================

    /// Clone a trade for mutation, rejecting unknown and immutable trades.
    fn get_for_update(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let trade = self
            .get(trade_id)
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))?;
        if !trade.is_mutable() {
            return Err(TradeError::invalid_state(
                trade.status,
                "trade accepts no further mutation",
            ));
        }
        Ok(trade)
    }

    /// Persist, then apply to memory, then notify. The store write is the
    /// commit point: on failure nothing is applied.
    async fn commit(&self, trade: Trade) -> Result<Trade, TradeError> {
        if let Err(e) = self.store.save_trade(&trade).await {
            error!(
                trade_id = %trade.id,
                error = %e,
                "trade persistence failed - in-memory state left unchanged"
            );
            return Err(e);
        }

        self.trades
            .write()
            .insert(trade.id.clone(), trade.clone());

        let _ = self.updates_tx.send(trade.clone());
        self.sync_price_feed(&trade);
        Ok(trade)
    }

    /// Cancel a pending exit order, restoring it on failure. The cancel must
    /// complete before a replacement order may be submitted, so two exit
    /// orders can never be live at once.
    async fn cancel_pending_exit(&self, trade: &mut Trade) -> Result<(), TradeError> {
        if let Some(exit) = trade.exit_order.take() {
            if let Err(e) = self
                .gateway
                .cancel_order(&trade.symbol, exit.order_id)
                .await
            {
                trade.exit_order = Some(exit);
                return Err(e);
            }
            info!(
                trade_id = %trade.id,
                order_id = exit.order_id,
                "pending exit order cancelled"
            );
        }
        Ok(())
    }

    /// Shared exit-order placement for limit and market sells.
    async fn place_exit_order(
        &self,
        mut trade: Trade,
        kind: OrderKind,
        price: Option<f64>,
    ) -> Result<Trade, TradeError> {
        if !matches!(trade.status, TradeStatus::Open | TradeStatus::ExitPending) {
            return Err(TradeError::invalid_state(
                trade.status,
                "selling requires a filled entry",
            ));
        }

        let quantity = self
            .info
            .round_quantity(&trade.symbol, trade.entry.filled_qty)?;
        if quantity <= 0.0 {
            return Err(TradeError::invalid_state(
                trade.status,
                "entry has no filled quantity to sell",
            ));
        }

        let price = match price {
            Some(p) => {
                let rounded = self.info.round_price(&trade.symbol, p)?;
                if rounded <= 0.0 {
                    return Err(TradeError::Validation(format!(
                        "sell price {p} rounds to zero for {}",
                        trade.symbol
                    )));
                }
                Some(rounded)
            }
            None => None,
        };

        self.cancel_pending_exit(&mut trade).await?;

        let new_order = NewOrder {
            symbol: trade.symbol.clone(),
            side: OrderSide::Sell,
            kind,
            quantity,
            price,
            client_order_id: new_client_order_id(),
        };
        let ack = self.gateway.submit_order(&new_order).await?;

        trade.exit_order = Some(OrderRef {
            order_id: ack.order_id,
            client_order_id: ack.client_order_id,
            side: OrderSide::Sell,
            quantity,
            price,
            filled_qty: 0.0,
            cumulative_quote: 0.0,
            avg_fill_price: 0.0,
            status: ack.status,
        });
        trade.exit_strategy = match (kind, price) {
            (OrderKind::Limit, Some(limit_price)) => ExitStrategy::LimitSell { limit_price },
            _ => ExitStrategy::MarketSell,
        };
        trade.status = TradeStatus::ExitPending;
        trade.touch();

        info!(
            trade_id = %trade.id,
            order_id = ack.order_id,
            kind = kind.as_str(),
            price = ?price,
            quantity,
            "exit order placed"
        );
        self.commit(trade).await
    }

    /// Market sell with the write gate already held (used by both the public
    /// command and triggered exits).
    async fn market_sell_inner(&self, trade_id: &str) -> Result<Trade, TradeError> {
        let trade = self.get_for_update(trade_id)?;
        self.place_exit_order(trade, OrderKind::Market, None).await
    }

    /// Locate the trade owning the reported order and apply the fill state.
    /// Reports that match nothing are retained in the store but otherwise
    /// ignored.
    async fn apply_execution_report(&self, report: &ExecutionReport) -> Result<(), TradeError> {
        let _gate = self.write_gate.lock().await;

        enum Role {
            Entry,
            Exit,
        }

        let matched = {
            let trades = self.trades.read();
            trades.values().find_map(|t| {
                if t.entry.order_id == report.order_id {
                    Some((t.clone(), Role::Entry))
                } else if t
                    .exit_order
                    .as_ref()
                    .map_or(false, |o| o.order_id == report.order_id)
                {
                    Some((t.clone(), Role::Exit))
                } else {
                    None
                }
            })
        };

        let (mut trade, role) = match matched {
            Some(m) => m,
            None => {
                debug!(
                    order_id = report.order_id,
                    symbol = %report.symbol,
                    "execution report matches no tracked trade - retained only"
                );
                return Ok(());
            }
        };

        if !trade.is_mutable() {
            debug!(trade_id = %trade.id, "report for immutable trade ignored");
            return Ok(());
        }
        if report.event_time < trade.last_report_time {
            debug!(trade_id = %trade.id, "stale report (older than replay marker) ignored");
            return Ok(());
        }

        let applied = match role {
            Role::Entry => trade.entry.apply_report(report),
            Role::Exit => trade
                .exit_order
                .as_mut()
                .map_or(false, |o| o.apply_report(report)),
        };
        if !applied {
            debug!(trade_id = %trade.id, order_id = report.order_id, "redelivered report ignored");
            return Ok(());
        }

        debug!(
            trade_id = %trade.id,
            order_id = report.order_id,
            last_fill_qty = report.last_fill_qty,
            last_fill_price = report.last_fill_price,
            cumulative_qty = report.cumulative_qty,
            status = %report.status,
            "execution report applied"
        );
        trade.last_report_time = trade.last_report_time.max(report.event_time);

        match role {
            Role::Entry => match report.status {
                OrderStatus::Filled if trade.status == TradeStatus::EntryPending => {
                    trade.status = TradeStatus::Open;
                    info!(
                        trade_id = %trade.id,
                        filled_qty = trade.entry.filled_qty,
                        avg_price = trade.entry.avg_fill_price,
                        "entry filled - trade open"
                    );
                }
                OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
                    if trade.status == TradeStatus::EntryPending =>
                {
                    trade.status = TradeStatus::Cancelled;
                    info!(trade_id = %trade.id, status = %report.status, "entry order gone - trade cancelled");
                }
                _ => {}
            },
            Role::Exit => match report.status {
                OrderStatus::Filled if trade.status == TradeStatus::ExitPending => {
                    trade.status = TradeStatus::Closed;
                    info!(
                        trade_id = %trade.id,
                        avg_price = trade.exit_order.as_ref().map(|o| o.avg_fill_price).unwrap_or(0.0),
                        "exit filled - trade closed"
                    );
                    self.notices.broadcast(
                        NoticeLevel::Info,
                        format!("trade {} closed on {}", trade.id, trade.symbol),
                    );
                }
                OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
                    if trade.status == TradeStatus::ExitPending =>
                {
                    // Cancelled exchange-side (not by us); resume managing.
                    trade.status = TradeStatus::Open;
                    trade.exit_order = None;
                    trade.exit_strategy = ExitStrategy::None;
                    warn!(trade_id = %trade.id, status = %report.status, "exit order gone exchange-side - trade reopened");
                    self.notices.broadcast(
                        NoticeLevel::Warning,
                        format!("exit order for trade {} was cancelled on the exchange", trade.id),
                    );
                }
                _ => {}
            },
        }

        trade.touch();
        self.commit(trade).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Price feed management
    // -------------------------------------------------------------------------

    /// Acquire or release the symbol's price feed to match the trade's state.
    fn sync_price_feed(&self, trade: &Trade) {
        if trade.needs_price_feed() {
            self.ensure_price_feed(&trade.symbol);
        } else {
            self.release_price_feed_if_idle(&trade.symbol);
        }
    }

    /// Start the tick forwarder for `symbol` if not already running.
    fn ensure_price_feed(&self, symbol: &str) {
        let mut feeds = self.feeds.lock();
        if feeds.contains_key(symbol) {
            return;
        }

        let service = match self.weak.upgrade() {
            Some(s) => s,
            None => return,
        };

        let mut rx = self.streams.subscribe(symbol);
        let sym = symbol.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => service.on_price_update(&tick).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Ticks are ephemeral; losing some only delays exit
                        // evaluation until the next one.
                        warn!(symbol = %sym, missed, "price feed lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        feeds.insert(symbol.to_string(), handle);
    }

    /// Stop the symbol's forwarder when no trade needs its ticks any more.
    fn release_price_feed_if_idle(&self, symbol: &str) {
        let still_needed = self
            .trades
            .read()
            .values()
            .any(|t| t.symbol == symbol && t.needs_price_feed());
        if still_needed {
            return;
        }

        if let Some(handle) = self.feeds.lock().remove(symbol) {
            handle.abort();
            self.streams.release(symbol);
            debug!(symbol, "price feed released");
        }
    }
}

impl std::fmt::Debug for TradeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeService")
            .field("trades", &self.trades.read().len())
            .finish()
    }
}

fn new_client_order_id() -> String {
    format!("bor-{}", Uuid::new_v4().simple())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::BinanceClient;
    use crate::binance::exchange_info::SymbolFilters;
    use crate::trade::gateway::OrderAck;
    use crate::trade::store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    // -------------------------------------------------------------------------
    // Scripted gateway
    // -------------------------------------------------------------------------

    struct MockGateway {
        calls: SyncMutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl MockGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: SyncMutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, TradeError> {
            let order_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(format!(
                "submit {} {} {}",
                order.side,
                order.kind.as_str(),
                order.symbol
            ));
            Ok(OrderAck {
                order_id,
                client_order_id: order.client_order_id.clone(),
                status: OrderStatus::New,
            })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<(), TradeError> {
            self.calls.lock().push(format!("cancel {order_id}"));
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    async fn setup() -> (Arc<TradeService>, Arc<MockGateway>, TradeStore) {
        let pool = store::open("sqlite::memory:").await.unwrap();
        let trade_store = TradeStore::new(pool);

        let client = Arc::new(BinanceClient::new("", "", "https://api.binance.com"));
        let info = Arc::new(ExchangeInfoService::new(client));
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "BTCUSDT".to_string(),
            SymbolFilters {
                tick_size: 0.01,
                step_size: 0.00001,
                min_notional: 10.0,
            },
        );
        info.apply_snapshot(snapshot);

        let notices = Arc::new(ClientNoticeService::new(16));
        let streams = Arc::new(TradeStreamManager::new("wss://127.0.0.1:9"));
        let gateway = MockGateway::new();

        let service = TradeService::new(
            gateway.clone(),
            trade_store.clone(),
            info,
            notices,
            streams,
        );
        (service, gateway, trade_store)
    }

    /// Build a raw executionReport frame and parse it through the production
    /// decoder, so tests and recovery replay share one format.
    fn report_frame(order_id: u64, side: &str, status: &str, z: f64, quote: f64, event_time: i64) -> String {
        format!(
            r#"{{"e":"executionReport","E":{event_time},"s":"BTCUSDT","c":"bor-test","S":"{side}","o":"LIMIT","q":"0.01","p":"30000","X":"{status}","i":{order_id},"l":"0","L":"0","z":"{z}","Z":"{quote}","T":{event_time}}}"#
        )
    }

    fn report(order_id: u64, side: &str, status: &str, z: f64, quote: f64, event_time: i64) -> ExecutionReport {
        user_stream::parse_execution_report(&report_frame(order_id, side, status, z, quote, event_time))
            .unwrap()
    }

    fn tick(price: f64, event_time: i64) -> PriceTick {
        PriceTick {
            symbol: "BTCUSDT".to_string(),
            price,
            event_time,
        }
    }

    async fn place(service: &TradeService) -> Trade {
        service
            .place_buy(BuyOrder {
                symbol: "BTCUSDT".to_string(),
                quantity: 0.01,
                limit_price: Some(30000.0),
            })
            .await
            .unwrap()
    }

    /// Place a buy and fill it, leaving the trade `Open` at 0.01 @ 30000.
    async fn open_trade(service: &TradeService) -> Trade {
        let trade = place(service).await;
        service
            .on_execution_report(&report(trade.entry.order_id, "BUY", "FILLED", 0.01, 300.0, 1000))
            .await
            .unwrap();
        service.get(&trade.id).unwrap()
    }

    // -------------------------------------------------------------------------
    // Entry lifecycle
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn place_buy_creates_entry_pending_trade() {
        let (service, gateway, _) = setup().await;

        let trade = service
            .place_buy(BuyOrder {
                symbol: "BTCUSDT".to_string(),
                quantity: 0.012345,
                limit_price: Some(30000.123),
            })
            .await
            .unwrap();

        assert_eq!(trade.status, TradeStatus::EntryPending);
        assert!((trade.entry.quantity - 0.01234).abs() < 1e-12);
        assert!((trade.entry.price.unwrap() - 30000.12).abs() < 1e-9);
        assert!(trade.exit_strategy.is_none());
        assert_eq!(gateway.calls(), vec!["submit BUY LIMIT BTCUSDT"]);
        assert_eq!(service.get(&trade.id).unwrap(), trade);
    }

    #[tokio::test]
    async fn buy_below_min_notional_is_rejected() {
        let (service, gateway, _) = setup().await;

        let err = service
            .place_buy(BuyOrder {
                symbol: "BTCUSDT".to_string(),
                quantity: 0.0001,
                limit_price: Some(30000.0),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TradeError::Validation(_)));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn full_fill_report_opens_trade() {
        let (service, _, _) = setup().await;
        let trade = place(&service).await;

        service
            .on_execution_report(&report(trade.entry.order_id, "BUY", "FILLED", 0.01, 300.0, 1000))
            .await
            .unwrap();

        let opened = service.get(&trade.id).unwrap();
        assert_eq!(opened.status, TradeStatus::Open);
        assert!((opened.entry.filled_qty - 0.01).abs() < 1e-12);
        assert!((opened.entry.avg_fill_price - 30000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_report_does_not_double_count() {
        let (service, _, _) = setup().await;
        let trade = place(&service).await;

        let r = report(trade.entry.order_id, "BUY", "FILLED", 0.01, 300.0, 1000);
        service.on_execution_report(&r).await.unwrap();
        service.on_execution_report(&r).await.unwrap();

        let opened = service.get(&trade.id).unwrap();
        assert_eq!(opened.status, TradeStatus::Open);
        assert!((opened.entry.filled_qty - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn partial_fills_accumulate_average_price() {
        let (service, _, _) = setup().await;
        let trade = place(&service).await;
        let id = trade.entry.order_id;

        service
            .on_execution_report(&report(id, "BUY", "PARTIALLY_FILLED", 0.004, 119.6, 1000))
            .await
            .unwrap();
        service
            .on_execution_report(&report(id, "BUY", "FILLED", 0.01, 300.2, 1001))
            .await
            .unwrap();

        let opened = service.get(&trade.id).unwrap();
        assert_eq!(opened.status, TradeStatus::Open);
        assert!((opened.entry.avg_fill_price - 30020.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn cancel_buy_before_fill() {
        let (service, gateway, _) = setup().await;
        let trade = place(&service).await;

        let cancelled = service.cancel_buy(&trade.id).await.unwrap();
        assert_eq!(cancelled.status, TradeStatus::Cancelled);
        assert!(gateway
            .calls()
            .contains(&format!("cancel {}", trade.entry.order_id)));

        // Terminal: nothing further is accepted.
        assert!(matches!(
            service.market_sell(&trade.id).await,
            Err(TradeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_buy_after_full_fill_is_invalid() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;

        assert!(matches!(
            service.cancel_buy(&trade.id).await,
            Err(TradeError::InvalidState { .. })
        ));
    }

    // -------------------------------------------------------------------------
    // Exit strategies
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn stop_loss_requires_open_trade() {
        let (service, _, _) = setup().await;
        let trade = place(&service).await;

        assert!(matches!(
            service
                .set_stop_loss(&trade.id, StopLossSpec::Price(29000.0))
                .await,
            Err(TradeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn stop_loss_trigger_fires_market_sell_and_notice() {
        let (service, gateway, _) = setup().await;
        let trade = open_trade(&service).await;

        let notices = service.notices.subscribe();
        service
            .set_stop_loss(&trade.id, StopLossSpec::Price(29000.0))
            .await
            .unwrap();

        // Above the trigger: nothing happens.
        service.on_price_update(&tick(29500.0, 2000)).await;
        assert_eq!(service.get(&trade.id).unwrap().status, TradeStatus::Open);

        // At/below the trigger: market sell placed, trade exits.
        service.on_price_update(&tick(28900.0, 2001)).await;
        let after = service.get(&trade.id).unwrap();
        assert_eq!(after.status, TradeStatus::ExitPending);
        assert_eq!(after.exit_strategy, ExitStrategy::MarketSell);
        assert!(after.exit_order.is_some());
        assert!(gateway.calls().contains(&"submit SELL MARKET BTCUSDT".to_string()));

        let mut notices = notices;
        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert!(notice.message.contains("stop-loss triggered"));
    }

    #[tokio::test]
    async fn stop_loss_by_percent_below_entry() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;

        let updated = service
            .set_stop_loss(&trade.id, StopLossSpec::PercentBelowEntry(10.0))
            .await
            .unwrap();

        match updated.exit_strategy {
            ExitStrategy::StopLoss { trigger_price } => {
                assert!((trigger_price - 27000.0).abs() < 1e-6);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[tokio::test]
    async fn trailing_profit_activation_high_water_and_trigger() {
        let (service, gateway, _) = setup().await;
        let trade = open_trade(&service).await;

        service
            .set_trailing_profit(&trade.id, 5.0, 2.0)
            .await
            .unwrap();

        // Below the +5% activation threshold (31500): still armed-off.
        service.on_price_update(&tick(31000.0, 2000)).await;
        match service.get(&trade.id).unwrap().exit_strategy {
            ExitStrategy::TrailingProfit { activated, .. } => assert!(!activated),
            other => panic!("unexpected strategy {other:?}"),
        }

        // 31600 >= 31500: activates with high water 31600.
        service.on_price_update(&tick(31600.0, 2001)).await;
        match service.get(&trade.id).unwrap().exit_strategy {
            ExitStrategy::TrailingProfit {
                activated,
                high_water,
                ..
            } => {
                assert!(activated);
                assert!((high_water - 31600.0).abs() < 1e-9);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        // New high.
        service.on_price_update(&tick(32000.0, 2002)).await;
        match service.get(&trade.id).unwrap().exit_strategy {
            ExitStrategy::TrailingProfit { high_water, .. } => {
                assert!((high_water - 32000.0).abs() < 1e-9);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        // 31300 <= 32000 * 0.98 = 31360: triggers the market sell.
        service.on_price_update(&tick(31300.0, 2003)).await;
        let after = service.get(&trade.id).unwrap();
        assert_eq!(after.status, TradeStatus::ExitPending);
        assert!(gateway.calls().contains(&"submit SELL MARKET BTCUSDT".to_string()));
    }

    #[tokio::test]
    async fn trailing_high_water_never_decreases() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;
        service
            .set_trailing_profit(&trade.id, 5.0, 10.0)
            .await
            .unwrap();

        let mut last_high = 0.0;
        for (i, price) in [31600.0, 31550.0, 31900.0, 31700.0, 32000.0].iter().enumerate() {
            service.on_price_update(&tick(*price, 2000 + i as i64)).await;
            if let ExitStrategy::TrailingProfit { high_water, .. } =
                service.get(&trade.id).unwrap().exit_strategy
            {
                assert!(high_water >= last_high, "high water regressed");
                last_high = high_water;
            }
        }
        assert!((last_high - 32000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn new_exit_strategy_cancels_pending_exit_order_first() {
        let (service, gateway, _) = setup().await;
        let trade = open_trade(&service).await;

        let first = service.limit_sell_by_percent(&trade.id, 5.0).await.unwrap();
        assert_eq!(first.status, TradeStatus::ExitPending);
        let first_exit_id = first.exit_order.as_ref().unwrap().order_id;
        match first.exit_strategy {
            ExitStrategy::LimitSell { limit_price } => {
                assert!((limit_price - 31500.0).abs() < 1e-6);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        let second = service
            .limit_sell_by_price(&trade.id, 33000.0)
            .await
            .unwrap();
        match second.exit_strategy {
            ExitStrategy::LimitSell { limit_price } => {
                assert!((limit_price - 33000.0).abs() < 1e-6);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        let second_exit_id = second.exit_order.as_ref().unwrap().order_id;
        assert_ne!(first_exit_id, second_exit_id);

        // The prior order was cancelled before the replacement was submitted.
        let calls = gateway.calls();
        let cancel_pos = calls
            .iter()
            .position(|c| c == &format!("cancel {first_exit_id}"))
            .expect("expected a cancel for the first exit order");
        let resubmit_pos = calls
            .iter()
            .rposition(|c| c == "submit SELL LIMIT BTCUSDT")
            .unwrap();
        assert!(cancel_pos < resubmit_pos);
    }

    #[tokio::test]
    async fn market_sell_replaces_pending_limit_order() {
        let (service, gateway, _) = setup().await;
        let trade = open_trade(&service).await;

        let pending = service.limit_sell_by_percent(&trade.id, 5.0).await.unwrap();
        let limit_id = pending.exit_order.as_ref().unwrap().order_id;

        let sold = service.market_sell(&trade.id).await.unwrap();
        assert_eq!(sold.status, TradeStatus::ExitPending);
        assert_eq!(sold.exit_strategy, ExitStrategy::MarketSell);
        assert!(gateway.calls().contains(&format!("cancel {limit_id}")));
    }

    #[tokio::test]
    async fn exit_fill_closes_trade_and_allows_archive() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;

        let pending = service.market_sell(&trade.id).await.unwrap();
        let exit_id = pending.exit_order.as_ref().unwrap().order_id;

        service
            .on_execution_report(&report(exit_id, "SELL", "FILLED", 0.01, 310.0, 3000))
            .await
            .unwrap();

        let closed = service.get(&trade.id).unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);

        let archived = service.archive(&trade.id).await.unwrap();
        assert!(archived.archived);

        // Archived: immutable from here on.
        assert!(matches!(
            service.market_sell(&trade.id).await,
            Err(TradeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn exchange_side_exit_cancel_reopens_trade() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;

        let pending = service.limit_sell_by_percent(&trade.id, 5.0).await.unwrap();
        let exit_id = pending.exit_order.as_ref().unwrap().order_id;

        service
            .on_execution_report(&report(exit_id, "SELL", "CANCELED", 0.0, 0.0, 3000))
            .await
            .unwrap();

        let reopened = service.get(&trade.id).unwrap();
        assert_eq!(reopened.status, TradeStatus::Open);
        assert!(reopened.exit_order.is_none());
        assert!(reopened.exit_strategy.is_none());
    }

    // -------------------------------------------------------------------------
    // Archive / abandon
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn archive_requires_closed_or_abandoned() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;

        assert!(matches!(
            service.archive(&trade.id).await,
            Err(TradeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn abandon_is_idempotent_and_archivable() {
        let (service, gateway, _) = setup().await;
        let trade = open_trade(&service).await;
        let calls_before = gateway.calls().len();

        let abandoned = service.abandon(&trade.id).await.unwrap();
        assert_eq!(abandoned.status, TradeStatus::Abandoned);
        // No exchange interaction: the operator takes manual control.
        assert_eq!(gateway.calls().len(), calls_before);

        let again = service.abandon(&trade.id).await.unwrap();
        assert_eq!(again.status, TradeStatus::Abandoned);

        let archived = service.archive(&trade.id).await.unwrap();
        assert!(archived.archived);
    }

    #[tokio::test]
    async fn unknown_trade_is_not_found() {
        let (service, _, _) = setup().await;
        assert!(matches!(
            service.abandon("no-such-trade").await,
            Err(TradeError::NotFound(_))
        ));
    }

    // -------------------------------------------------------------------------
    // Unmatched reports & queries
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn unmatched_report_is_retained_without_effect() {
        let (service, _, trade_store) = setup().await;
        let trade = open_trade(&service).await;

        service
            .on_execution_report(&report(999_999, "SELL", "FILLED", 1.0, 100.0, 5000))
            .await
            .unwrap();

        assert_eq!(service.get(&trade.id).unwrap().status, TradeStatus::Open);
        let reports = trade_store.load_all_raw_execution_reports().await.unwrap();
        assert!(reports.iter().any(|(_, p)| p.contains("999999")));
    }

    #[tokio::test]
    async fn query_filters_symbol_and_archived() {
        let (service, _, _) = setup().await;
        let trade = open_trade(&service).await;
        service.abandon(&trade.id).await.unwrap();
        service.archive(&trade.id).await.unwrap();

        assert!(service.query(&TradeQuery::default()).is_empty());

        let all = service.query(&TradeQuery {
            symbol: Some("BTCUSDT".to_string()),
            include_archived: true,
        });
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, trade.id);
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn restart_restores_identical_state() {
        let (service, _, trade_store) = setup().await;
        let trade = open_trade(&service).await;
        service
            .set_stop_loss(&trade.id, StopLossSpec::Price(29000.0))
            .await
            .unwrap();
        let before = service.get(&trade.id).unwrap();

        // Simulated restart: fresh service over the same store.
        let client = Arc::new(BinanceClient::new("", "", "https://api.binance.com"));
        let info = Arc::new(ExchangeInfoService::new(client));
        let recovered = TradeService::new(
            MockGateway::new(),
            trade_store,
            info,
            Arc::new(ClientNoticeService::new(16)),
            Arc::new(TradeStreamManager::new("wss://127.0.0.1:9")),
        );
        let count = recovered.restore().await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(recovered.get(&trade.id).unwrap(), before);
    }

    #[tokio::test]
    async fn recovery_replays_reports_not_applied_before_shutdown() {
        let (service, _, trade_store) = setup().await;
        let trade = place(&service).await;

        // The fill arrived and was persisted raw, but the process died before
        // the trade snapshot was updated.
        trade_store
            .save_raw_execution_report(
                2000,
                &report_frame(trade.entry.order_id, "BUY", "FILLED", 0.01, 300.0, 2000),
            )
            .await
            .unwrap();

        let client = Arc::new(BinanceClient::new("", "", "https://api.binance.com"));
        let info = Arc::new(ExchangeInfoService::new(client));
        let recovered = TradeService::new(
            MockGateway::new(),
            trade_store,
            info,
            Arc::new(ClientNoticeService::new(16)),
            Arc::new(TradeStreamManager::new("wss://127.0.0.1:9")),
        );
        recovered.restore().await.unwrap();

        let replayed = recovered.get(&trade.id).unwrap();
        assert_eq!(replayed.status, TradeStatus::Open);
        assert!((replayed.entry.filled_qty - 0.01).abs() < 1e-12);
        assert!((replayed.entry.avg_fill_price - 30000.0).abs() < 1e-9);
    }
}
