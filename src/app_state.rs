// =============================================================================
// Central Application State — KIS Trading Gateway
// =============================================================================
//
// The single source of truth for the process. Every engine is an explicit
// field constructed at startup and threaded through the axum handlers via
// `State<Arc<AppState>>` — no module-level singletons.
//
// Thread safety: each engine guards its own aggregate (parking_lot locks and
// atomics); AppState itself is immutable after construction.
// =============================================================================

use std::sync::Arc;

use tracing::info;

use crate::config::KisConfig;
use crate::kis::{KisOrderAdapter, KisPortfolioProvider, KisRestClient, KisStatusProvider};
use crate::order::dispatch::DispatchWorker;
use crate::order::queue::OrderQueue;
use crate::order::reconcile::ReconciliationEngine;
use crate::quote::cache::QuoteCache;
use crate::quote::gateway::{GatewayTuning, QuoteGateway};
use crate::quote::ingest::QuoteIngest;
use crate::risk::DailyOrderCounter;
use crate::session::SessionOrchestrator;
use crate::types::{epoch_now, LiveReadiness};
use crate::upstream::{BrokerStatusProvider, OrderAdapter, PortfolioProvider, QuoteRest};

/// Injected upstream collaborators. Production wiring uses the KIS clients;
/// tests swap in doubles.
pub struct AppComponents {
    pub quote_rest: Arc<dyn QuoteRest>,
    pub order_adapter: Arc<dyn OrderAdapter>,
    pub status_provider: Arc<dyn BrokerStatusProvider>,
    pub portfolio: Option<Arc<dyn PortfolioProvider>>,
}

pub struct AppState {
    pub config: KisConfig,

    // ── Quotes ──────────────────────────────────────────────────────────
    pub quote_cache: Arc<QuoteCache>,
    pub quote_ingest: Arc<QuoteIngest>,
    pub quote_gateway: Arc<QuoteGateway>,

    // ── Orders ──────────────────────────────────────────────────────────
    pub order_queue: Arc<OrderQueue>,
    pub dispatcher: Arc<DispatchWorker>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub daily_orders: DailyOrderCounter,

    // ── Session / portfolio ─────────────────────────────────────────────
    pub session: Arc<SessionOrchestrator>,
    pub portfolio: Option<Arc<dyn PortfolioProvider>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Assemble the full engine graph from configuration plus injected
    /// upstream collaborators.
    pub fn new(config: KisConfig, components: AppComponents) -> Self {
        let quote_cache = Arc::new(QuoteCache::new());
        let quote_ingest = Arc::new(QuoteIngest::new(
            quote_cache.clone(),
            config.stale_after_sec,
            config.heartbeat_timeout_sec,
        ));
        let quote_gateway = Arc::new(QuoteGateway::new(
            quote_cache.clone(),
            components.quote_rest,
            GatewayTuning::from_config(&config),
        ));

        let order_queue = Arc::new(OrderQueue::new(config.order_max_attempts));
        let dispatcher = Arc::new(DispatchWorker::new(
            order_queue.clone(),
            components.order_adapter,
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            order_queue.clone(),
            components.status_provider,
            config.reconcile_interval_sec,
            config.journal_path.clone(),
        ));

        let session = Arc::new(SessionOrchestrator::bootstrap(config.env.to_string()));

        Self {
            config,
            quote_cache,
            quote_ingest,
            quote_gateway,
            order_queue,
            dispatcher,
            reconciler,
            daily_orders: DailyOrderCounter::new(),
            session,
            portfolio: components.portfolio,
            start_time: std::time::Instant::now(),
        }
    }

    /// Production wiring: all collaborators are the KIS implementations
    /// sharing one REST client. The portfolio proxy is only configured once
    /// the required credentials are present.
    pub fn with_kis(config: KisConfig) -> (Self, Arc<KisRestClient>) {
        let rest = Arc::new(KisRestClient::new(
            config.app_key.clone(),
            config.app_secret.clone(),
            config.rest_base_url(),
        ));

        let portfolio: Option<Arc<dyn PortfolioProvider>> = if config.missing_required().is_empty()
        {
            Some(Arc::new(KisPortfolioProvider::new(rest.clone(), config.env)))
        } else {
            info!("portfolio provider not configured — required env incomplete");
            None
        };

        let components = AppComponents {
            quote_rest: rest.clone(),
            order_adapter: Arc::new(KisOrderAdapter::new(
                rest.clone(),
                config.env,
                config.account_no.clone(),
            )),
            status_provider: Arc::new(KisStatusProvider::new(rest.clone(), config.env)),
            portfolio,
        };

        (Self::new(config, components), rest)
    }

    // ── Live-readiness probe ────────────────────────────────────────────

    /// Aggregate env completeness, WS connectivity and heartbeat freshness
    /// into the go/no-go trading gate.
    pub fn live_readiness(&self) -> LiveReadiness {
        let required_env_missing = self.config.missing_required();
        let metrics = self.quote_ingest.metrics(epoch_now());

        let mut blocker_reasons = Vec::new();
        if !required_env_missing.is_empty() {
            blocker_reasons.push(format!(
                "missing required env: {}",
                required_env_missing.join(", ")
            ));
        }
        if !metrics.ws_connected {
            blocker_reasons.push("websocket disconnected".to_string());
        }
        if !metrics.ws_heartbeat_fresh {
            blocker_reasons.push("websocket heartbeat stale".to_string());
        }

        LiveReadiness {
            can_trade: blocker_reasons.is_empty(),
            required_env_missing,
            ws_connected: metrics.ws_connected,
            ws_last_error: metrics.ws_last_error,
            blocker_reasons,
        }
    }
}

#[cfg(test)]
pub mod test_support {
    //! Shared doubles for handler/engine tests.

    use super::*;
    use crate::types::{OrderJob, OrderRequest, QuoteSnapshot, QuoteSource, QuoteState};
    use crate::upstream::{BrokerError, PlacedOrder, UpstreamError};
    use async_trait::async_trait;

    pub struct StaticQuoteRest;

    #[async_trait]
    impl QuoteRest for StaticQuoteRest {
        async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError> {
            Ok(QuoteSnapshot {
                symbol: symbol.to_string(),
                price: 70_000.0,
                change_pct: 0.0,
                turnover: 0.0,
                source: QuoteSource::KisRest,
                ts: epoch_now(),
                freshness_sec: 0.0,
                state: QuoteState::Healthy,
            })
        }
    }

    pub struct OkOrderAdapter;

    #[async_trait]
    impl crate::upstream::OrderAdapter for OkOrderAdapter {
        async fn place_order(&self, _request: &OrderRequest) -> Result<PlacedOrder, BrokerError> {
            Ok(PlacedOrder {
                broker_order_id: "KIS-TEST".into(),
                raw: serde_json::json!({}),
            })
        }
    }

    pub struct SilentStatusProvider;

    #[async_trait]
    impl BrokerStatusProvider for SilentStatusProvider {
        async fn order_status(
            &self,
            _order_id: &str,
            _job: &OrderJob,
        ) -> Result<Option<String>, UpstreamError> {
            Ok(None)
        }
    }

    /// A ready-to-use state over doubles, with no journal and no portfolio.
    pub fn test_state(config: KisConfig) -> Arc<AppState> {
        let mut config = config;
        config.journal_path = None;
        Arc::new(AppState::new(
            config,
            AppComponents {
                quote_rest: Arc::new(StaticQuoteRest),
                order_adapter: Arc::new(OkOrderAdapter),
                status_provider: Arc::new(SilentStatusProvider),
                portfolio: None,
            },
        ))
    }
}
