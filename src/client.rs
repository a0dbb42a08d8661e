//! Typed façade over the ~36 terminal RPCs (§4.9).
//!
//! Every call funnels through [`Mt5Client::resilient_call`]: priority queue
//! admission, circuit-breaker gating, and exponential-backoff retry, in that
//! order — the same composition the teacher's middleware would apply via
//! `ServiceBuilder::new().layer(bulkhead).layer(breaker).layer(retry)`, done
//! as explicit async composition instead of a `tower::Service` stack because
//! `order_send` additionally needs the orchestrator's WAL/verify steps
//! interleaved between attempts, which a generic `Layer` can't see into
//! (§9 design note: decorator-based resilience replaced by an explicit
//! `resilient_call` helper).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tonic::transport::Channel;

use crate::classify::{operation_criticality, OperationCriticality};
use crate::circuit::CircuitBreaker;
use crate::codec::{decode_rates, decode_ticks, RateBar, Tick};
use crate::config::Config;
use crate::connection::{ConnectionManager, HealthStatus};
use crate::constants::RemoteConstants;
use crate::error::BridgeError;
use crate::orchestrator::{OrderResult, TransactionOrchestrator, TransactionResult};
use crate::proto::mt5::mt5_service_client::Mt5ServiceClient;
use crate::proto::mt5::{
    CopyRatesPosRequest, CopyRatesRangeRequest, CopyRatesRequest, CopyTicksRangeRequest,
    CopyTicksRequest, Empty, HistoryRequest, InitRequest, LoginRequest, MarginRequest,
    OrderRequest, OrdersRequest, PositionsRequest, ProfitRequest, SymbolRequest,
    SymbolSelectRequest,
};
use crate::queue::RequestQueue;
use crate::retry::{execute_with_timeout, retry_with_backoff, NoopHooks, RetryPolicy};
use crate::wal::Wal;

/// The typed client façade.
pub struct Mt5Client {
    config: Config,
    connection: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<RequestQueue>,
    orchestrator: Arc<TransactionOrchestrator>,
}

impl Mt5Client {
    /// Connects to the terminal bridge and loads the constants table.
    pub async fn connect(config: Config) -> Result<Self, BridgeError> {
        let connection = ConnectionManager::new(config.clone());
        let breaker = Arc::new(CircuitBreaker::with_enabled(
            config.cb_threshold,
            std::time::Duration::from_secs_f64(config.cb_recovery_seconds),
            config.cb_half_open_max,
            config.enable_circuit_breaker,
        ));
        connection.set_breaker(breaker.clone());
        connection.connect().await?;

        let queue = RequestQueue::new(config.queue_max_concurrent, config.queue_max_depth);
        let wal = Arc::new(Wal::open(config.wal_path.clone().into(), config.wal_retention_days).await?);
        recover_wal(&connection, &config, &wal).await?;
        let orchestrator = Arc::new(TransactionOrchestrator::new(
            breaker.clone(),
            wal,
            RetryPolicy::critical(&config),
        ));

        Ok(Self {
            config,
            connection,
            breaker,
            queue,
            orchestrator,
        })
    }

    /// The named-constant table loaded on connect (§4.8, §10.6).
    pub fn constants(&self) -> RemoteConstants {
        self.connection.constants()
    }

    /// Queries the terminal's health RPC directly, bypassing the queue.
    pub async fn health_check(&self) -> Result<HealthStatus, BridgeError> {
        self.connection.check_health().await
    }

    fn grpc_client(&self) -> Result<Mt5ServiceClient<Channel>, BridgeError> {
        mt5_client(&self.connection)
    }

    /// Routes `work` through the priority queue, circuit breaker, and retry
    /// policy, in that order (§4.5, §4.3, §4.4).
    async fn resilient_call<T, F, Fut>(
        &self,
        operation: &str,
        coalesce_key: Option<String>,
        work: F,
    ) -> Result<T, BridgeError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, BridgeError>> + Send + 'static,
    {
        let priority = operation_criticality(operation);
        let policy = RetryPolicy::standard(&self.config);
        let call_timeout = self.config.call_timeout;
        let breaker = self.breaker.clone();
        let work = Arc::new(work);

        self.queue
            .submit(priority, coalesce_key.as_deref(), move || {
                let breaker = breaker.clone();
                let work = work.clone();
                async move {
                    retry_with_backoff(&policy, &mut NoopHooks, move |_attempt| {
                        let breaker = breaker.clone();
                        let work = work.clone();
                        async move {
                            breaker.gate()?;
                            match execute_with_timeout(call_timeout, work()).await {
                                Ok(value) => {
                                    breaker.record_success();
                                    Ok(value)
                                }
                                Err(err) => {
                                    breaker.record_failure();
                                    Err(err)
                                }
                            }
                        }
                    })
                    .await
                }
            })
            .await
    }

    // ---- Terminal -------------------------------------------------------

    pub async fn initialize(
        &self,
        path: Option<String>,
        login: Option<i64>,
        password: Option<String>,
        server: Option<String>,
        timeout_ms: Option<i32>,
        portable: bool,
    ) -> Result<bool, BridgeError> {
        let connection = self.connection.clone();
        let req = InitRequest {
            path,
            login,
            password,
            server,
            timeout_ms,
            portable,
        };
        self.resilient_call("initialize", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.initialize(req).await?.into_inner().result)
            }
        })
        .await
    }

    pub async fn login(
        &self,
        login: i64,
        password: String,
        server: String,
        timeout_ms: Option<i32>,
    ) -> Result<bool, BridgeError> {
        let connection = self.connection.clone();
        let req = LoginRequest {
            login,
            password,
            server,
            timeout_ms,
        };
        self.resilient_call("login", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.login(req).await?.into_inner().result)
            }
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("shutdown", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                client.shutdown(Empty {}).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn version(&self) -> Result<(i32, i32, String), BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("version", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let v = client.version(Empty {}).await?.into_inner();
                Ok((v.major, v.minor, v.build))
            }
        })
        .await
    }

    pub async fn last_error(&self) -> Result<(i32, String), BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("last_error", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let e = client.last_error(Empty {}).await?.into_inner();
                Ok((e.code, e.message))
            }
        })
        .await
    }

    pub async fn terminal_info(&self) -> Result<Value, BridgeError> {
        self.call_dict("terminal_info", None, Empty {}, |mut c, req| async move {
            c.terminal_info(req).await
        })
        .await
    }

    pub async fn account_info(&self) -> Result<Value, BridgeError> {
        self.call_dict("account_info", None, Empty {}, |mut c, req| async move {
            c.account_info(req).await
        })
        .await
    }

    // ---- Symbols ----------------------------------------------------------

    pub async fn symbols_total(&self) -> Result<i64, BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("symbols_total", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.symbols_total(Empty {}).await?.into_inner().value)
            }
        })
        .await
    }

    pub async fn symbols_get(&self, group: Option<String>) -> Result<Vec<String>, BridgeError> {
        let connection = self.connection.clone();
        let req = SymbolRequest {
            symbol: group.unwrap_or_default(),
        };
        self.resilient_call("symbols_get", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.symbols_get(req).await?.into_inner();
                let mut names = Vec::with_capacity(resp.total.max(0) as usize);
                for chunk in resp.chunks {
                    let parsed: Vec<String> = serde_json::from_str(&chunk)?;
                    names.extend(parsed);
                }
                Ok(names)
            }
        })
        .await
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<Value, BridgeError> {
        self.call_dict(
            "symbol_info",
            Some(format!("symbol_info:{symbol}")),
            SymbolRequest {
                symbol: symbol.to_string(),
            },
            |mut c, req| async move { c.symbol_info(req).await },
        )
        .await
    }

    pub async fn symbol_info_tick(&self, symbol: &str) -> Result<Value, BridgeError> {
        self.call_dict(
            "symbol_info_tick",
            Some(format!("symbol_info_tick:{symbol}")),
            SymbolRequest {
                symbol: symbol.to_string(),
            },
            |mut c, req| async move { c.symbol_info_tick(req).await },
        )
        .await
    }

    pub async fn symbol_select(&self, symbol: &str, enable: bool) -> Result<bool, BridgeError> {
        let connection = self.connection.clone();
        let req = SymbolSelectRequest {
            symbol: symbol.to_string(),
            enable,
        };
        self.resilient_call("symbol_select", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.symbol_select(req).await?.into_inner().result)
            }
        })
        .await
    }

    // ---- Market data --------------------------------------------------

    pub async fn copy_rates_from(
        &self,
        symbol: &str,
        timeframe: i32,
        date_from: i64,
        count: i32,
    ) -> Result<Vec<RateBar>, BridgeError> {
        let connection = self.connection.clone();
        let req = CopyRatesRequest {
            symbol: symbol.to_string(),
            timeframe,
            date_from,
            count,
        };
        self.resilient_call("copy_rates_from", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.copy_rates_from(req).await?.into_inner();
                decode_rates(&resp.data)
            }
        })
        .await
    }

    pub async fn copy_rates_from_pos(
        &self,
        symbol: &str,
        timeframe: i32,
        start_pos: i32,
        count: i32,
    ) -> Result<Vec<RateBar>, BridgeError> {
        let connection = self.connection.clone();
        let req = CopyRatesPosRequest {
            symbol: symbol.to_string(),
            timeframe,
            start_pos,
            count,
        };
        self.resilient_call("copy_rates_from_pos", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.copy_rates_from_pos(req).await?.into_inner();
                decode_rates(&resp.data)
            }
        })
        .await
    }

    pub async fn copy_rates_range(
        &self,
        symbol: &str,
        timeframe: i32,
        date_from: i64,
        date_to: i64,
    ) -> Result<Vec<RateBar>, BridgeError> {
        let connection = self.connection.clone();
        let req = CopyRatesRangeRequest {
            symbol: symbol.to_string(),
            timeframe,
            date_from,
            date_to,
        };
        self.resilient_call("copy_rates_range", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.copy_rates_range(req).await?.into_inner();
                decode_rates(&resp.data)
            }
        })
        .await
    }

    pub async fn copy_ticks_from(
        &self,
        symbol: &str,
        date_from: i64,
        count: i32,
        flags: i32,
    ) -> Result<Vec<Tick>, BridgeError> {
        let connection = self.connection.clone();
        let req = CopyTicksRequest {
            symbol: symbol.to_string(),
            date_from,
            count,
            flags,
        };
        self.resilient_call("copy_ticks_from", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.copy_ticks_from(req).await?.into_inner();
                decode_ticks(&resp.data)
            }
        })
        .await
    }

    pub async fn copy_ticks_range(
        &self,
        symbol: &str,
        date_from: i64,
        date_to: i64,
        flags: i32,
    ) -> Result<Vec<Tick>, BridgeError> {
        let connection = self.connection.clone();
        let req = CopyTicksRangeRequest {
            symbol: symbol.to_string(),
            date_from,
            date_to,
            flags,
        };
        self.resilient_call("copy_ticks_range", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.copy_ticks_range(req).await?.into_inner();
                decode_ticks(&resp.data)
            }
        })
        .await
    }

    // ---- Trading --------------------------------------------------------

    pub async fn order_calc_margin(
        &self,
        action: i32,
        symbol: &str,
        volume: f64,
        price: f64,
    ) -> Result<Option<f64>, BridgeError> {
        let connection = self.connection.clone();
        let req = MarginRequest {
            action,
            symbol: symbol.to_string(),
            volume,
            price,
        };
        self.resilient_call("order_calc_margin", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.order_calc_margin(req).await?.into_inner();
                Ok(resp.has_value.then_some(resp.value))
            }
        })
        .await
    }

    pub async fn order_calc_profit(
        &self,
        action: i32,
        symbol: &str,
        volume: f64,
        price_open: f64,
        price_close: f64,
    ) -> Result<Option<f64>, BridgeError> {
        let connection = self.connection.clone();
        let req = ProfitRequest {
            action,
            symbol: symbol.to_string(),
            volume,
            price_open,
            price_close,
        };
        self.resilient_call("order_calc_profit", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                let resp = client.order_calc_profit(req).await?.into_inner();
                Ok(resp.has_value.then_some(resp.value))
            }
        })
        .await
    }

    pub async fn order_check(&self, request: Value) -> Result<Value, BridgeError> {
        self.call_dict(
            "order_check",
            None,
            OrderRequest {
                json_request: request.to_string(),
            },
            |mut c, req| async move { c.order_check(req).await },
        )
        .await
    }

    /// Submits an order through the transaction orchestrator (§4.7): the
    /// sole operation that does not go straight to the terminal. `request`
    /// must be a JSON object shaped like the terminal's order-request dict;
    /// its `comment` field (if any) is preserved, with the idempotency key
    /// prefixed onto it.
    pub async fn order_send(&self, request: Value) -> Result<TransactionResult, BridgeError> {
        self.submit_order(crate::request_id::generate_request_id(), request)
            .await
    }

    /// Fires `request` on the queue without waiting for completion (§4.9):
    /// returns the request id immediately; `on_complete`/`on_error` run on a
    /// detached task once the orchestrator resolves the order.
    pub fn order_send_async<F, G>(&self, request: Value, on_complete: F, on_error: G) -> String
    where
        F: FnOnce(TransactionResult) + Send + 'static,
        G: FnOnce(BridgeError) + Send + 'static,
    {
        let request_id = crate::request_id::generate_request_id();
        let fut = self.submit_order(request_id.clone(), request);
        tokio::spawn(async move {
            match fut.await {
                Ok(result) => on_complete(result),
                Err(err) => on_error(err),
            }
        });
        request_id
    }

    /// Submits every order in `requests` through the orchestrator in
    /// parallel (§4.9); order submitted together are not guaranteed to
    /// complete in submission order. Optional callbacks run per order as
    /// each one resolves, and `on_all_complete` runs once after every order
    /// has settled, given the full result set in submission order.
    pub async fn order_send_batch(
        &self,
        requests: Vec<Value>,
        on_each_complete: Option<Arc<dyn Fn(&TransactionResult) + Send + Sync>>,
        on_each_error: Option<Arc<dyn Fn(&BridgeError) + Send + Sync>>,
        on_all_complete: Option<Arc<dyn Fn(&[Result<TransactionResult, BridgeError>]) + Send + Sync>>,
    ) -> Vec<Result<TransactionResult, BridgeError>> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let fut = self.submit_order(crate::request_id::generate_request_id(), request);
                let on_each_complete = on_each_complete.clone();
                let on_each_error = on_each_error.clone();
                tokio::spawn(async move {
                    let result = fut.await;
                    match &result {
                        Ok(tx) => {
                            if let Some(cb) = &on_each_complete {
                                cb(tx);
                            }
                        }
                        Err(err) => {
                            if let Some(cb) = &on_each_error {
                                cb(err);
                            }
                        }
                    }
                    result
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(BridgeError::Operation(format!("order task panicked: {e}")))),
            );
        }
        if let Some(cb) = &on_all_complete {
            cb(&results);
        }
        results
    }

    /// Shared order-submission path behind `order_send`/`order_send_async`/
    /// `order_send_batch`: builds the orchestrator's `send`/`verify`
    /// closures against owned, cloned handles so the returned future is
    /// `'static` and safe to hand to `tokio::spawn` or the queue.
    fn submit_order(
        &self,
        request_id: String,
        request: Value,
    ) -> impl std::future::Future<Output = Result<TransactionResult, BridgeError>> + Send + 'static
    {
        let comment = request
            .get("comment")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let payload = request.to_string();
        let request_template = request;
        let connection_send = self.connection.clone();
        let connection_verify = self.connection.clone();
        let connection_health = self.connection.clone();
        let config = self.config.clone();
        let orchestrator = self.orchestrator.clone();
        let queue = self.queue.clone();

        async move {
            queue
                .submit(OperationCriticality::Critical, None, move || {
                    async move {
                        orchestrator
                            .execute_with_id(
                                request_id,
                                "order_send",
                                &comment,
                                &payload,
                                {
                                    let call_timeout = config.call_timeout;
                                    move |embedded_comment| {
                                        let connection = connection_send.clone();
                                        let mut request = request_template.clone();
                                        let embedded_comment = embedded_comment.to_string();
                                        Box::pin(execute_with_timeout(call_timeout, async move {
                                            request["comment"] = Value::String(embedded_comment);
                                            let mut client = mt5_client(&connection)?;
                                            let response = client
                                                .order_send(OrderRequest {
                                                    json_request: request.to_string(),
                                                })
                                                .await?;
                                            let json_data = response.into_inner().json_data;
                                            if json_data.is_empty() {
                                                return Err(BridgeError::EmptyResponse {
                                                    operation: "order_send".to_string(),
                                                });
                                            }
                                            let value: Value = serde_json::from_str(&json_data)?;
                                            let retcode = value
                                                .get("retcode")
                                                .and_then(|v| v.as_i64())
                                                .unwrap_or(0) as i32;
                                            Ok(OrderResult {
                                                retcode,
                                                payload: value,
                                            })
                                        }))
                                    }
                                },
                                move |request_id| {
                                    let connection = connection_verify.clone();
                                    let config = config.clone();
                                    let request_id = request_id.to_string();
                                    Box::pin(async move {
                                        verify_order(&connection, &config, &request_id).await
                                    })
                                },
                                move || {
                                    let connection = connection_health.clone();
                                    Box::pin(async move {
                                        connection.check_health().await.map(|s| s.healthy).unwrap_or(false)
                                    })
                                },
                            )
                            .await
                    }
                })
                .await
        }
    }

    // ---- Positions --------------------------------------------------------

    pub async fn positions_total(&self) -> Result<i64, BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("positions_total", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.positions_total(Empty {}).await?.into_inner().value)
            }
        })
        .await
    }

    pub async fn positions_get(
        &self,
        symbol: Option<String>,
        group: Option<String>,
        ticket: Option<i64>,
    ) -> Result<Vec<Value>, BridgeError> {
        self.call_dict_list(
            "positions_get",
            PositionsRequest {
                symbol,
                group,
                ticket,
            },
            |mut c, req| async move { c.positions_get(req).await },
        )
        .await
    }

    // ---- Orders -----------------------------------------------------------

    pub async fn orders_total(&self) -> Result<i64, BridgeError> {
        let connection = self.connection.clone();
        self.resilient_call("orders_total", None, move || {
            let connection = connection.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.orders_total(Empty {}).await?.into_inner().value)
            }
        })
        .await
    }

    pub async fn orders_get(
        &self,
        symbol: Option<String>,
        group: Option<String>,
        ticket: Option<i64>,
    ) -> Result<Vec<Value>, BridgeError> {
        self.call_dict_list(
            "orders_get",
            OrdersRequest {
                symbol,
                group,
                ticket,
            },
            |mut c, req| async move { c.orders_get(req).await },
        )
        .await
    }

    // ---- History ------------------------------------------------------

    pub async fn history_orders_total(&self, date_from: i64, date_to: i64) -> Result<i64, BridgeError> {
        let connection = self.connection.clone();
        let req = history_request(date_from, date_to, None, None, None);
        self.resilient_call("history_orders_total", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.history_orders_total(req).await?.into_inner().value)
            }
        })
        .await
    }

    pub async fn history_orders_get(
        &self,
        date_from: i64,
        date_to: i64,
        group: Option<String>,
        ticket: Option<i64>,
        position: Option<i64>,
    ) -> Result<Vec<Value>, BridgeError> {
        self.call_dict_list(
            "history_orders_get",
            history_request(date_from, date_to, group, ticket, position),
            |mut c, req| async move { c.history_orders_get(req).await },
        )
        .await
    }

    pub async fn history_deals_total(&self, date_from: i64, date_to: i64) -> Result<i64, BridgeError> {
        let connection = self.connection.clone();
        let req = history_request(date_from, date_to, None, None, None);
        self.resilient_call("history_deals_total", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.history_deals_total(req).await?.into_inner().value)
            }
        })
        .await
    }

    pub async fn history_deals_get(
        &self,
        date_from: i64,
        date_to: i64,
        group: Option<String>,
        ticket: Option<i64>,
        position: Option<i64>,
    ) -> Result<Vec<Value>, BridgeError> {
        self.call_dict_list(
            "history_deals_get",
            history_request(date_from, date_to, group, ticket, position),
            |mut c, req| async move { c.history_deals_get(req).await },
        )
        .await
    }

    // ---- Market depth -------------------------------------------------

    pub async fn market_book_add(&self, symbol: &str) -> Result<bool, BridgeError> {
        let connection = self.connection.clone();
        let req = SymbolRequest {
            symbol: symbol.to_string(),
        };
        self.resilient_call("market_book_add", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.market_book_add(req).await?.into_inner().result)
            }
        })
        .await
    }

    pub async fn market_book_get(&self, symbol: &str) -> Result<Vec<Value>, BridgeError> {
        self.call_dict_list(
            "market_book_get",
            SymbolRequest {
                symbol: symbol.to_string(),
            },
            |mut c, req| async move { c.market_book_get(req).await },
        )
        .await
    }

    pub async fn market_book_release(&self, symbol: &str) -> Result<bool, BridgeError> {
        let connection = self.connection.clone();
        let req = SymbolRequest {
            symbol: symbol.to_string(),
        };
        self.resilient_call("market_book_release", None, move || {
            let connection = connection.clone();
            let req = req.clone();
            async move {
                let mut client = mt5_client(&connection)?;
                Ok(client.market_book_release(req).await?.into_inner().result)
            }
        })
        .await
    }

    // ---- Shared plumbing ------------------------------------------------

    /// Calls an RPC returning `DictData{json_data}`, decoding it to a JSON
    /// value.
    async fn call_dict<Req, Fut>(
        &self,
        operation: &str,
        coalesce_key: Option<String>,
        request: Req,
        call: impl Fn(Mt5ServiceClient<Channel>, Req) -> Fut + Send + Sync + 'static,
    ) -> Result<Value, BridgeError>
    where
        Req: Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<tonic::Response<crate::proto::mt5::DictData>, tonic::Status>>
            + Send
            + 'static,
    {
        let connection = self.connection.clone();
        let call = Arc::new(call);
        self.resilient_call(operation, coalesce_key, move || {
            let connection = connection.clone();
            let request = request.clone();
            let call = call.clone();
            async move {
                let client = mt5_client(&connection)?;
                let resp = call(client, request).await?.into_inner();
                Ok(serde_json::from_str(&resp.json_data)?)
            }
        })
        .await
    }

    /// Calls an RPC returning `DictList{json_items}`, decoding each element.
    async fn call_dict_list<Req, Fut>(
        &self,
        operation: &str,
        request: Req,
        call: impl Fn(Mt5ServiceClient<Channel>, Req) -> Fut + Send + Sync + 'static,
    ) -> Result<Vec<Value>, BridgeError>
    where
        Req: Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<tonic::Response<crate::proto::mt5::DictList>, tonic::Status>>
            + Send
            + 'static,
    {
        let connection = self.connection.clone();
        let call = Arc::new(call);
        self.resilient_call(operation, None, move || {
            let connection = connection.clone();
            let request = request.clone();
            let call = call.clone();
            async move {
                let client = mt5_client(&connection)?;
                let resp = call(client, request).await?.into_inner();
                resp.json_items
                    .iter()
                    .map(|item| serde_json::from_str(item).map_err(BridgeError::from))
                    .collect()
            }
        })
        .await
    }
}

fn mt5_client(connection: &ConnectionManager) -> Result<Mt5ServiceClient<Channel>, BridgeError> {
    let channel = connection.channel()?;
    Ok(Mt5ServiceClient::new(channel))
}

fn history_request(
    date_from: i64,
    date_to: i64,
    group: Option<String>,
    ticket: Option<i64>,
    position: Option<i64>,
) -> HistoryRequest {
    HistoryRequest {
        date_from,
        date_to,
        group,
        ticket,
        position,
    }
}

/// Crash-recovery pass (§4.6): run once on connect, before the orchestrator
/// is built, so no order submitted after this point can ever race an
/// in-progress recovery. For every WAL entry left PENDING or SENT by a
/// prior process, scans history for a deal carrying its request id; found
/// entries are marked RECOVERED, unmatched ones FAILED with a
/// "recovered-not-found" cause for the caller's business logic to act on.
async fn recover_wal(
    connection: &ConnectionManager,
    config: &Config,
    wal: &Wal,
) -> Result<(), BridgeError> {
    for entry in wal.get_incomplete().await? {
        match verify_order(connection, config, &entry.request_id).await {
            Ok(Some(found)) => {
                wal.mark_recovered(&entry.request_id, Some(found.retcode)).await?;
                tracing::warn!(
                    request_id = %entry.request_id,
                    retcode = found.retcode,
                    "recovered order found executed in terminal history on startup"
                );
            }
            Ok(None) => {
                wal.mark_failed(&entry.request_id, None).await?;
                tracing::warn!(
                    request_id = %entry.request_id,
                    "recovered-not-found: no matching deal in recovery search window"
                );
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %entry.request_id,
                    error = %err,
                    "WAL recovery scan failed, leaving entry for a later retry"
                );
            }
        }
    }
    Ok(())
}

/// Verify-before-retry support (§4.7): scans recent deal history for a deal
/// whose comment carries `request_id`, within the configured recovery
/// search window.
async fn verify_order(
    connection: &ConnectionManager,
    config: &Config,
    request_id: &str,
) -> Result<Option<OrderResult>, BridgeError> {
    let date_to = Utc::now().timestamp();
    let date_from = date_to - config.recovery_search_window_seconds;
    let mut client = mt5_client(connection)?;
    let resp = execute_with_timeout(config.call_timeout, async {
        Ok(client
            .history_deals_get(HistoryRequest {
                date_from,
                date_to,
                group: None,
                ticket: None,
                position: None,
            })
            .await?
            .into_inner())
    })
    .await?;

    for item in resp.json_items {
        let value: Value = serde_json::from_str(&item)?;
        let comment = value.get("comment").and_then(|v| v.as_str()).unwrap_or("");
        if crate::request_id::extract_request_id(comment) == Some(request_id) {
            let retcode = value
                .get("retcode")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32)
                .unwrap_or(10009);
            return Ok(Some(OrderResult {
                retcode,
                payload: value,
            }));
        }
    }
    Ok(None)
}
