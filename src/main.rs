use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use oraclefx::config::{now_ts, Config};
use oraclefx::controller::{spawn_heartbeat, Controller};
use oraclefx::features::IdentityBank;
use oraclefx::ledger::{InMemoryLedger, Ledger};
use oraclefx::logging::{json_log, obj, v_num, v_str};
use oraclefx::source::http::HttpSource;
use oraclefx::source::{CachedSource, MarketSource, RetryPolicy, StaticSource};
use oraclefx::storage::AuditStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Live feeds need an API key; otherwise run the deterministic paper
    // feeds.
    let live_feeds = cfg.feed_api_key.is_some();
    let client = reqwest::Client::new();
    let sources: Vec<Arc<CachedSource>> = cfg
        .sources
        .iter()
        .map(|id| {
            let inner: Box<dyn MarketSource> = if live_feeds {
                Box::new(HttpSource::new(
                    id,
                    &cfg.feed_base,
                    cfg.feed_api_key.clone(),
                    client.clone(),
                ))
            } else {
                Box::new(StaticSource::new(
                    id,
                    &[("price", 105.0), ("sma", 100.0), ("volume", 110.0)],
                ))
            };
            Arc::new(CachedSource::new(
                inner,
                cfg.source_ttl_secs,
                Duration::from_millis(cfg.source_timeout_ms),
                RetryPolicy { max_retries: cfg.source_retries, base_delay_ms: 100 },
            ))
        })
        .collect();
    json_log(
        "adapter",
        obj(&[
            ("type", v_str(if live_feeds { "http" } else { "static" })),
            ("status", v_str(if live_feeds { "live" } else { "paper" })),
            ("sources", v_num(sources.len() as f64)),
        ]),
    );

    let mut balances = BTreeMap::new();
    balances.insert(cfg.token_in.clone(), 10_000.0);
    let ledger = Arc::new(InMemoryLedger::new(
        &cfg.caller_address,
        balances,
        cfg.risk_limits(),
        cfg.guard_cooldown_secs,
    ));

    let mut store = AuditStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let heartbeat = spawn_heartbeat(
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        cfg.heartbeat_secs,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    json_log(
        "main",
        obj(&[
            ("event", v_str("started")),
            ("poll_interval_secs", v_num(cfg.poll_interval_secs as f64)),
        ]),
    );

    let mut controller = Controller::new(
        cfg,
        sources,
        Box::new(IdentityBank),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        Some(store),
    );
    let result = controller.run(shutdown_rx).await;

    heartbeat.abort();

    // Flush the guard's event log before exit.
    let events = ledger.events();
    if !events.is_empty() {
        let mut store = AuditStore::new(&Config::from_env().sqlite_path)?;
        store.init()?;
        store.append_events(&events)?;
        json_log(
            "main",
            obj(&[("event", v_str("events_flushed")), ("count", v_num(events.len() as f64))]),
        );
    }
    json_log("main", obj(&[("event", v_str("stopped")), ("ts", v_num(now_ts() as f64))]));
    result
}
