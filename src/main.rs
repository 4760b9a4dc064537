//! Node entry point: configuration, wiring and lifecycle.

use anyhow::{anyhow, Context, Result};
use sentio::chain::contract::{OracleContractConfig, SentimentOracle};
use sentio::chain::rpc::EthRpc;
use sentio::chain::signer::{LocalSigner, RemoteSigner, TxSigner};
use sentio::chain::sim_rpc::SimRpc;
use sentio::chain::submitter::{Submitter, SubmitterConfig};
use sentio::chain::HttpRpc;
use sentio::config::{NodeConfig, SourceConfig};
use sentio::metrics::PipelineMetrics;
use sentio::pipeline::collectors::{
    ChatCollector, ChatWire, Collector, MicroblogCollector, NewsCollector, SimCollector,
};
use sentio::pipeline::dedup::Deduplicator;
use sentio::pipeline::manipulation::ManipulationDetector;
use sentio::pipeline::orchestrator::Orchestrator;
use sentio::pipeline::rate_limit::SourceRateLimiter;
use sentio::pipeline::scorer::{EnsembleScorer, HttpSentimentModel, SentimentModel};
use sentio::secrets::CredentialStore;
use sentio::storage::OracleStore;
use sentio::types::SourceKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./config.json".to_string());
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path))?;

    let level = match config.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    info!("starting sentio oracle node (config: {})", config_path);

    let metrics = Arc::new(PipelineMetrics::new());
    let store = Arc::new(OracleStore::open(&config.storage.db_path).await?);

    let credentials = match &config.secrets_path {
        Some(path) => CredentialStore::load(path)?,
        None => CredentialStore::empty(),
    };

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build http client")?;

    let signer = build_signer(&config, &credentials, &http_client).await?;
    info!("submitting as {:?}", signer.address());

    // Chain access: a live JSON-RPC endpoint set, or the in-process chain.
    let contract_address = config.chain.contract_address()?;
    let rpc: Arc<dyn EthRpc> = if config.chain.mode == "simulated" {
        info!("running against the simulated chain");
        Arc::new(SimRpc::new(
            config.chain.chain_id,
            contract_address,
            SentimentOracle::new(signer.address(), OracleContractConfig::default()),
        ))
    } else {
        Arc::new(HttpRpc::new(
            http_client.clone(),
            config.chain.rpc_endpoints.clone(),
            Duration::from_secs(config.chain.rpc_timeout_s),
        ))
    };

    let chain_id = rpc
        .chain_id()
        .await
        .map_err(|e| anyhow!("chain unreachable at startup: {}", e))?;
    if chain_id != config.chain.chain_id {
        return Err(anyhow!(
            "chain id mismatch: configured {}, endpoint reports {}",
            config.chain.chain_id,
            chain_id
        ));
    }

    let submitter = Arc::new(Submitter::new(
        rpc,
        signer,
        SubmitterConfig::from_chain_config(&config.chain, contract_address),
        Some(store.clone()),
        metrics.clone(),
    ));
    // Settle anything a previous run left in flight.
    if let Err(e) = submitter.reconcile(chrono::Utc::now().timestamp()).await {
        warn!("startup reconciliation failed: {}", e);
    }

    let dedup = Arc::new(
        Deduplicator::with_journal(
            config.dedup.capacity,
            config.dedup.horizon_s,
            store.clone(),
            chrono::Utc::now().timestamp(),
        )
        .await?,
    );

    let primary: Option<Arc<dyn SentimentModel>> = config.scorer.primary_url.as_ref().map(|url| {
        Arc::new(HttpSentimentModel::new(
            http_client.clone(),
            url.clone(),
            Duration::from_secs(config.scorer.primary_timeout_s),
        )) as Arc<dyn SentimentModel>
    });
    if primary.is_none() {
        warn!("no primary model configured; scoring runs on the lexicon fallback only");
    }
    let scorer = Arc::new(EnsembleScorer::new(
        primary,
        config.scorer.primary_weight,
        config.scorer.degraded_confidence_factor,
        metrics.clone(),
    ));

    let collectors = build_collectors(&config.sources, &http_client, &credentials);
    if collectors.is_empty() {
        return Err(anyhow!("no collectors configured"));
    }

    let registry = config.asset_registry();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for cohort in &config.cohorts {
        let orchestrator = Orchestrator::new(
            cohort.clone(),
            config.cycle.clone(),
            collectors.clone(),
            dedup.clone(),
            scorer.clone(),
            ManipulationDetector::new(config.manipulation.clone()),
            submitter.clone(),
            registry.clone(),
            metrics.clone(),
        );
        tasks.push(tokio::spawn(orchestrator.run(shutdown_rx.clone())));
    }
    info!("{} cohort orchestrators running", tasks.len());

    // SIGHUP re-reads credentials; ctrl-c drains and exits.
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading credentials");
                if let Err(e) = credentials.reload().await {
                    warn!("credential reload failed: {}", e);
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    let now = chrono::Utc::now().timestamp();
    dedup.prune_journal(now).await.ok();
    store.prune_txs(now - 7 * 86_400).await.ok();
    info!(
        "final metrics: {}",
        serde_json::to_string(&metrics.snapshot()).unwrap_or_default()
    );
    Ok(())
}

async fn build_signer(
    config: &NodeConfig,
    credentials: &Arc<CredentialStore>,
    http_client: &reqwest::Client,
) -> Result<Arc<dyn TxSigner>> {
    match config.signer.kind.as_str() {
        "remote" => {
            let url = config
                .signer
                .remote_url
                .clone()
                .ok_or_else(|| anyhow!("remote signer requires signer.remote_url"))?;
            let key_id = config
                .signer
                .remote_key_id
                .clone()
                .ok_or_else(|| anyhow!("remote signer requires signer.remote_key_id"))?;
            let token = credentials.get(&config.signer.remote_token_secret).await;
            // The service owns the key; the key id doubles as the operator
            // address it signs for.
            let address = key_id
                .parse()
                .map_err(|_| anyhow!("signer.remote_key_id must be the operator address"))?;
            Ok(Arc::new(RemoteSigner::new(
                http_client.clone(),
                url,
                key_id,
                token,
                address,
                Duration::from_secs(10),
            )))
        }
        _ => {
            let key = credentials
                .get(&config.signer.key_secret)
                .await
                .ok_or_else(|| {
                    anyhow!(
                        "secret {} not found for the local signer",
                        config.signer.key_secret
                    )
                })?;
            Ok(Arc::new(LocalSigner::from_hex_key(&key)?))
        }
    }
}

fn build_collectors(
    sources: &[SourceConfig],
    http_client: &reqwest::Client,
    credentials: &Arc<CredentialStore>,
) -> Vec<Arc<dyn Collector>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
    for source in sources {
        let rate_limiter = Arc::new(SourceRateLimiter::new(
            source.rate_tokens,
            source.rate_refill_s,
        ));
        let collector: Arc<dyn Collector> = match source.kind {
            SourceKind::News => Arc::new(NewsCollector::new(
                source.name.clone(),
                http_client.clone(),
                source.base_url.clone(),
                credentials.clone(),
                rate_limiter,
                source.max_items,
            )),
            SourceKind::Microblog => Arc::new(MicroblogCollector::new(
                source.name.clone(),
                http_client.clone(),
                source.base_url.clone(),
                credentials.clone(),
                rate_limiter,
                source.max_items,
            )),
            SourceKind::ChatA => Arc::new(ChatCollector::new(
                source.name.clone(),
                ChatWire::A,
                http_client.clone(),
                source.base_url.clone(),
                credentials.clone(),
                rate_limiter,
                source.max_items,
            )),
            SourceKind::ChatB => Arc::new(ChatCollector::new(
                source.name.clone(),
                ChatWire::B,
                http_client.clone(),
                source.base_url.clone(),
                credentials.clone(),
                rate_limiter,
                source.max_items,
            )),
            SourceKind::Simulated => Arc::new(SimCollector::new(
                source.name.clone(),
                100,
                0.2,
                source.max_items,
            )),
        };
        collectors.push(collector);
    }
    collectors
}
