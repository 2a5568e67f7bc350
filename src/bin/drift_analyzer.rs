//! Binary entry point for the offline Drift Pre-Analyzer (spec §4.13).
//! Run once per ingest batch, outside the query path. Analyzes every
//! expert's queue unless `--expert <id>` narrows it to one.

use std::sync::Arc;

use expert_panel::config::AppConfig;
use expert_panel::drift_analyzer::{run_drift_analysis, AnalyzerContext};
use expert_panel::llm::Gateway;
use expert_panel::store::{self, experts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::default();
    config.validate().map_err(anyhow::Error::msg)?;

    let pool = store::init_db(&config.database_url).await?;
    let gateway: Arc<dyn expert_panel::llm::LlmGateway> = Arc::new(Gateway::new(config.clone()));
    let ctx = AnalyzerContext { gateway, pool: pool.clone(), config };

    let expert_filter = std::env::args().skip_while(|a| a != "--expert").nth(1);

    let target_experts = match expert_filter {
        Some(id) => vec![experts::get_expert(&pool, &id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown expert id '{id}'"))?],
        None => experts::list_experts(&pool).await?,
    };

    for expert in target_experts {
        match run_drift_analysis(&ctx, &expert.id).await {
            Ok(count) => tracing::info!(expert_id = %expert.id, analyzed = count, "Drift-Analyzer: pass complete"),
            Err(err) => tracing::error!(expert_id = %expert.id, error = %err, "Drift-Analyzer: pass failed"),
        }
    }

    Ok(())
}
