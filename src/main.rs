mod answer;
mod docs;
mod error;
mod llm;
mod matcher;
mod orchestrator;
mod state;
#[cfg(test)]
mod test_support;

use tracing::{debug, info, Level};

use llm::LlmClient;
use state::{AppState, QaConfig};

const USAGE: &str = "usage: docqa <document-source> <question> [<question> ...]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load env
    let _ = dotenv::dotenv();
    let level = llm::parse_var("LOG_LEVEL", Level::INFO)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((source, questions)) = args.split_first().filter(|(_, qs)| !qs.is_empty()) else {
        anyhow::bail!(USAGE);
    };

    let config = QaConfig::from_env()?;
    debug!(?config, "Configuration loaded");

    let llm_client = LlmClient::from_env()?;
    info!(model = llm_client.model(), "LLM client initialized");

    let state = AppState::init(config, llm_client).await?;
    info!(
        source = %source,
        questions = questions.len(),
        strategy = ?state.config.strategy,
        model = state.llm.model(),
        "Answering questions"
    );

    let answers = state.orchestrator.answer_batch(source, questions).await;
    state.orchestrator.shutdown().await;
    let answers = answers?;
    let out = serde_json::json!({ "answers": answers });
    println!("{}", serde_json::to_string_pretty(&out)?);

    Ok(())
}
