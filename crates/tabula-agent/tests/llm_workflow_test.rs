//! Full workflow through `LlmInference` with a canned chat client

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use tabula_agent::{LLMChatClient, LLMChatCompletion, LlmInference};
use tabula_core::{DatasetSchema, Phase, Settings, SqliteExecutor, TerminatedReason, WorkflowOrchestrator};

/// Replies according to which stage's system prompt it receives
#[derive(Debug)]
struct TrackingMockLLM {
    guardrail_reply: String,
    call_count: AtomicUsize,
    user_prompts: Mutex<Vec<String>>,
}

impl TrackingMockLLM {
    fn new(guardrail_reply: &str) -> Self {
        Self {
            guardrail_reply: guardrail_reply.to_string(),
            call_count: AtomicUsize::new(0),
            user_prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LLMChatClient for TrackingMockLLM {
    fn name(&self) -> &str {
        "tracking-mock"
    }

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LLMChatCompletion> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.user_prompts.lock().unwrap().push(user_prompt.to_string());

        let content = if system_prompt.starts_with("You screen questions") {
            self.guardrail_reply.clone()
        } else if system_prompt.starts_with("You plan how") {
            r#"Here is the plan:
```json
{
  "intent": "rank product categories by revenue",
  "instructions": "Add up revenue for every product category and order categories from highest to lowest",
  "output_requirements": ["category", "revenue"],
  "sort_preference": "highest revenue first",
  "limit_preference": null,
  "assumptions": ["revenue means quantity times unit price"],
  "complexity": "medium"
}
```"#
                .to_string()
        } else if system_prompt.starts_with("You write a single read-only") {
            r#"{"sql_query": "SELECT category, SUM(quantity * unit_price) AS revenue FROM order_lines GROUP BY category ORDER BY revenue DESC", "reasoning": "group and sum"}"#
                .to_string()
        } else {
            "Hardware leads with 900 in revenue, followed by Software at 400.".to_string()
        };

        Ok(LLMChatCompletion {
            llm_name: "tracking-mock".to_string(),
            content,
            token_cost: 42,
        })
    }
}

fn seed(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("orders.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE order_lines (category TEXT, quantity INTEGER, unit_price REAL);
         INSERT INTO order_lines VALUES ('Hardware', 3, 300.0), ('Software', 4, 100.0);",
    )
    .unwrap();
    path
}

fn orchestrator(path: &std::path::Path, client: Arc<TrackingMockLLM>) -> WorkflowOrchestrator {
    let mut settings = Settings::default();
    settings.database.path = path.to_path_buf();
    settings.database.domain = "online store orders".to_string();

    let schema = DatasetSchema::from_settings(&settings.database).unwrap();
    let executor = Arc::new(SqliteExecutor::from_settings(&settings.database, &settings.workflow));
    let inference = Arc::new(LlmInference::new(client, Duration::from_secs(5)));
    WorkflowOrchestrator::from_capabilities(&settings, inference, executor, &schema)
}

#[tokio::test]
async fn test_llm_backed_workflow_answers() {
    let dir = TempDir::new().unwrap();
    let path = seed(&dir);
    let client = Arc::new(TrackingMockLLM::new(
        r#"{"decision": "allow", "category": "on_topic", "reasoning": "revenue question"}"#,
    ));

    let details = orchestrator(&path, client.clone())
        .ask_with_details("Which product categories bring in the most revenue?")
        .await;

    assert_eq!(details.phase, Phase::Done);
    assert_eq!(
        details.response,
        "Hardware leads with 900 in revenue, followed by Software at 400."
    );
    assert_eq!(details.row_count, Some(2));
    assert_eq!(client.call_count.load(Ordering::SeqCst), 4);

    let plan = details.plan.unwrap();
    assert_eq!(plan.limit_preference, None);
    assert_eq!(plan.output_requirements, vec!["category", "revenue"]);
}

#[tokio::test]
async fn test_llm_block_verdict_stops_early() {
    let dir = TempDir::new().unwrap();
    let path = seed(&dir);
    let client = Arc::new(TrackingMockLLM::new(
        r#"{"decision": "block", "category": "off_topic", "reasoning": "weather is not in the data"}"#,
    ));

    let details = orchestrator(&path, client.clone())
        .ask_with_details("Will it rain tomorrow?")
        .await;

    assert_eq!(details.terminated_reason, Some(TerminatedReason::Blocked));
    assert!(details.response.contains("online store orders"));
    assert_eq!(client.call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unparseable_guardrail_reply_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = seed(&dir);
    let client = Arc::new(TrackingMockLLM::new("Sure, that sounds fine to me."));

    let details = orchestrator(&path, client)
        .ask_with_details("Top categories?")
        .await;

    assert_eq!(details.terminated_reason, Some(TerminatedReason::FatalError));
    assert_eq!(details.failure_kind.as_deref(), Some("inference"));
}
