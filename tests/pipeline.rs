//! End-to-end graph runs against scripted providers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use deepqa_rs::AgentError;
use deepqa_rs::agent::{
    AnswerPacket, ChatMessage, DeepSearchAgent, GraphConfig, LlmProvider, QueryRequest,
    RetrievalProvider, TokenStream,
};
use deepqa_rs::context::Section;

const EXTRACTION_JSON: &str = r#"{
    "entities": [{"entity_name": "Pruner", "entity_type": "component"}],
    "relationships": [],
    "terms": [{"term_name": "token budget", "term_type": "concept", "term_similar_to": []}]
}"#;

fn prompt_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}

fn pieces(parts: &[&str]) -> TokenStream {
    let owned: Vec<Result<String, AgentError>> =
        parts.iter().map(|p| Ok((*p).to_string())).collect();
    Box::pin(futures_util::stream::iter(owned))
}

/// Generation-side model: decomposition and answer synthesis.
struct PrimaryLlm;

#[async_trait]
impl LlmProvider for PrimaryLlm {
    fn name(&self) -> &'static str {
        "primary-mock"
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String, AgentError> {
        let prompt = prompt_text(messages);
        if prompt.contains("Decompose the question") {
            Ok("What is the budget?\nHow are sections cut?".to_string())
        } else if prompt.contains("propose at most") {
            Ok("What does the refinement round add?".to_string())
        } else {
            Err(AgentError::Provider {
                message: format!("unexpected invoke: {}", &prompt[..40.min(prompt.len())]),
            })
        }
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AgentError> {
        let prompt = prompt_text(messages);
        if prompt.contains("Answer the sub-question") {
            Ok(pieces(&["sub ", "answer"]))
        } else if prompt.contains("Improve the initial answer") {
            Ok(pieces(&["refined ", "answer"]))
        } else {
            Ok(pieces(&["initial ", "answer"]))
        }
    }
}

/// Verification-side model; `quality_ok` scripts the answer quality gate.
struct FastLlm {
    quality_ok: bool,
}

#[async_trait]
impl LlmProvider for FastLlm {
    fn name(&self) -> &'static str {
        "fast-mock"
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String, AgentError> {
        let prompt = prompt_text(messages);
        if prompt.contains("fully address") {
            Ok(if self.quality_ok { "yes" } else { "no" }.to_string())
        } else if prompt.contains("Extract the important entities") {
            Ok(EXTRACTION_JSON.to_string())
        } else if prompt.contains("Summarize the conversation") {
            Ok("summary of earlier turns".to_string())
        } else {
            // Relevance verification and the sub-answer self-check.
            Ok("yes".to_string())
        }
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream, AgentError> {
        Ok(pieces(&[]))
    }
}

/// Index mock returning distinct documents per search call.
struct CountingRetrieval {
    searches: AtomicUsize,
}

impl CountingRetrieval {
    fn new() -> Self {
        Self {
            searches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RetrievalProvider for CountingRetrieval {
    fn name(&self) -> &'static str {
        "counting-mock"
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Section>, AgentError> {
        let call = self.searches.fetch_add(1, Ordering::SeqCst);
        Ok((0..3.min(limit))
            .map(|i| {
                let mut section =
                    Section::new(format!("doc-{call}-{i}"), 0, format!("content {call} {i}"));
                section.score = Some(1.0 - 0.1 * i as f64);
                section
            })
            .collect())
    }

    async fn rerank(
        &self,
        _query: &str,
        mut sections: Vec<Section>,
        num_rerank: usize,
    ) -> Result<Vec<Section>, AgentError> {
        sections.truncate(num_rerank);
        Ok(sections)
    }
}

struct OfflineRetrieval;

#[async_trait]
impl RetrievalProvider for OfflineRetrieval {
    fn name(&self) -> &'static str {
        "offline-mock"
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Section>, AgentError> {
        Err(AgentError::Retrieval {
            message: "index offline".to_string(),
        })
    }

    async fn rerank(
        &self,
        _query: &str,
        sections: Vec<Section>,
        _num_rerank: usize,
    ) -> Result<Vec<Section>, AgentError> {
        Ok(sections)
    }
}

fn agent(quality_ok: bool, retrieval: Arc<dyn RetrievalProvider>) -> DeepSearchAgent {
    let config = GraphConfig::builder()
        .max_sub_questions(2)
        .timeout(Duration::from_secs(5))
        .max_retries(0)
        .build();
    DeepSearchAgent::new(
        Arc::new(PrimaryLlm),
        Arc::new(FastLlm { quality_ok }),
        retrieval,
        config,
    )
}

async fn collect(agent: &DeepSearchAgent, question: &str) -> Vec<AnswerPacket> {
    let mut stream = agent.run(QueryRequest::new(question));
    let mut packets = Vec::new();
    while let Some(packet) = stream.next().await {
        packets.push(packet);
    }
    packets
}

fn answer_text(packets: &[AnswerPacket], want_level: u32) -> String {
    packets
        .iter()
        .filter_map(|p| match p {
            AnswerPacket::AnswerPiece {
                answer_piece,
                level,
                level_question_num,
            } if *level == want_level && *level_question_num == 0 => Some(answer_piece.clone()),
            _ => None,
        })
        .collect()
}

fn tool_ids(packets: &[AnswerPacket]) -> Vec<String> {
    packets
        .iter()
        .filter_map(|p| match p {
            AnswerPacket::ToolResponse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn good_initial_answer_skips_refinement() {
    let agent = agent(true, Arc::new(CountingRetrieval::new()));
    let packets = collect(&agent, "How does pruning work?").await;

    let sub_questions: Vec<&AnswerPacket> = packets
        .iter()
        .filter(|p| matches!(p, AnswerPacket::SubQuestionPiece { level: 0, .. }))
        .collect();
    assert_eq!(sub_questions.len(), 2);

    assert_eq!(answer_text(&packets, 0), "initial answer");
    assert!(answer_text(&packets, 1).is_empty());

    let ids = tool_ids(&packets);
    assert!(ids.contains(&"search_response_summary".to_string()));
    assert!(ids.contains(&"agent_metrics".to_string()));
    assert!(!ids.contains(&"refined_response_summary".to_string()));

    assert_eq!(packets.last(), Some(&AnswerPacket::StreamStop { level: 0 }));
    assert!(
        !packets
            .iter()
            .any(|p| matches!(p, AnswerPacket::Error { .. }))
    );
}

#[tokio::test]
async fn weak_initial_answer_triggers_refinement() {
    let agent = agent(false, Arc::new(CountingRetrieval::new()));
    let packets = collect(&agent, "How does pruning work?").await;

    assert_eq!(answer_text(&packets, 0), "initial answer");
    assert_eq!(answer_text(&packets, 1), "refined answer");

    assert!(packets.iter().any(|p| matches!(
        p,
        AnswerPacket::SubQuestionPiece { level: 1, .. }
    )));

    let ids = tool_ids(&packets);
    assert!(ids.contains(&"refined_response_summary".to_string()));
    assert!(ids.contains(&"agent_metrics".to_string()));

    let stops: Vec<&AnswerPacket> = packets
        .iter()
        .filter(|p| matches!(p, AnswerPacket::StreamStop { .. }))
        .collect();
    assert_eq!(stops.len(), 2);
    assert_eq!(packets.last(), Some(&AnswerPacket::StreamStop { level: 1 }));
}

#[tokio::test]
async fn offline_index_still_streams_an_answer() {
    let agent = agent(true, Arc::new(OfflineRetrieval));
    let packets = collect(&agent, "Anything indexed?").await;

    assert_eq!(answer_text(&packets, 0), "initial answer");
    assert_eq!(packets.last(), Some(&AnswerPacket::StreamStop { level: 0 }));
    assert!(
        !packets
            .iter()
            .any(|p| matches!(p, AnswerPacket::Error { .. }))
    );
}

#[tokio::test]
async fn history_is_flattened_into_the_run() {
    let agent = agent(true, Arc::new(CountingRetrieval::new()));
    let request = QueryRequest {
        question: "Follow-up question?".to_string(),
        history: vec![
            deepqa_rs::agent::message::user_message("earlier question"),
            deepqa_rs::agent::message::assistant_message("earlier answer [D1]"),
        ],
    };
    let mut stream = agent.run(request);
    let mut packets = Vec::new();
    while let Some(packet) = stream.next().await {
        packets.push(packet);
    }
    // Short history skips summarization; the run completes normally.
    assert_eq!(answer_text(&packets, 0), "initial answer");
    assert_eq!(packets.last(), Some(&AnswerPacket::StreamStop { level: 0 }));
}

/// Main-answer stream failures surface as a terminal error packet.
struct BrokenStreamLlm;

#[async_trait]
impl LlmProvider for BrokenStreamLlm {
    fn name(&self) -> &'static str {
        "broken-mock"
    }

    async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String, AgentError> {
        // Decomposition yields nothing; the run goes straight to the
        // main answer.
        Ok(String::new())
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream, AgentError> {
        Err(AgentError::Provider {
            message: "stream rejected".to_string(),
        })
    }
}

#[tokio::test]
async fn fatal_generation_failure_ends_with_error_packet() {
    let agent = DeepSearchAgent::new(
        Arc::new(BrokenStreamLlm),
        Arc::new(FastLlm { quality_ok: true }),
        Arc::new(CountingRetrieval::new()),
        GraphConfig::builder().max_retries(0).build(),
    );
    let packets = collect(&agent, "Will this fail?").await;
    assert!(matches!(
        packets.last(),
        Some(AnswerPacket::Error { .. })
    ));
}

/// A provider whose stream open never resolves.
struct HangingStreamLlm;

#[async_trait]
impl LlmProvider for HangingStreamLlm {
    fn name(&self) -> &'static str {
        "hanging-mock"
    }

    async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String, AgentError> {
        Ok(String::new())
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream, AgentError> {
        futures_util::future::pending().await
    }
}

#[tokio::test]
async fn hung_answer_stream_times_out_with_error_packet() {
    let agent = DeepSearchAgent::new(
        Arc::new(HangingStreamLlm),
        Arc::new(FastLlm { quality_ok: true }),
        Arc::new(CountingRetrieval::new()),
        GraphConfig::builder()
            .timeout(Duration::from_millis(200))
            .max_retries(0)
            .build(),
    );
    let finished = tokio::time::timeout(Duration::from_secs(3), collect(&agent, "Hang?")).await;
    let packets = finished.unwrap_or_default();
    assert!(matches!(packets.last(), Some(AnswerPacket::Error { .. })));
}

/// An answer stream that never ends, counting emitted pieces.
struct EndlessLlm {
    produced: Arc<AtomicUsize>,
}

#[async_trait]
impl LlmProvider for EndlessLlm {
    fn name(&self) -> &'static str {
        "endless-mock"
    }

    async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String, AgentError> {
        Ok(String::new())
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream, AgentError> {
        let produced = Arc::clone(&self.produced);
        Ok(Box::pin(futures_util::stream::unfold(produced, |produced| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            produced.fetch_add(1, Ordering::SeqCst);
            Some((Ok("tick ".to_string()), produced))
        })))
    }
}

#[tokio::test]
async fn dropping_the_stream_cancels_generation() {
    let produced = Arc::new(AtomicUsize::new(0));
    let agent = DeepSearchAgent::new(
        Arc::new(EndlessLlm {
            produced: Arc::clone(&produced),
        }),
        Arc::new(FastLlm { quality_ok: true }),
        Arc::new(CountingRetrieval::new()),
        GraphConfig::builder().max_retries(0).build(),
    );

    let mut stream = agent.run(QueryRequest::new("never ends"));
    // Wait until generation is demonstrably running, then walk away.
    while produced.load(Ordering::SeqCst) < 3 {
        let _ = stream.next().await;
    }
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_drop = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // At most one in-flight piece may land after the drop.
    assert!(produced.load(Ordering::SeqCst) <= after_drop + 1);
}
