//! Retrieval-augmented chat pipeline.
//!
//! One question flows through three stages: the conversation history and
//! new input are condensed into a standalone retrieval question, the top-k
//! chunks are pulled from the index, and the answer is generated from a
//! prompt that stuffs those chunks in with their source URLs for citation.
//! Answers stream token-by-token from an Ollama-compatible `/api/chat`
//! endpoint.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::ChatConfig;
use crate::index::ChunkIndex;
use crate::models::ScoredChunk;
use crate::search::{retrieve, unique_sources};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Human,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Separator between stuffed documents in the QA prompt.
const DOCUMENT_SEPARATOR: &str = "\n\n----------\n\n";

const CONDENSE_PROMPT_TEMPLATE: &str = "\
Given the conversation history and a new input from the user, create a standalone \
question that captures the user's core intent for information retrieval.

If the new input is a simple greeting, confirmation (\"ok\", \"thanks\"), or casual \
chat that does not require retrieving documents, return it unchanged.
If it is a follow-up question, reformulate it to be self-contained, incorporating \
necessary context from the history, suitable for querying a document index.

Conversation History:
{chat_history}

New Input: {question}

Standalone question (or unchanged input if casual):";

const QA_PROMPT_TEMPLATE: &str = "\
You are a helpful AI assistant answering from an indexed document collection. \
You're having a conversation with a human user.

INSTRUCTIONS:

1) For casual conversation (greetings, thanks), respond naturally and do NOT cite \
documents or mention the context.

2) For questions about the document collection's subject matter, check whether the \
CONTEXT DOCUMENTS below contain relevant information. If they do, base your answer \
on them and add a citation formatted as [Source: URL] at the end of each sentence \
that uses a document, taking the URL from that document's SOURCE field. If they do \
not, say so clearly before answering from general knowledge. Cite only sources you \
actually use.

3) Keep answers concise for simple questions and thorough for complex ones.

Chat History:
{chat_history}

CONTEXT DOCUMENTS:
{context}

User Message: {question}

Your response:";

/// Render history as alternating `Human:`/`Assistant:` lines.
fn format_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|msg| match msg.role {
            Role::Human => format!("Human: {}", msg.content),
            Role::Assistant => format!("Assistant: {}", msg.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stuff retrieved chunks into the prompt's context block, each with the
/// source URL the model cites from.
fn build_context(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return "(no relevant documents found)".to_string();
    }
    chunks
        .iter()
        .map(|c| format!("DOCUMENT: {}\nSOURCE: {}", c.text, c.public_url))
        .collect::<Vec<_>>()
        .join(DOCUMENT_SEPARATOR)
}

fn build_qa_prompt(history: &[ChatMessage], context: &str, question: &str) -> String {
    QA_PROMPT_TEMPLATE
        .replace("{chat_history}", &format_history(history))
        .replace("{context}", context)
        .replace("{question}", question)
}

/// Condense the history plus new input into a standalone retrieval
/// question. With no history there is nothing to condense.
pub async fn condense_question(
    config: &ChatConfig,
    history: &[ChatMessage],
    question: &str,
) -> Result<String> {
    if history.is_empty() {
        return Ok(question.to_string());
    }

    let prompt = CONDENSE_PROMPT_TEMPLATE
        .replace("{chat_history}", &format_history(history))
        .replace("{question}", question);

    let response = chat_completion(config, &config.model, &prompt).await?;
    let condensed = response.trim();
    if condensed.is_empty() {
        Ok(question.to_string())
    } else {
        Ok(condensed.to_string())
    }
}

/// Everything the transport needs to stream one answer: the citation URLs
/// (known as soon as retrieval finishes) and the token stream.
pub struct AnswerStream {
    pub sources: Vec<String>,
    pub model: String,
    pub tokens: ReceiverStream<Result<String>>,
}

/// Run the full pipeline for one question.
pub async fn answer_question(
    config: &ChatConfig,
    index: &dyn ChunkIndex,
    history: &[ChatMessage],
    question: &str,
    reasoning: bool,
) -> Result<AnswerStream> {
    let condensed = condense_question(config, history, question).await?;
    let chunks = retrieve(index, &condensed, config.retrieval_k).await?;
    let sources = unique_sources(&chunks);

    let prompt = build_qa_prompt(history, &build_context(&chunks), question);
    let model = if reasoning {
        config.reasoning_model.clone()
    } else {
        config.model.clone()
    };

    let tokens = stream_chat(config, &model, &prompt).await?;
    Ok(AnswerStream {
        sources,
        model,
        tokens,
    })
}

fn ollama_url(config: &ChatConfig) -> String {
    config
        .url
        .as_deref()
        .unwrap_or("http://localhost:11434")
        .trim_end_matches('/')
        .to_string()
}

/// Non-streaming completion (used for question condensation).
async fn chat_completion(config: &ChatConfig, model: &str, prompt: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
        "stream": false,
        "options": { "temperature": 0.2 },
    });

    let resp = client
        .post(format!("{}/api/chat", ollama_url(config)))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("Ollama chat API error {}: {}", status, text);
    }

    let json: serde_json::Value = resp.json().await?;
    Ok(json
        .pointer("/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string())
}

/// Streaming completion: each NDJSON line's `message.content` is forwarded
/// as one token. The channel closes on the `done` line or on error.
async fn stream_chat(
    config: &ChatConfig,
    model: &str,
    prompt: &str,
) -> Result<ReceiverStream<Result<String>>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
        "stream": true,
        "options": { "temperature": 0.2 },
    });

    let resp = client
        .post(format!("{}/api/chat", ollama_url(config)))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("Ollama chat API error {}: {}", status, text);
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String>>(64);

    tokio::spawn(async move {
        let mut byte_stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(item) = byte_stream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(json) => {
                        if let Some(token) =
                            json.pointer("/message/content").and_then(|v| v.as_str())
                        {
                            if !token.is_empty() && tx.send(Ok(token.to_string())).await.is_err() {
                                return;
                            }
                        }
                        if json.get("done").and_then(|v| v.as_bool()) == Some(true) {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        }
    });

    Ok(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, url: &str) -> ScoredChunk {
        ScoredChunk {
            text: text.to_string(),
            source_key: "k".to_string(),
            public_url: url.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn context_carries_source_lines() {
        let context = build_context(&[
            chunk("first body", "https://a"),
            chunk("second body", "https://b"),
        ]);
        assert!(context.contains("DOCUMENT: first body\nSOURCE: https://a"));
        assert!(context.contains(DOCUMENT_SEPARATOR));
        assert!(context.contains("SOURCE: https://b"));
    }

    #[test]
    fn empty_retrieval_notes_missing_documents() {
        assert!(build_context(&[]).contains("no relevant documents"));
    }

    #[test]
    fn history_renders_role_prefixes() {
        let history = vec![
            ChatMessage {
                role: Role::Human,
                content: "hi".to_string(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "hello".to_string(),
            },
        ];
        assert_eq!(format_history(&history), "Human: hi\nAssistant: hello");
    }

    #[test]
    fn qa_prompt_substitutes_all_slots() {
        let prompt = build_qa_prompt(&[], "CTX", "what is this?");
        assert!(prompt.contains("CONTEXT DOCUMENTS:\nCTX"));
        assert!(prompt.contains("User Message: what is this?"));
        assert!(!prompt.contains("{question}"));
        assert!(!prompt.contains("{context}"));
    }

    #[tokio::test]
    async fn condense_without_history_is_identity() {
        let config = ChatConfig::default();
        let out = condense_question(&config, &[], "plain question")
            .await
            .unwrap();
        assert_eq!(out, "plain question");
    }
}
