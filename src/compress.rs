//! Conversation compression.
//!
//! Every third iteration, an agent whose history has grown past the window
//! gets its older turns replaced by a short model-written summary. The most
//! recent [`WINDOW_SIZE`] messages always survive verbatim.

use std::future::Future;

use crate::agents::AgentDescriptor;
use crate::llm::ChatMessage;
use crate::stream::AgentResponse;
use crate::util::truncate_chars;

/// Number of trailing messages kept verbatim.
pub const WINDOW_SIZE: usize = 4;

/// Characters of each old message included in the digest.
const DIGEST_CHARS_PER_MESSAGE: usize = 500;

/// Whether the history should be compressed on this iteration.
pub fn should_compress(iteration: u32, message_count: usize) -> bool {
    iteration > 0 && iteration % 3 == 0 && message_count > WINDOW_SIZE + 1
}

/// Replace all but the last [`WINDOW_SIZE`] messages with one summary.
///
/// `summarize` receives a synthetic summarizer descriptor and a single user
/// message. Its failure is absorbed: the old turns are then replaced by a
/// message restating the objective. This function never fails.
pub async fn compress_context<F, Fut, E>(
    messages: Vec<ChatMessage>,
    objective: &str,
    summarize: F,
) -> Vec<ChatMessage>
where
    F: FnOnce(AgentDescriptor, Vec<ChatMessage>) -> Fut,
    Fut: Future<Output = Result<AgentResponse, E>>,
    E: std::fmt::Display,
{
    if messages.len() <= WINDOW_SIZE + 1 {
        return messages;
    }

    let mut old = messages;
    let recent = old.split_off(old.len() - WINDOW_SIZE);

    let digest = old
        .iter()
        .map(|m| {
            format!(
                "[{}]: {}",
                m.role,
                truncate_chars(&m.text(), DIGEST_CHARS_PER_MESSAGE)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let request = ChatMessage::user(format!(
        "Objective: {}\n\nWork history:\n{}\n\n\
         Summarize the progress and key findings above in 2-3 sentences. \
         Respond with JSON: {{\"output\": \"<summary>\"}}",
        objective, digest
    ));

    let head = match summarize(AgentDescriptor::summarizer(), vec![request]).await {
        Ok(response) => {
            let summary = Some(response.output_text())
                .filter(|s| !s.trim().is_empty())
                .or_else(|| response.thinking.clone().filter(|s| !s.trim().is_empty()));
            match summary {
                Some(summary) => ChatMessage::user(format!(
                    "Context summary of your work so far: {}\n\nContinue from where you left off.",
                    summary.trim()
                )),
                None => {
                    tracing::warn!("Summarizer returned no text, using fallback context");
                    fallback_message(objective)
                }
            }
        }
        Err(e) => {
            tracing::warn!("Context summarization failed, using fallback: {}", e);
            fallback_message(objective)
        }
    };

    tracing::debug!(dropped = old.len(), kept = recent.len(), "Compressed context");

    let mut compressed = Vec::with_capacity(recent.len() + 1);
    compressed.push(head);
    compressed.extend(recent);
    compressed
}

fn fallback_message(objective: &str) -> ChatMessage {
    ChatMessage::user(format!(
        "Earlier context was condensed. Your objective: {}\n\nContinue working toward it.",
        objective
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, Role};
    use std::sync::{Arc, Mutex};

    fn history(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("user turn {}", i))
                } else {
                    ChatMessage::assistant(format!("assistant turn {}", i))
                }
            })
            .collect()
    }

    fn summary(text: &str) -> AgentResponse {
        serde_json::from_value(serde_json::json!({ "output": text })).unwrap()
    }

    #[test]
    fn compression_schedule() {
        assert!(should_compress(3, 6));
        assert!(!should_compress(3, 5));
        assert!(!should_compress(2, 100));
        assert!(!should_compress(0, 100));
        assert!(should_compress(6, 7));
    }

    #[tokio::test]
    async fn short_history_is_untouched() {
        let messages = history(WINDOW_SIZE + 1);
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let out = compress_context(messages.clone(), "obj", |_, _| async move {
            *flag.lock().unwrap() = true;
            Ok::<_, LlmError>(summary("never"))
        })
        .await;
        assert_eq!(out, messages);
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn keeps_recent_window_verbatim() {
        let messages = history(9);
        let seen = Arc::new(Mutex::new(None));
        let capture = seen.clone();

        let out = compress_context(messages.clone(), "map the coastline", |agent, msgs| async move {
            *capture.lock().unwrap() = Some((agent, msgs));
            Ok::<_, LlmError>(summary("Surveyed the north shore."))
        })
        .await;

        assert_eq!(out.len(), 1 + WINDOW_SIZE);
        assert_eq!(&out[1..], &messages[9 - WINDOW_SIZE..]);
        assert!(out[0].text().starts_with("Context summary of your work so far: Surveyed the north shore."));
        assert!(out[0].text().ends_with("Continue from where you left off."));

        let (agent, msgs) = seen.lock().unwrap().take().unwrap();
        assert_eq!(agent.name, AgentDescriptor::summarizer().name);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::User);
        let prompt = msgs[0].text();
        assert!(prompt.contains("map the coastline"));
        assert!(prompt.contains("[user]: user turn 0"));
        assert!(prompt.contains("[assistant]: assistant turn 3"));
        assert!(!prompt.contains("user turn 8"));
    }

    #[tokio::test]
    async fn digest_truncates_long_messages() {
        let mut messages = history(6);
        messages[0] = ChatMessage::user("x".repeat(2000));
        let seen = Arc::new(Mutex::new(String::new()));
        let capture = seen.clone();

        compress_context(messages, "obj", |_, msgs| async move {
            *capture.lock().unwrap() = msgs[0].text();
            Ok::<_, LlmError>(summary("done"))
        })
        .await;

        let prompt = seen.lock().unwrap().clone();
        assert!(prompt.contains(&"x".repeat(500)));
        assert!(!prompt.contains(&"x".repeat(501)));
    }

    #[tokio::test]
    async fn falls_back_to_thinking_field() {
        let response: AgentResponse =
            serde_json::from_value(serde_json::json!({ "thinking": "Reasoned about it." })).unwrap();
        let out = compress_context(history(7), "obj", |_, _| async move {
            Ok::<_, LlmError>(response)
        })
        .await;
        assert!(out[0].text().contains("Reasoned about it."));
    }

    #[tokio::test]
    async fn summarizer_failure_restates_objective() {
        let messages = history(8);
        let out = compress_context(messages.clone(), "catalogue the moths", |_, _| async {
            Err::<AgentResponse, _>(LlmError::server_error(500, "boom"))
        })
        .await;

        assert_eq!(out.len(), 1 + WINDOW_SIZE);
        assert!(out[0].text().contains("catalogue the moths"));
        assert_eq!(&out[1..], &messages[8 - WINDOW_SIZE..]);
    }
}
