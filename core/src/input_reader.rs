//! Line-buffered stdin reader feeding the inbound queue.

use async_channel::Sender;
use goagent_protocol::InputEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawn the reader task. Exit words (case-insensitive) shut the runtime
/// down, `cancel` raises a cancel event, anything else non-empty becomes a
/// prompt, and EOF shuts down with "stdin closed".
pub(crate) fn spawn(tx: Sender<InputEvent>, exit_words: Vec<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if exit_words.iter().any(|w| w.eq_ignore_ascii_case(trimmed)) {
                        let _ = tx
                            .send(InputEvent::Shutdown {
                                reason: "user exit".to_string(),
                            })
                            .await;
                        break;
                    }
                    if trimmed.eq_ignore_ascii_case("cancel") {
                        let _ = tx
                            .send(InputEvent::Cancel {
                                reason: "operator".to_string(),
                            })
                            .await;
                        continue;
                    }
                    if tx
                        .send(InputEvent::Prompt {
                            prompt: trimmed.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx
                        .send(InputEvent::Shutdown {
                            reason: "stdin closed".to_string(),
                        })
                        .await;
                    break;
                }
                Err(err) => {
                    warn!("stdin read failed: {err}");
                    let _ = tx
                        .send(InputEvent::Shutdown {
                            reason: format!("stdin error: {err}"),
                        })
                        .await;
                    break;
                }
            }
        }
    })
}
