use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::io::BufRead;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

const LINE_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Selected(usize),
    TimedOut,
}

/// Human decision point used by startup reconciliation.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Blocks until one of `options` is chosen; returns its index.
    async fn ask_choice(&self, context: &str, options: &[&str]) -> Result<usize>;

    async fn ask_with_timeout(
        &self,
        context: &str,
        options: &[&str],
        timeout: Duration,
    ) -> Result<PromptAnswer> {
        match tokio::time::timeout(timeout, self.ask_choice(context, options)).await {
            Ok(choice) => choice.map(PromptAnswer::Selected),
            Err(_) => Ok(PromptAnswer::TimedOut),
        }
    }
}

/// Prompt on the controlling terminal. Options are numbered from 1.
///
/// Input lines come from one reader that lives as long as the prompt, so a
/// timed-out question abandons only the wait and the next line typed still
/// answers the next question.
pub struct ConsolePrompt {
    lines: Mutex<mpsc::Receiver<String>>,
}

impl ConsolePrompt {
    /// Reads stdin on a detached thread; a pending read never holds up shutdown.
    pub fn stdin() -> Self {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        Self::from_lines(rx)
    }

    /// Must be called inside a tokio runtime.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Self::from_lines(rx)
    }

    fn from_lines(rx: mpsc::Receiver<String>) -> Self {
        Self {
            lines: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl OperatorPrompt for ConsolePrompt {
    async fn ask_choice(&self, context: &str, options: &[&str]) -> Result<usize> {
        if options.is_empty() {
            return Err(anyhow!("no options to choose from"));
        }
        let mut menu = format!("\n{}\n", context);
        for (i, option) in options.iter().enumerate() {
            menu.push_str(&format!("  {}) {}\n", i + 1, option));
        }
        menu.push_str(&format!("Select [1-{}]: ", options.len()));

        let mut stdout = tokio::io::stdout();
        let mut lines = self.lines.lock().await;
        loop {
            stdout.write_all(menu.as_bytes()).await?;
            stdout.flush().await?;
            let Some(line) = lines.recv().await else {
                return Err(anyhow!("stdin closed while waiting for operator"));
            };
            match line.trim().parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
                _ => log::warn!("[RECOVERY] invalid selection '{}'", line.trim()),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned answers and records every context it was shown.
    pub struct ScriptedPrompt {
        answers: Mutex<VecDeque<PromptAnswer>>,
        pub asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        pub fn new(answers: Vec<PromptAnswer>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                asked: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, context: &str) -> Result<PromptAnswer> {
            self.asked.lock().unwrap().push(context.to_string());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no scripted answer left"))
        }
    }

    #[async_trait]
    impl OperatorPrompt for ScriptedPrompt {
        async fn ask_choice(&self, context: &str, _options: &[&str]) -> Result<usize> {
            match self.next(context)? {
                PromptAnswer::Selected(i) => Ok(i),
                PromptAnswer::TimedOut => Err(anyhow!("blocking prompt cannot time out")),
            }
        }

        async fn ask_with_timeout(
            &self,
            context: &str,
            _options: &[&str],
            _timeout: Duration,
        ) -> Result<PromptAnswer> {
            self.next(context)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowPrompt;

    #[async_trait]
    impl OperatorPrompt for SlowPrompt {
        async fn ask_choice(&self, _context: &str, _options: &[&str]) -> Result<usize> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0)
        }
    }

    #[tokio::test]
    async fn answer_after_a_timeout_reaches_the_next_question() {
        let (reader, mut writer) = tokio::io::duplex(64);
        let prompt = ConsolePrompt::from_reader(tokio::io::BufReader::new(reader));
        let typist = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            writer.write_all(b"2\n").await.unwrap();
            writer
        });

        let first = prompt
            .ask_with_timeout("setup_a", &["close", "keep", "abort"], Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(first, PromptAnswer::TimedOut);

        let second = prompt
            .ask_with_timeout("setup_b", &["close", "keep", "abort"], Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(second, PromptAnswer::Selected(1));
        drop(typist.await.unwrap());
    }

    #[tokio::test]
    async fn invalid_lines_are_skipped_until_a_valid_choice() {
        let input: &'static [u8] = b"zero\n9\n3\n";
        let prompt = ConsolePrompt::from_reader(input);
        let choice = prompt.ask_choice("ctx", &["a", "b", "c"]).await.unwrap();
        assert_eq!(choice, 2);
    }

    #[tokio::test]
    async fn closed_input_is_an_error() {
        let input: &'static [u8] = b"";
        let prompt = ConsolePrompt::from_reader(input);
        assert!(prompt.ask_choice("ctx", &["a"]).await.is_err());
    }

    #[tokio::test]
    async fn default_timeout_reports_timed_out() {
        let answer = SlowPrompt
            .ask_with_timeout("ctx", &["a", "b"], Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(answer, PromptAnswer::TimedOut);
    }
}
