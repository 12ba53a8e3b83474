//! Collaborator interface between the engine and whatever renders it.
//!
//! The engine emits structured events and asks questions through
//! [`UiSink`]; it never reaches for stdin or stdout itself. This keeps the
//! terminal layer swappable and lets tests drive prompt answers as data.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Snapshot of overall conversion progress for panel-style rendering.
#[derive(Debug, Clone)]
pub struct ProgressPanel {
    pub source: String,
    pub target: Option<String>,
    pub iteration: u32,
    pub est_iterations: u32,
    pub percent: u8,
    pub files_migrated: u64,
    pub current_op: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptResponse {
    Choice(usize),
    Cancelled,
}

pub trait UiSink: Send + Sync {
    fn log(&self, level: LogLevel, text: &str);

    /// Transient one-line status, optionally with a percentage.
    fn status(&self, text: &str, percent: Option<u8>);

    fn panel(&self, panel: &ProgressPanel);

    /// Ask the operator to pick one of `options`. Returns the chosen index
    /// or `Cancelled`.
    fn prompt(&self, title: &str, options: &[&str]) -> PromptResponse;
}

/// Plain-terminal implementation: colored log lines, an indicatif spinner
/// for status, numbered prompts read from stdin.
pub struct ConsoleUi {
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn clear_spinner(&self) {
        if let Ok(mut guard) = self.spinner.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
    }
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

impl UiSink for ConsoleUi {
    fn log(&self, level: LogLevel, text: &str) {
        self.clear_spinner();
        match level {
            LogLevel::Info => println!("{}", text),
            LogLevel::Success => println!("{} {}", "✓".green(), text.green()),
            LogLevel::Warning => println!("{} {}", "!".yellow().bold(), text.yellow()),
            LogLevel::Error => eprintln!("{} {}", "✗".red().bold(), text.red()),
        }
    }

    fn status(&self, text: &str, percent: Option<u8>) {
        let message = match percent {
            Some(p) => format!("{} ({}%)", text, p),
            None => text.to_string(),
        };
        let mut guard = match self.spinner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(pb) = guard.as_ref() {
            pb.set_message(message);
        } else {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
                pb.set_style(style);
            }
            pb.set_message(message);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            *guard = Some(pb);
        }
    }

    fn panel(&self, panel: &ProgressPanel) {
        let target = panel.target.as_deref().unwrap_or("(pending)");
        let line = format!(
            "iteration {}/{} · {} → {} · {}% · {} files migrated · {}",
            panel.iteration + 1,
            panel.est_iterations.max(panel.iteration + 1),
            panel.source,
            target,
            panel.percent,
            panel.files_migrated,
            panel.current_op,
        );
        self.status(&line, None);
    }

    fn prompt(&self, title: &str, options: &[&str]) -> PromptResponse {
        self.clear_spinner();
        println!();
        println!("{}", title.bold());
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return PromptResponse::Cancelled;
        }
        match line.trim().parse::<usize>() {
            Ok(n) if n >= 1 && n <= options.len() => PromptResponse::Choice(n - 1),
            _ => PromptResponse::Cancelled,
        }
    }
}

/// Records every event and answers prompts from a pre-loaded script.
/// Used by the end-to-end flow tests.
pub struct ScriptedUi {
    answers: Mutex<std::collections::VecDeque<PromptResponse>>,
    events: Mutex<Vec<String>>,
}

impl ScriptedUi {
    pub fn new(answers: Vec<PromptResponse>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn saw_event_containing(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.contains(needle))
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl UiSink for ScriptedUi {
    fn log(&self, level: LogLevel, text: &str) {
        self.record(format!("log:{:?}:{}", level, text));
    }

    fn status(&self, text: &str, percent: Option<u8>) {
        self.record(format!("status:{}:{:?}", text, percent));
    }

    fn panel(&self, panel: &ProgressPanel) {
        self.record(format!(
            "panel:iter={}:files={}:op={}",
            panel.iteration, panel.files_migrated, panel.current_op
        ));
    }

    fn prompt(&self, title: &str, _options: &[&str]) -> PromptResponse {
        self.record(format!("prompt:{}", title));
        self.answers
            .lock()
            .ok()
            .and_then(|mut a| a.pop_front())
            .unwrap_or(PromptResponse::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_ui_replays_answers_in_order() {
        let ui = ScriptedUi::new(vec![
            PromptResponse::Choice(2),
            PromptResponse::Cancelled,
        ]);
        assert_eq!(ui.prompt("first", &["a", "b", "c"]), PromptResponse::Choice(2));
        assert_eq!(ui.prompt("second", &["a"]), PromptResponse::Cancelled);
        // Script exhausted: further prompts cancel.
        assert_eq!(ui.prompt("third", &["a"]), PromptResponse::Cancelled);
        assert!(ui.saw_event_containing("prompt:first"));
    }
}
