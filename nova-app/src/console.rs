//! Terminal message bridge: live transcript on stdout, finished turns in a
//! session history.

use std::io::Write;

use nova_core::ipc::events::{ChatEntry, ChatRole, TranscriptDirection};
use nova_core::MessageBridge;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Default)]
struct ConsoleState {
    /// Direction of the line currently being printed.
    line: Option<TranscriptDirection>,
    history: Vec<ChatEntry>,
}

pub struct ConsoleBridge {
    agent_name: String,
    state: Mutex<ConsoleState>,
}

impl ConsoleBridge {
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            state: Mutex::new(ConsoleState::default()),
        }
    }

    pub fn history(&self) -> Vec<ChatEntry> {
        self.state.lock().history.clone()
    }

    fn label(&self, direction: TranscriptDirection) -> &str {
        match direction {
            TranscriptDirection::Input => "you",
            TranscriptDirection::Output => &self.agent_name,
        }
    }
}

/// Text to print for one delta, opening a new labelled line when the
/// speaker changes.
fn render_delta(
    line: &mut Option<TranscriptDirection>,
    direction: TranscriptDirection,
    label: &str,
    text: &str,
) -> String {
    if *line == Some(direction) {
        return text.to_string();
    }
    let prefix = if line.is_some() { "\n" } else { "" };
    *line = Some(direction);
    format!("{prefix}{label}: {}", text.trim_start())
}

fn format_entry(entry: &ChatEntry) -> String {
    let when = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(entry.timestamp)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let role = match entry.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };
    format!("[{when}] {role}: {}", entry.content)
}

impl MessageBridge for ConsoleBridge {
    fn on_transcript_delta(&self, direction: TranscriptDirection, text: &str) {
        let mut state = self.state.lock();
        let out = render_delta(&mut state.line, direction, self.label(direction), text);
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{out}");
        let _ = stdout.flush();
    }

    fn on_turn_complete(&self, user: ChatEntry, assistant: ChatEntry) {
        let mut state = self.state.lock();
        if state.line.take().is_some() {
            println!();
        }
        debug!(user = %format_entry(&user), assistant = %format_entry(&assistant), "turn saved");
        state.history.push(user);
        state.history.push(assistant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_change_starts_a_new_labelled_line() {
        let mut line = None;
        let a = render_delta(&mut line, TranscriptDirection::Input, "you", "Hi ");
        let b = render_delta(&mut line, TranscriptDirection::Input, "you", "there");
        let c = render_delta(&mut line, TranscriptDirection::Output, "Nova Prime", " Hello");
        assert_eq!(format!("{a}{b}{c}"), "you: Hi there\nNova Prime: Hello");
    }

    #[test]
    fn turn_complete_keeps_pair_in_history() {
        let bridge = ConsoleBridge::new("Nova Prime");
        let (user, assistant) = ChatEntry::turn_pair("q".into(), "a".into());
        bridge.on_turn_complete(user, assistant);
        let history = bridge.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].content, "a");
    }

    #[test]
    fn entries_format_with_role() {
        let (user, _) = ChatEntry::turn_pair("hello".into(), String::new());
        assert!(format_entry(&user).ends_with("user: hello"));
    }
}
