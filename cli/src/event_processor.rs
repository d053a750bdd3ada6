//! Renders run events to the terminal: partial chunks verbatim on stdout,
//! everything diagnostic on stderr. A finished answer always ends in exactly
//! one newline.

use std::io::Write;

use sable_core::runloop::RunEvent;
use sable_core::runloop::RunEventMsg;

/// What the main loop should do after one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    TurnDone,
    Shutdown,
}

#[derive(Default)]
pub struct EventProcessor {
    /// Answer text already printed for the in-flight turn.
    streamed: String,
}

impl EventProcessor {
    pub fn process(&mut self, event: RunEvent) -> Control {
        match event.msg {
            RunEventMsg::SessionConfigured { model, session_id } => {
                eprintln!("session {session_id} ({model})");
                Control::Continue
            }
            RunEventMsg::TurnStarted => {
                self.streamed.clear();
                Control::Continue
            }
            RunEventMsg::AnswerDelta(delta) => {
                self.streamed.push_str(&delta);
                print!("{delta}");
                let _ = std::io::stdout().flush();
                Control::Continue
            }
            RunEventMsg::ReasoningDelta(_) => {
                // Reasoning stays off the answer stream.
                Control::Continue
            }
            RunEventMsg::ToolCallBegin { name, .. } => {
                eprintln!("[{name}] running...");
                Control::Continue
            }
            RunEventMsg::ToolCallEnd { name, ok, .. } => {
                if !ok {
                    eprintln!("[{name}] failed");
                }
                Control::Continue
            }
            RunEventMsg::TurnComplete { text } => {
                if self.streamed.is_empty() {
                    // Non-streaming turn: print the whole answer at once.
                    print!("{text}");
                    self.streamed = text;
                }
                if !self.streamed.ends_with('\n') {
                    println!();
                }
                let _ = std::io::stdout().flush();
                Control::TurnDone
            }
            RunEventMsg::Compacted { skipped } => {
                if skipped {
                    eprintln!("window too small to compact");
                } else {
                    eprintln!("compacted conversation history");
                }
                Control::TurnDone
            }
            RunEventMsg::Canceled => {
                eprintln!("canceled");
                Control::TurnDone
            }
            RunEventMsg::Error { message, code } => {
                eprintln!("error [{code}]: {message}");
                Control::TurnDone
            }
            RunEventMsg::ShutdownComplete => Control::Shutdown,
        }
    }
}
