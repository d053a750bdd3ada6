//! Approval broker: the single per-process object consulted when the router
//! needs human consent for a host command.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::error::SableErr;

/// Shell characters that disqualify a command from auto-approval no matter
/// how benign its base command looks.
const SHELL_META_CHARS: [char; 6] = ['<', '>', '$', '`', '\\', '&'];

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub action: String,
    pub reason: String,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Yes,
    /// Approve and allow-list the exact command text for the session.
    Always,
    No,
}

/// The terminal side of an approval. EOF mid-prompt is a cancel, not a
/// silent deny: implementations return `ApprovalAborted`.
#[async_trait]
pub trait UserPrompter: Send + Sync {
    async fn prompt(&self, request: &ApprovalRequest) -> Result<PromptAnswer>;
}

pub struct ApprovalBroker {
    prompter: Option<Arc<dyn UserPrompter>>,
    default_allow: HashSet<String>,
    session_allow: RwLock<HashSet<String>>,
}

impl ApprovalBroker {
    pub fn new(safe_commands: &[String], prompter: Option<Arc<dyn UserPrompter>>) -> Self {
        let mut default_allow: HashSet<String> =
            safe_commands.iter().map(|s| s.trim().to_string()).collect();
        default_allow.insert("git status".to_string());
        Self {
            prompter,
            default_allow,
            session_allow: RwLock::new(HashSet::new()),
        }
    }

    /// `Ok(true)` to run, `Ok(false)` on an explicit deny, `ApprovalAborted`
    /// on EOF/cancel, `ApprovalRequired` when no prompter is attached.
    pub async fn approve(&self, request: &ApprovalRequest) -> Result<bool> {
        if self.is_auto_allowed(&request.command) {
            debug!("auto-approved safe command: {}", request.command);
            return Ok(true);
        }
        if let Ok(session) = self.session_allow.read()
            && session.contains(request.command.trim())
        {
            debug!("session allow-list hit: {}", request.command);
            return Ok(true);
        }

        let Some(prompter) = &self.prompter else {
            return Err(SableErr::ApprovalRequired {
                command: request.command.clone(),
            });
        };

        match prompter.prompt(request).await? {
            PromptAnswer::Yes => Ok(true),
            PromptAnswer::Always => {
                if let Ok(mut session) = self.session_allow.write() {
                    session.insert(request.command.trim().to_string());
                }
                Ok(true)
            }
            PromptAnswer::No => Ok(false),
        }
    }

    /// A command is auto-allowed iff every pipeline segment's base command
    /// (env prefixes stripped; `git` keyed by its first subcommand) is on the
    /// default allow-list and no segment carries shell meta characters.
    pub fn is_auto_allowed(&self, command: &str) -> bool {
        let segments = split_segments(command);
        if segments.is_empty() {
            return false;
        }
        segments.iter().all(|segment| {
            if segment.contains(&SHELL_META_CHARS[..]) {
                return false;
            }
            match base_command(segment) {
                Some(base) => self.default_allow.contains(&base),
                None => false,
            }
        })
    }
}

/// Split a shell command on `;`, `&&`, `||` and `|`.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ';' => {
                segments.push(std::mem::take(&mut current));
            }
            '&' | '|' if chars.peek() == Some(&c) => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            '|' => {
                segments.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    segments.push(current);
    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The allow-list key of one segment: the first token that is not a
/// `NAME=VALUE` env assignment; for `git`, the pair `git <subcommand>` using
/// the first non-flag argument.
fn base_command(segment: &str) -> Option<String> {
    let tokens = shlex::split(segment)?;
    let mut tokens = tokens
        .into_iter()
        .skip_while(|token| is_env_assignment(token));

    let base = tokens.next()?;
    if base == "git" {
        let subcommand = tokens.find(|token| !token.starts_with('-'))?;
        return Some(format!("git {subcommand}"));
    }
    Some(base)
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    struct ScriptedPrompter {
        answer: PromptAnswer,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl UserPrompter for ScriptedPrompter {
        async fn prompt(&self, _request: &ApprovalRequest) -> Result<PromptAnswer> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct EofPrompter;

    #[async_trait]
    impl UserPrompter for EofPrompter {
        async fn prompt(&self, _request: &ApprovalRequest) -> Result<PromptAnswer> {
            Err(SableErr::ApprovalAborted {
                reason: "EOF on approval prompt".to_string(),
            })
        }
    }

    fn broker_with(safe: &[&str], prompter: Option<Arc<dyn UserPrompter>>) -> ApprovalBroker {
        let safe: Vec<String> = safe.iter().map(|s| s.to_string()).collect();
        ApprovalBroker::new(&safe, prompter)
    }

    fn request(command: &str) -> ApprovalRequest {
        ApprovalRequest {
            tool_name: "BASH".into(),
            action: "execute".into(),
            reason: String::new(),
            command: command.into(),
        }
    }

    #[test]
    fn auto_allow_matrix() {
        let broker = broker_with(&["ls", "cat", "wc"], None);

        // Every segment allow-listed, separators of all four kinds.
        assert!(broker.is_auto_allowed("ls"));
        assert!(broker.is_auto_allowed("ls; cat foo.txt"));
        assert!(broker.is_auto_allowed("ls && cat a | wc"));
        assert!(broker.is_auto_allowed("ls || ls -la"));

        // Env prefixes are stripped before the base-command check.
        assert!(broker.is_auto_allowed("FOO=bar ls"));
        assert!(broker.is_auto_allowed("A=1 B=2 cat x"));

        // git is keyed by subcommand; only `git status` is in the default
        // list here.
        assert!(broker.is_auto_allowed("git status"));
        assert!(broker.is_auto_allowed("git -C . status"));
        assert!(!broker.is_auto_allowed("git push"));

        // One non-listed segment poisons the pipeline.
        assert!(!broker.is_auto_allowed("ls && rm -rf /"));

        // Shell meta characters are disqualifying.
        assert!(!broker.is_auto_allowed("ls > out.txt"));
        assert!(!broker.is_auto_allowed("cat $HOME/x"));
        assert!(!broker.is_auto_allowed("ls `pwd`"));
        assert!(!broker.is_auto_allowed("ls \\ x"));
        assert!(!broker.is_auto_allowed("ls & cat x"));

        assert!(!broker.is_auto_allowed(""));
    }

    #[tokio::test]
    async fn auto_allowed_never_consults_the_prompter() {
        let prompter = Arc::new(ScriptedPrompter {
            answer: PromptAnswer::No,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let broker = broker_with(&["ls"], Some(prompter.clone()));
        assert!(broker.approve(&request("ls -la")).await.unwrap());
        assert_eq!(0, prompter.calls.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn always_adds_exact_text_to_session_allow_list() {
        let prompter = Arc::new(ScriptedPrompter {
            answer: PromptAnswer::Always,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let broker = broker_with(&[], Some(prompter.clone()));

        assert!(broker.approve(&request("python3 app.py")).await.unwrap());
        assert_eq!(1, prompter.calls.load(std::sync::atomic::Ordering::SeqCst));

        // Identical text skips the prompt; different text prompts again.
        assert!(broker.approve(&request("python3 app.py")).await.unwrap());
        assert_eq!(1, prompter.calls.load(std::sync::atomic::Ordering::SeqCst));
        assert!(broker.approve(&request("python3 other.py")).await.unwrap());
        assert_eq!(2, prompter.calls.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn eof_is_abort_not_deny() {
        let broker = broker_with(&[], Some(Arc::new(EofPrompter)));
        let err = broker.approve(&request("python3 app.py")).await.unwrap_err();
        assert_eq!("ApprovalAborted", err.code());
    }

    #[tokio::test]
    async fn no_prompter_surfaces_approval_required() {
        let broker = broker_with(&[], None);
        let err = broker.approve(&request("python3 app.py")).await.unwrap_err();
        assert_eq!("ApprovalRequired", err.code());
    }

    #[tokio::test]
    async fn deny_returns_false() {
        let broker = broker_with(
            &[],
            Some(Arc::new(ScriptedPrompter {
                answer: PromptAnswer::No,
                calls: std::sync::atomic::AtomicUsize::new(0),
            })),
        );
        assert!(!broker.approve(&request("python3 app.py")).await.unwrap());
    }
}
