//! Terminal approval prompter. Reads the decision from the controlling tty
//! so approval prompts work even while stdin feeds the conversation; EOF is
//! a cancel, never a silent deny.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;

use sable_core::SableErr;
use sable_core::approval::ApprovalRequest;
use sable_core::approval::PromptAnswer;
use sable_core::approval::UserPrompter;

pub struct TtyPrompter;

#[async_trait::async_trait]
impl UserPrompter for TtyPrompter {
    async fn prompt(&self, request: &ApprovalRequest) -> sable_core::Result<PromptAnswer> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || prompt_blocking(&request))
            .await
            .map_err(SableErr::TokioJoin)?
    }
}

fn prompt_blocking(request: &ApprovalRequest) -> sable_core::Result<PromptAnswer> {
    let mut tty_out: Box<dyn Write> = match File::options().write(true).open("/dev/tty") {
        Ok(tty) => Box::new(tty),
        Err(_) => Box::new(std::io::stderr()),
    };
    writeln!(
        tty_out,
        "\n{} wants to {}: {}",
        request.tool_name, request.action, request.command
    )?;
    if !request.reason.is_empty() {
        writeln!(tty_out, "reason: {}", request.reason)?;
    }
    write!(tty_out, "approve? [y]es / [a]lways / [n]o: ")?;
    tty_out.flush()?;

    let mut reader: Box<dyn BufRead> = match File::open("/dev/tty") {
        Ok(tty) => Box::new(BufReader::new(tty)),
        Err(_) => Box::new(BufReader::new(std::io::stdin())),
    };
    let mut line = String::new();
    let read = reader.read_line(&mut line)?;
    if read == 0 {
        // EOF mid-prompt is a cancel.
        return Err(SableErr::ApprovalAborted {
            reason: "EOF on approval prompt".to_string(),
        });
    }
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Ok(PromptAnswer::Yes),
        "a" | "always" => Ok(PromptAnswer::Always),
        _ => Ok(PromptAnswer::No),
    }
}
