//! Host runner: same watchdog contract as the sandboxes, no jail.

use super::CommandRequest;
use super::CommandResult;
use super::run_with_watchdog;
use crate::error::Result;

#[derive(Default)]
pub struct HostRunner;

impl HostRunner {
    pub async fn run(&self, request: &CommandRequest) -> Result<CommandResult> {
        let argv: Vec<String> = vec![
            "/bin/sh".to_string(),
            "-lc".to_string(),
            request.command.clone(),
        ];
        run_with_watchdog(
            &argv,
            &request.dir,
            request.timeout,
            request.idle_timeout,
            &request.cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn runs_in_requested_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().canonicalize().unwrap();
        let runner = HostRunner;
        let out = runner
            .run(&CommandRequest::new("pwd", canonical.clone()))
            .await
            .unwrap();
        assert_eq!(0, out.exit_code);
        assert_eq!(format!("{}\n", canonical.display()), out.stdout);
    }
}
