//! Console calibration host.
//!
//! Prints each calibration requirement to stderr and waits for one line of
//! input: Enter (or `y`) when the condition is arranged, `s` to skip an
//! optional step, `q` to abort. End of input aborts.

use async_trait::async_trait;
use colorcal_core::calibration::{CalibrationHost, CalibrationRequirement, HostResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// Host answering from a line-oriented reader, normally stdin.
pub struct ConsoleHost<R> {
    input: Mutex<R>,
}

impl ConsoleHost<BufReader<Stdin>> {
    /// Host reading from the process's stdin.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> ConsoleHost<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Host reading from `input`.
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

/// Meaning of one input line, `None` when unrecognised.
pub fn parse_answer(line: &str) -> Option<HostResponse> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "ok" => Some(HostResponse::Confirmed),
        "s" | "skip" => Some(HostResponse::Skip),
        "q" | "quit" | "abort" => Some(HostResponse::Abort),
        _ => None,
    }
}

fn prompt(requirement: &CalibrationRequirement) -> String {
    let mut text = format!(
        "{} calibration: {}",
        requirement.kind.label(),
        requirement.condition.prompt()
    );
    if let Some(id) = &requirement.identifier {
        text.push_str(&format!(" ({id})"));
    }
    text.push_str(if requirement.optional {
        ". Press Enter when ready, 's' to skip, 'q' to abort: "
    } else {
        ". Press Enter when ready, 'q' to abort: "
    });
    text
}

#[async_trait]
impl<R> CalibrationHost for ConsoleHost<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn request_setup(&self, requirement: &CalibrationRequirement) -> HostResponse {
        let mut input = self.input.lock().await;
        loop {
            eprint!("{}", prompt(requirement));
            let mut line = String::new();
            match input.read_line(&mut line).await {
                Ok(0) | Err(_) => return HostResponse::Abort,
                Ok(_) => {}
            }
            match parse_answer(&line) {
                Some(answer) => return answer,
                None => eprintln!("Unrecognised answer '{}'", line.trim()),
            }
        }
    }
}
