//! Terminal chat client: the same turn driver as the HTTP API, printing the
//! reply as it streams and the preview address once the sandbox answers.

use crate::config::Config;
use crate::conversation::{DriverEvent, Role};
use crate::gateway::AppState;
use console::style;
use rustyline::error::ReadlineError;
use std::io::Write;
use tokio::sync::{mpsc, oneshot};

const PROMPT: &str = "you> ";

enum Input {
    Line(String),
    Eof,
    Failed(String),
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let session = state.sessions.create();

    println!(
        "{} Describe an app and the assistant will build it. /state shows the conversation, /quit exits.",
        style("sandpreview").bold().cyan()
    );

    let (ready, mut lines) = spawn_reader();

    loop {
        if ready.send(()).is_err() {
            break;
        }
        let line = match lines.recv().await {
            Some(Input::Line(line)) => line,
            Some(Input::Failed(e)) => anyhow::bail!("Failed to read input: {e}"),
            Some(Input::Eof) | None => break,
        };

        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/state" => {
                println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
                continue;
            }
            _ => {}
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (replied, reply_done) = oneshot::channel();
        tokio::spawn(print_events(rx, replied));

        if let Err(e) = state.driver.submit(&session, input, events).await {
            eprintln!("{} {e}", style("!").yellow());
            continue;
        }
        let _ = reply_done.await;
    }

    println!("{}", style("bye").dim());
    Ok(())
}

/// Read lines on a dedicated thread; one line per `()` received on the
/// returned sender, so the prompt never overlaps a streaming reply.
fn spawn_reader() -> (std::sync::mpsc::Sender<()>, mpsc::UnboundedReceiver<Input>) {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    let (line_tx, line_rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(Input::Failed(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(Input::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                    let _ = line_tx.send(Input::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(Input::Failed(e.to_string()));
                    break;
                }
            }
        }
    });

    (ready_tx, line_rx)
}

/// Print turn events. `replied` fires once the assistant reply is finished
/// (or failed); deploy progress keeps printing after that.
async fn print_events(mut events: mpsc::UnboundedReceiver<DriverEvent>, replied: oneshot::Sender<()>) {
    let mut replied = Some(replied);
    let mut signal = move || {
        if let Some(tx) = replied.take() {
            let _ = tx.send(());
        }
    };

    let mut streaming = false;
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::Delta { text } => {
                if !streaming {
                    print!("{} ", style("ai>").green());
                    streaming = true;
                }
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            DriverEvent::Message { message } if message.role == Role::Assistant => {
                println!();
                signal();
            }
            DriverEvent::Message { .. } => {}
            DriverEvent::Code { code, language } => {
                println!(
                    "{}",
                    style(format!(
                        "deploying {} lines of {}",
                        code.lines().count(),
                        language.as_deref().unwrap_or("code")
                    ))
                    .dim()
                );
            }
            DriverEvent::Sandbox { handle } => {
                println!(
                    "{}",
                    style(format!("sandbox {} is starting", handle.sandbox_id)).dim()
                );
            }
            DriverEvent::Preview { url, ready } => {
                let label = if ready { "preview" } else { "preview (unverified)" };
                println!("{} {}", style(label).bold().green(), style(url).underlined());
            }
            DriverEvent::Notice { message } => {
                eprintln!("{} {message}", style("!").yellow());
            }
            DriverEvent::Done => signal(),
        }
    }
    signal();
}
