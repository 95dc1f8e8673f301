//! Line-oriented session front end.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;

use avatarlink_client::{
    Affordances, ControllerStatus, DispatchError, KnowledgeRouter, LifecycleState,
    SessionController, StartOutcome, TaskType,
};

const HELP: &str = "\
commands:
  <text>             speak (talk mode)
  /repeat <text>     speak verbatim
  /ask <question>    ask the knowledge backend, then speak the answer
  /interrupt         stop the current utterance
  /start  /end       start or end the session
  /status            show the session state
  /quit              end the session and exit";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Say(String, TaskType),
    Ask(String),
    Interrupt,
    Start,
    End,
    Status,
    Help,
    Quit,
    Unknown(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Say(line.to_string(), TaskType::Talk);
        };
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));
        match name {
            "repeat" => Self::Say(rest.to_string(), TaskType::Repeat),
            "ask" => Self::Ask(rest.to_string()),
            "interrupt" | "stop" => Self::Interrupt,
            "start" => Self::Start,
            "end" => Self::End,
            "status" => Self::Status,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

pub async fn run(controller: SessionController, knowledge: KnowledgeRouter) -> Result<()> {
    run_with(controller, knowledge, BufReader::new(tokio::io::stdin())).await
}

async fn run_with<R>(
    controller: SessionController,
    knowledge: KnowledgeRouter,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut status = controller.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            println!("{}", describe(&snapshot));
        }
    });

    println!("{HELP}");
    // Runs beside the input loop so `/end` and Ctrl-C work while starting.
    let mut first_transition = controller.subscribe();
    let will_start = controller.state() == LifecycleState::Idle;
    let mut pending_start = spawn_start(&controller);
    if will_start {
        let _ = first_transition.changed().await;
    }

    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match Input::parse(&line) {
            Input::Empty => {}
            Input::Say(text, mode) => speak(&controller, &text, mode).await,
            Input::Ask(question) => match knowledge.ask(&question).await {
                Ok(answer) => {
                    println!("{answer}");
                    if controller.state() == LifecycleState::Active {
                        speak(&controller, &answer, TaskType::Repeat).await;
                    }
                }
                Err(e) => eprintln!("{e}"),
            },
            Input::Interrupt => match controller.interrupt().await {
                Ok(outcome) if outcome.remote_acknowledged => println!("interrupted"),
                Ok(_) => println!("muted locally; the provider did not acknowledge"),
                Err(e) => eprintln!("{e}"),
            },
            Input::Start => pending_start = spawn_start(&controller),
            Input::End => {
                controller.end().await;
            }
            Input::Status => println!("{}", describe(&controller.status())),
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Unknown(name) => eprintln!("unknown command /{name}; try /help"),
        }
    }

    controller.end().await;
    let _ = pending_start.await;
    printer.abort();
    Ok(())
}

fn spawn_start(controller: &SessionController) -> JoinHandle<()> {
    let controller = controller.clone();
    tokio::spawn(async move { start(&controller).await })
}

async fn start(controller: &SessionController) {
    match controller.start().await {
        Ok(StartOutcome::Started {
            session_id,
            transport,
        }) => println!(
            "session {} active over {transport}",
            session_id.as_deref().unwrap_or("-")
        ),
        Ok(StartOutcome::Ignored(state)) => println!("already {}", state_label(state)),
        Ok(StartOutcome::Cancelled) => println!("start cancelled"),
        Err(e) => eprintln!("start failed: {e}"),
    }
}

async fn speak(controller: &SessionController, text: &str, mode: TaskType) {
    match controller.speak(text, mode).await {
        Ok(()) => {}
        Err(DispatchError::EmptyText) => eprintln!("nothing to say"),
        Err(e) => {
            warn!("speak failed: {e}");
            eprintln!("speak failed: {e}");
        }
    }
}

fn state_label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Idle => "idle",
        LifecycleState::Starting => "starting",
        LifecycleState::Active => "active",
        LifecycleState::Ending => "ending",
    }
}

fn describe(status: &ControllerStatus) -> String {
    let Affordances {
        start,
        end,
        speak,
        talk,
    } = status.affordances;
    let enabled: Vec<&str> = [("start", start), ("end", end), ("speak", speak), ("talk", talk)]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
    format!(
        "[{}] session={} controls={}",
        state_label(status.state),
        status.session_id.as_deref().unwrap_or("-"),
        if enabled.is_empty() {
            "none".to_string()
        } else {
            enabled.join(",")
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use avatarlink_client::{BackendClient, ClientConfig, MediaSinks};

    #[tokio::test]
    async fn test_end_is_read_while_the_first_start_is_pending() {
        // Accepts the session request and never answers it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = ClientConfig::from_backend(&format!("http://{addr}"));
        config.acquire_timeout = Duration::from_secs(60);
        let controller =
            SessionController::from_config(&config, MediaSinks::headless(), None).unwrap();
        let knowledge =
            KnowledgeRouter::new(BackendClient::new(&config).unwrap(), config.request_timeout);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_with(controller.clone(), knowledge, &b"/end\n/quit\n"[..]),
        )
        .await
        .expect("input was not read while starting")
        .unwrap();
        assert_eq!(controller.state(), LifecycleState::Idle);
        silent.abort();
    }

    #[test]
    fn test_parse_plain_text_is_talk() {
        assert_eq!(
            Input::parse("  hello avatar "),
            Input::Say("hello avatar".into(), TaskType::Talk)
        );
        assert_eq!(Input::parse("   "), Input::Empty);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Input::parse("/repeat  say this "),
            Input::Say("say this".into(), TaskType::Repeat)
        );
        assert_eq!(Input::parse("/ask what courses?"), Input::Ask("what courses?".into()));
        assert_eq!(Input::parse("/interrupt"), Input::Interrupt);
        assert_eq!(Input::parse("/quit"), Input::Quit);
        assert_eq!(Input::parse("/dance"), Input::Unknown("dance".into()));
    }

    #[test]
    fn test_describe_lists_enabled_controls() {
        let status = ControllerStatus {
            state: LifecycleState::Active,
            affordances: Affordances::for_state(LifecycleState::Active),
            session_id: Some("s1".into()),
            transport: None,
        };
        assert_eq!(describe(&status), "[active] session=s1 controls=end,speak,talk");
    }
}
