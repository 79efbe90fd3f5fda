//! Interactive REPL with line editing and markdown rendering.
//!
//! Uses rustyline for line editing, history, and tab-completion, and termimad
//! for rendering backend replies inline. Input is read on a dedicated thread
//! and forwarded to the async loop, which also renders queue events as they
//! arrive.
//!
//! ## Commands
//!
//! - `/help` - Show available commands
//! - `/login [wallet]` - Log in with the identity provider or the wallet
//! - `/logout` - End the session
//! - `/whoami`, `/status` - Show session and queue state
//! - `/cancel` - Drop queued tasks and ignore the one in flight (also Ctrl+C)
//! - `/history [n]`, `/profile`, `/metrics` - Backend queries
//! - `/dev <task>`, `/browse <url>` - Submit in developer or browse mode
//! - `/quit` or `/exit` - Exit the REPL

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{TimeZone, Utc};
use rustyline::completion::Completer;
use rustyline::config::Config;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{CompletionType, Editor, Helper};
use termimad::MadSkin;
use tokio::sync::mpsc;

use crate::backend::api::{self, Message, Metrics, UserProfile};
use crate::context::AppContext;
use crate::error::{
    ApiError, ChannelError, Error, RuntimeErrorDomain, RuntimeErrorPayload, SubmitError,
};
use crate::identity::ProviderKind;
use crate::proxy::ServiceProxy;
use crate::queue::{QueueRunState, ReplySource, TaskEvent, TaskFailure, TaskMode, TaskQueue};
use crate::session::{ResumeOutcome, SessionManager, SessionSnapshot, SessionState};

/// Max characters for status lines in the terminal.
const CLI_STATUS_MAX: usize = 200;

/// Slash commands available in the REPL.
const SLASH_COMMANDS: &[&str] = &[
    "/help",
    "/quit",
    "/exit",
    "/debug",
    "/login",
    "/logout",
    "/whoami",
    "/status",
    "/cancel",
    "/history",
    "/profile",
    "/metrics",
    "/dev",
    "/browse",
];

/// Rustyline helper for slash-command tab completion.
struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if !line.starts_with('/') {
            return Ok((0, vec![]));
        }

        let prefix = &line[..pos];
        let matches: Vec<String> = SLASH_COMMANDS
            .iter()
            .filter(|cmd| cmd.starts_with(prefix))
            .map(|cmd| cmd.to_string())
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for ReplHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if !line.starts_with('/') || pos < line.len() {
            return None;
        }

        SLASH_COMMANDS
            .iter()
            .find(|cmd| cmd.starts_with(line) && **cmd != line)
            .map(|cmd| cmd[line.len()..].to_string())
    }
}

impl Highlighter for ReplHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Cow::Owned(format!("\x1b[90m{hint}\x1b[0m"))
    }
}

impl Validator for ReplHelper {}
impl Helper for ReplHelper {}

/// Build a termimad skin with our color scheme.
fn make_skin() -> MadSkin {
    let mut skin = MadSkin::default();
    skin.set_headers_fg(termimad::crossterm::style::Color::Yellow);
    skin.bold.set_fg(termimad::crossterm::style::Color::White);
    skin.italic.set_fg(termimad::crossterm::style::Color::Magenta);
    skin.inline_code.set_fg(termimad::crossterm::style::Color::Green);
    skin.code_block.set_fg(termimad::crossterm::style::Color::Green);
    skin.code_block.left_margin = 2;
    skin
}

/// One line of operator input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplInput {
    Quit,
    Help,
    Debug,
    Login(ProviderKind),
    Logout,
    Whoami,
    Status,
    Cancel,
    History(Option<u64>),
    Profile,
    Metrics,
    Submit { mode: TaskMode, payload: String },
    Invalid(String),
}

fn parse_input(line: &str) -> ReplInput {
    let line = line.trim();
    if !line.starts_with('/') {
        return ReplInput::Submit {
            mode: TaskMode::Chat,
            payload: line.to_string(),
        };
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command.to_lowercase().as_str() {
        "/quit" | "/exit" => ReplInput::Quit,
        "/help" => ReplInput::Help,
        "/debug" => ReplInput::Debug,
        "/login" => match ProviderKind::parse(rest) {
            Some(kind) => ReplInput::Login(kind),
            None => ReplInput::Invalid(format!(
                "unknown provider '{rest}', use /login or /login wallet"
            )),
        },
        "/logout" => ReplInput::Logout,
        "/whoami" => ReplInput::Whoami,
        "/status" => ReplInput::Status,
        "/cancel" | "/stop" => ReplInput::Cancel,
        "/history" if rest.is_empty() => ReplInput::History(None),
        "/history" => match rest.parse::<u64>() {
            Ok(limit) => ReplInput::History(Some(limit)),
            Err(_) => ReplInput::Invalid("usage: /history [count]".to_string()),
        },
        "/profile" => ReplInput::Profile,
        "/metrics" => ReplInput::Metrics,
        "/dev" if rest.is_empty() => ReplInput::Invalid("usage: /dev <task>".to_string()),
        "/dev" => ReplInput::Submit {
            mode: TaskMode::Dev,
            payload: rest.to_string(),
        },
        "/browse" => match url::Url::parse(rest) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => ReplInput::Submit {
                mode: TaskMode::Browse,
                payload: rest.to_string(),
            },
            _ => ReplInput::Invalid("usage: /browse <http(s) url>".to_string()),
        },
        other => ReplInput::Invalid(format!("unknown command {other}, /help for commands")),
    }
}

fn print_help() {
    // Bold white for section headers, bold cyan for commands, dim gray for descriptions
    let h = "\x1b[1m";
    let c = "\x1b[1;36m";
    let d = "\x1b[90m";
    let r = "\x1b[0m";

    println!();
    println!("  {h}PicoClaw REPL{r}");
    println!();
    println!("  {h}Session{r}");
    println!("  {c}/login{r}             {d}log in with the identity provider{r}");
    println!("  {c}/login wallet{r}      {d}log in with the wallet extension{r}");
    println!("  {c}/logout{r}            {d}end the session{r}");
    println!("  {c}/whoami{r}            {d}show the current principal{r}");
    println!("  {c}/status{r}            {d}session, local queue and backend queue{r}");
    println!();
    println!("  {h}Tasks{r}");
    println!("  {c}<text>{r}             {d}chat with the agent{r}");
    println!("  {c}/dev <task>{r}        {d}send a task to the developer agent{r}");
    println!("  {c}/browse <url>{r}      {d}fetch and summarise a page{r}");
    println!("  {c}/cancel{r} (Ctrl+C)   {d}drop queued tasks, ignore the one in flight{r}");
    println!();
    println!("  {h}Backend{r}");
    println!("  {c}/history [n]{r}       {d}recent conversation{r}");
    println!("  {c}/profile{r}           {d}agent profile{r}");
    println!("  {c}/metrics{r}           {d}agent usage counters{r}");
    println!();
    println!("  {c}/debug{r}             {d}toggle verbose output{r}");
    println!("  {c}/quit{r} {c}/exit{r}        {d}exit the repl{r}");
    println!();
}

fn truncate_for_preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{preview}...")
    } else {
        preview
    }
}

fn incident_style(domain: RuntimeErrorDomain) -> (&'static str, &'static str) {
    match domain {
        RuntimeErrorDomain::Auth => ("auth", "\x1b[33m"),
        RuntimeErrorDomain::Call => ("backend", "\x1b[31m"),
        RuntimeErrorDomain::Config => ("config", "\x1b[35m"),
        RuntimeErrorDomain::Channel => ("channel", "\x1b[35m"),
        RuntimeErrorDomain::Unknown => ("client", "\x1b[90m"),
    }
}

fn build_incident_lines(payload: &RuntimeErrorPayload) -> Vec<String> {
    let (domain, color) = incident_style(payload.domain);
    let message = if payload.message.trim().is_empty() {
        "No incident message provided".to_string()
    } else {
        truncate_for_preview(&payload.message, CLI_STATUS_MAX)
    };
    let retryable = if payload.retryable { "yes" } else { "no" };

    vec![
        format!("  {color}\u{26A0} incident {domain}\x1b[0m"),
        format!("    \x1b[90mcode:\x1b[0m {}", payload.code),
        format!("    \x1b[90mretryable:\x1b[0m {retryable}"),
        format!("    \x1b[90mmessage:\x1b[0m {message}"),
    ]
}

fn render_error(error: &Error) {
    for line in build_incident_lines(&error.to_runtime_error_payload()) {
        eprintln!("{line}");
    }
}

fn failure_to_error(failure: TaskFailure) -> Error {
    match failure {
        TaskFailure::Call(e) => Error::Call(e),
        TaskFailure::Refused(message) => Error::Api(ApiError::Refused {
            operation: api::CHAT.to_string(),
            message,
        }),
    }
}

fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(80)
}

fn render_markdown(markdown: &str) {
    let width = terminal_width();
    eprintln!("\x1b[90m{}\x1b[0m", "\u{2500}".repeat(width.min(80)));
    let skin = make_skin();
    let text = termimad::FmtText::from(&skin, markdown, Some(width));
    print!("{text}");
    println!();
}

fn format_timestamp(nanos: u64) -> String {
    let nanos = i64::try_from(nanos).unwrap_or(i64::MAX);
    Utc.timestamp_nanos(nanos)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn format_history(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "*No conversation yet.*".to_string();
    }

    let mut out = String::new();
    for message in messages {
        let who = match message.role.as_str() {
            "user" => "you",
            "assistant" => "agent",
            other => other,
        };
        out.push_str(&format!(
            "**{who}** *{}*\n{}\n\n",
            format_timestamp(message.timestamp),
            message.content.trim()
        ));
    }
    out
}

fn format_profile(profile: &UserProfile) -> String {
    let mut out = format!("**{}**\n", profile.name);
    if !profile.avatar_url.is_empty() {
        out.push_str(&format!("avatar: {}\n", profile.avatar_url));
    }
    if profile.updated_at > 0 {
        out.push_str(&format!("updated: {}\n", format_timestamp(profile.updated_at)));
    }
    out
}

fn format_metrics(metrics: &Metrics) -> String {
    format!(
        "|metric|value|\n|-|-:|\n|calls|{}|\n|messages|{}|\n|cycles spent|{}|\n|errors|{}|\n",
        metrics.total_calls, metrics.total_messages, metrics.total_cycles_spent, metrics.errors
    )
}

fn format_session(snapshot: &SessionSnapshot) -> String {
    match (&snapshot.session.principal, snapshot.state) {
        (Some(principal), SessionState::Authorized) => format!(
            "\x1b[32m\u{25CF}\x1b[0m {principal} \x1b[90m({})\x1b[0m",
            snapshot.session.identity_kind
        ),
        (Some(principal), state) => {
            format!("\x1b[33m\u{25CB}\x1b[0m {principal} \x1b[90m({state:?})\x1b[0m")
        }
        (None, SessionState::Anonymous) => {
            "\x1b[90m\u{25CB} anonymous, /login to authenticate\x1b[0m".to_string()
        }
        (None, state) => format!("\x1b[90m\u{25CB} {state:?}\x1b[0m"),
    }
}

fn format_queue(queue: &TaskQueue) -> String {
    let state = match queue.run_state() {
        QueueRunState::Idle => "idle",
        QueueRunState::Draining => "draining",
        QueueRunState::Cancelling => "cancelling",
    };
    match queue.in_flight() {
        Some(sequence) => format!(
            "queue: {state}, #{sequence} in flight, {} pending",
            queue.pending_len()
        ),
        None => format!("queue: {state}, {} pending", queue.pending_len()),
    }
}

async fn show_history(proxy: &ServiceProxy, limit: u64) {
    if limit == 0 {
        return;
    }
    match api::get_history(proxy, limit).await {
        Ok(messages) => render_markdown(&format_history(&messages)),
        Err(e) => render_error(&Error::Api(e)),
    }
}

fn render_event(event: TaskEvent, debug: bool) {
    match event {
        TaskEvent::Started { sequence, mode } => {
            let label = match mode {
                TaskMode::Chat => "thinking",
                TaskMode::Dev => "dev agent working",
                TaskMode::Browse => "browsing",
            };
            eprintln!("  \x1b[90m\u{25CB} #{sequence} {label}\x1b[0m");
        }
        TaskEvent::Delivered {
            sequence,
            text,
            source,
        } => {
            if debug {
                let origin = match source {
                    ReplySource::Local => "local",
                    ReplySource::Backend => "backend",
                };
                eprintln!("  \x1b[32m\u{25CF} #{sequence}\x1b[0m \x1b[90m({origin})\x1b[0m");
            }
            render_markdown(&text);
        }
        TaskEvent::Failed { sequence, failure } => {
            eprintln!("  \x1b[31m\u{2717} #{sequence} failed\x1b[0m");
            render_error(&failure_to_error(failure));
        }
        TaskEvent::Cancelled {
            discarded,
            in_flight,
        } => {
            let mut line = format!("  \x1b[33mcancelled\x1b[0m \x1b[90m{discarded} pending dropped");
            if let Some(sequence) = in_flight {
                line.push_str(&format!(", result of #{sequence} will be ignored"));
            }
            eprintln!("{line}\x1b[0m");
        }
    }
}

/// Try to pick up a stored session and show where we left off.
async fn resume(ctx: &AppContext) {
    match ctx.sessions.resume_session().await {
        Ok(ResumeOutcome::NothingToResume) => {}
        Ok(ResumeOutcome::Resumed(principal)) => {
            eprintln!("  \x1b[32m\u{25CF}\x1b[0m session resumed as {principal}");
            show_history(&ctx.proxy, ctx.config.repl.history_limit).await;
        }
        Err(e) => render_error(&Error::Auth(e)),
    }
}

fn spawn_login(ctx: &AppContext, kind: ProviderKind) {
    let sessions = Arc::clone(&ctx.sessions);
    let proxy = Arc::clone(&ctx.proxy);
    let limit = ctx.config.repl.history_limit;
    tokio::spawn(async move {
        match sessions.login(kind).await {
            Ok(principal) => {
                eprintln!("  \x1b[32m\u{25CF}\x1b[0m logged in as {principal}");
                show_history(&proxy, limit).await;
            }
            Err(e) => render_error(&Error::Auth(e)),
        }
    });
}

fn spawn_logout(sessions: Arc<SessionManager>) {
    tokio::spawn(async move {
        match sessions.logout().await {
            Ok(()) => eprintln!("  \x1b[90m\u{25CB} logged out\x1b[0m"),
            Err(e) => render_error(&Error::Auth(e)),
        }
    });
}

/// Run a backend query in the background and render its answer.
fn spawn_query<T, F, Fut>(proxy: Arc<ServiceProxy>, query: F, format: fn(&T) -> String)
where
    T: Send + 'static,
    F: FnOnce(Arc<ServiceProxy>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<T, ApiError>> + Send + 'static,
{
    tokio::spawn(async move {
        match query(proxy).await {
            Ok(value) => render_markdown(&format(&value)),
            Err(e) => render_error(&Error::Api(e)),
        }
    });
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn handle_input(ctx: &AppContext, input: ReplInput, debug: &AtomicBool) -> Flow {
    match input {
        ReplInput::Quit => return Flow::Quit,
        ReplInput::Help => print_help(),
        ReplInput::Debug => {
            let current = debug.load(Ordering::Relaxed);
            debug.store(!current, Ordering::Relaxed);
            if !current {
                println!("\x1b[90mdebug mode on\x1b[0m");
            } else {
                println!("\x1b[90mdebug mode off\x1b[0m");
            }
        }
        ReplInput::Login(kind) => spawn_login(ctx, kind),
        ReplInput::Logout => spawn_logout(Arc::clone(&ctx.sessions)),
        ReplInput::Whoami => eprintln!("  {}", format_session(&ctx.sessions.snapshot())),
        ReplInput::Status => {
            eprintln!("  {}", format_session(&ctx.sessions.snapshot()));
            eprintln!("  \x1b[90m{}\x1b[0m", format_queue(&ctx.queue));
            spawn_query(
                Arc::clone(&ctx.proxy),
                |proxy| async move { api::get_queue_length(&*proxy).await },
                |length: &u64| format!("backend queue: {length} waiting"),
            );
        }
        ReplInput::Cancel => {
            ctx.queue.cancel();
        }
        ReplInput::History(limit) => {
            let limit = limit.unwrap_or(ctx.config.repl.history_limit);
            let proxy = Arc::clone(&ctx.proxy);
            tokio::spawn(async move { show_history(&proxy, limit).await });
        }
        ReplInput::Profile => spawn_query(
            Arc::clone(&ctx.proxy),
            |proxy| async move { api::get_profile(&*proxy).await },
            format_profile,
        ),
        ReplInput::Metrics => spawn_query(
            Arc::clone(&ctx.proxy),
            |proxy| async move { api::get_metrics(&*proxy).await },
            format_metrics,
        ),
        ReplInput::Submit { mode, payload } => match ctx.queue.submit(&payload, mode) {
            Ok(sequence) => {
                if debug.load(Ordering::Relaxed) {
                    eprintln!("  \x1b[90mqueued #{sequence}\x1b[0m");
                }
            }
            Err(e) => render_error(&Error::Submit(e)),
        },
        ReplInput::Invalid(message) => eprintln!("  \x1b[33m{message}\x1b[0m"),
    }
    Flow::Continue
}

/// Read lines on a blocking thread and forward them to the async loop.
fn spawn_input_thread(
    tx: mpsc::Sender<String>,
    sessions: Arc<SessionManager>,
    history_path: PathBuf,
) {
    std::thread::spawn(move || {
        let config = Config::builder()
            .history_ignore_dups(true)
            .map(|builder| {
                builder
                    .auto_add_history(true)
                    .completion_type(CompletionType::List)
                    .build()
            })
            .unwrap_or_default();

        let mut rl = match Editor::with_config(config) {
            Ok(editor) => editor,
            Err(e) => {
                eprintln!("Failed to initialize line editor: {e}");
                let _ = tx.blocking_send("/quit".to_string());
                return;
            }
        };

        rl.set_helper(Some(ReplHelper));

        if let Some(parent) = history_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = rl.load_history(&history_path);

        loop {
            let prompt = if sessions.is_authorized() {
                "\x1b[32m\u{25CF}\x1b[0m \x1b[1;36m\u{203A}\x1b[0m "
            } else {
                "\x1b[90m\u{25CB}\x1b[0m \x1b[1;36m\u{203A}\x1b[0m "
            };

            match rl.readline(prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let quit = matches!(parse_input(line), ReplInput::Quit);
                    if tx.blocking_send(line.to_string()).is_err() || quit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl+C: cancel queued work
                    if tx.blocking_send("/cancel".to_string()).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Eof) => {
                    let _ = tx.blocking_send("/quit".to_string());
                    break;
                }
                Err(e) => {
                    eprintln!("Input error: {e}");
                    let _ = tx.blocking_send("/quit".to_string());
                    break;
                }
            }
        }

        let _ = rl.save_history(&history_path);
    });
}

/// Run the interactive loop until the operator quits.
pub async fn run(
    ctx: AppContext,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
) -> Result<(), ChannelError> {
    let debug = AtomicBool::new(false);

    println!("\x1b[1mPicoClaw\x1b[0m  /help for commands, /quit to exit");
    println!();

    resume(&ctx).await;
    eprintln!("  {}", format_session(&ctx.sessions.snapshot()));

    let (tx, mut lines) = mpsc::channel::<String>(32);
    spawn_input_thread(
        tx,
        Arc::clone(&ctx.sessions),
        ctx.config.repl.history_path.clone(),
    );

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    return Err(ChannelError::Disconnected {
                        name: "repl".to_string(),
                        reason: "input thread exited".to_string(),
                    });
                };
                if handle_input(&ctx, parse_input(&line), &debug) == Flow::Quit {
                    break;
                }
            }
            Some(event) = events.recv() => render_event(event, debug.load(Ordering::Relaxed)),
        }
    }

    tracing::info!("REPL exited");
    Ok(())
}

/// Send one message, print the answer and return. Used by `picoclaw -m`.
/// A one-shot message must be a task; session commands need the REPL.
fn single_task(message: &str) -> Result<(TaskMode, String), SubmitError> {
    match parse_input(message) {
        ReplInput::Submit { mode, payload } => Ok((mode, payload)),
        ReplInput::Invalid(reason) => Err(SubmitError::NotATask {
            input: message.trim().to_string(),
            reason,
        }),
        _ => Err(SubmitError::NotATask {
            input: message.trim().to_string(),
            reason: "only chat, /dev and /browse can be sent with -m; start the REPL for commands"
                .to_string(),
        }),
    }
}

pub async fn run_single(
    ctx: AppContext,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    message: &str,
) -> Result<(), Error> {
    let (mode, payload) = single_task(message)?;

    if let ResumeOutcome::Resumed(principal) = ctx.sessions.resume_session().await? {
        tracing::info!(%principal, "Using stored session");
    }

    let sequence = ctx.queue.submit(&payload, mode)?;

    while let Some(event) = events.recv().await {
        match event {
            TaskEvent::Delivered {
                sequence: s, text, ..
            } if s == sequence => {
                println!("{text}");
                return Ok(());
            }
            TaskEvent::Failed {
                sequence: s,
                failure,
            } if s == sequence => return Err(failure_to_error(failure)),
            _ => {}
        }
    }

    Err(Error::Channel(ChannelError::Disconnected {
        name: "queue".to_string(),
        reason: "task events closed before a reply arrived".to_string(),
    }))
}
