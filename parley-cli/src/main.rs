//! parley-cli: terminal client for the Parley chat session API
//!
//! Every request carries `X-User-ID` from `--user` / `PARLEY_USER`.
//!
//! # Subcommands
//! - `chat <message> [--session ID] [--model M] [--json]`: send one message
//! - `sessions [--page N] [--size N] [--json]`: list your sessions
//! - `history <session-id> [--page N] [--size N]`: show a session's messages
//! - `abort <session-id>`: abort the in-flight generation of a session
//! - `status`: show server health

use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const DEFAULT_USER: &str = "local";
const DEFAULT_PAGE_SIZE: u32 = 20;
const USER_HEADER: &str = "X-User-ID";
const PREVIEW_CHARS: usize = 60;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "parley-cli", version, about = "Parley chat sessions from the terminal")]
struct Cli {
    /// Parley HTTP server URL (overrides PARLEY_HTTP_URL env var)
    #[arg(long, env = "PARLEY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Caller identity sent as X-User-ID
    #[arg(long, env = "PARLEY_USER", default_value = DEFAULT_USER)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a message; starts a new session unless --session is given
    Chat {
        message: String,

        #[arg(short, long)]
        session: Option<String>,

        #[arg(short, long)]
        model: Option<String>,

        /// Print the raw response data as JSON
        #[arg(long)]
        json: bool,
    },

    /// List sessions, most recently updated first
    Sessions {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        size: u32,

        #[arg(long)]
        json: bool,
    },

    /// Show the messages of a session in order
    History {
        session_id: String,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        size: u32,
    },

    /// Abort the in-flight generation of a session
    Abort { session_id: String },

    /// Show Parley server health
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

/// `{code, message, data}` wrapper every endpoint answers with.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub session_id: String,
    pub message: String,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub pinned: bool,
    pub archived: bool,
    pub message_count: i64,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub role: String,
    pub content: String,
    pub sequence: i64,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page_no: u32,
    pub page_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct AbortReply {
    pub aborted: bool,
}

// ============================================================================
// Formatting
// ============================================================================

/// First non-empty line, capped at `max` characters with a trailing ellipsis.
pub fn preview(text: &str, max: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max).collect();
    cut.push('…');
    cut
}

/// One line per session: markers, id, title, message count.
pub fn format_session_line(s: &SessionSummary) -> String {
    let pin = if s.pinned { '*' } else { ' ' };
    let archived = if s.archived { " [archived]" } else { "" };
    format!(
        "{} {}  {} ({} msgs, {}){}",
        pin,
        s.id,
        preview(&s.title, PREVIEW_CHARS),
        s.message_count,
        s.model,
        archived
    )
}

pub fn format_message(m: &MessageEntry) -> String {
    match &m.error {
        Some(err) => format!("#{} [{}] (failed: {})\n{}", m.sequence, m.role, err, m.content),
        None => format!("#{} [{}]\n{}", m.sequence, m.role, m.content),
    }
}

/// Number of pages needed for `total` items; at least 1.
pub fn page_count(total: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 1;
    }
    total.div_ceil(page_size as u64).max(1)
}

/// Unwrap an envelope, turning non-2xx codes or missing data into an error.
pub fn into_data<T>(envelope: Envelope<T>) -> anyhow::Result<T> {
    if !(200..300).contains(&envelope.code) {
        return Err(anyhow!("{} (code {})", envelope.message, envelope.code));
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("response had no data (code {})", envelope.code))
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: Client,
    server: String,
    user: String,
}

impl Api {
    fn new(server: &str, user: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            user: user.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).header(USER_HEADER, &self.user)
    }

    fn post(&self, path: &str, body: &Value) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .header(USER_HEADER, &self.user)
            .json(body)
    }

    /// Send and decode the envelope. Error statuses still carry an envelope,
    /// so the body is parsed before the status is looked at.
    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let resp = request
            .send()
            .with_context(|| format!("connection failed to {}", self.server))?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        let envelope: Envelope<T> = serde_json::from_str(&text)
            .with_context(|| format!("server returned {}: {}", status, text))?;
        into_data(envelope)
    }
}

fn do_chat(
    api: &Api,
    message: &str,
    session: Option<&str>,
    model: Option<&str>,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut body = json!({ "message": message });
    if let Some(model) = model {
        body["model"] = json!(model);
    }

    let request = match session {
        Some(id) => api.post(&format!("/api/v1/chat/sessions/{}/messages", id), &body),
        None => api.post("/api/v1/chat", &body),
    };

    if json_output {
        let data: Value = api.send(request)?;
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let reply: ChatReply = api.send(request)?;
    println!("{}", reply.message);
    eprintln!(
        "\n[session {} | {} | {} tokens ({} in, {} out)]",
        reply.session_id,
        reply.model,
        reply.usage.total_tokens,
        reply.usage.prompt_tokens,
        reply.usage.completion_tokens
    );
    Ok(())
}

fn do_sessions(api: &Api, page: u32, size: u32, json_output: bool) -> anyhow::Result<()> {
    let path = format!("/api/v1/chat/sessions?pageNo={}&pageSize={}", page, size);

    if json_output {
        let data: Value = api.send(api.get(&path))?;
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let result: Page<SessionSummary> = api.send(api.get(&path))?;
    if result.items.is_empty() {
        eprintln!("No sessions.");
        return Ok(());
    }
    for s in &result.items {
        println!("{}", format_session_line(s));
    }
    eprintln!(
        "\npage {}/{} ({} sessions)",
        result.page_no,
        page_count(result.total, result.page_size),
        result.total
    );
    Ok(())
}

fn do_history(api: &Api, session_id: &str, page: u32, size: u32) -> anyhow::Result<()> {
    let path = format!(
        "/api/v1/chat/sessions/{}/messages?pageNo={}&pageSize={}",
        session_id, page, size
    );
    let result: Page<MessageEntry> = api.send(api.get(&path))?;
    if result.items.is_empty() {
        eprintln!("No messages.");
        return Ok(());
    }
    for m in &result.items {
        println!("{}\n", format_message(m));
    }
    eprintln!(
        "page {}/{} ({} messages)",
        result.page_no,
        page_count(result.total, result.page_size),
        result.total
    );
    Ok(())
}

fn do_abort(api: &Api, session_id: &str) -> anyhow::Result<()> {
    let reply: AbortReply = api.send(api.post(
        "/api/v1/chat/abort",
        &json!({ "sessionId": session_id }),
    ))?;
    if reply.aborted {
        println!("Aborted generation in {}", session_id);
    } else {
        println!("Nothing in flight for {}", session_id);
    }
    Ok(())
}

/// Show the server health by calling GET /health.
fn do_status(api: &Api) -> anyhow::Result<()> {
    let report: Value = api.send(api.get("/health"))?;
    println!("Parley server: {}", report["status"].as_str().unwrap_or("unknown"));
    println!("Version:       {}", report["version"].as_str().unwrap_or("?"));
    println!("Uptime:        {}", report["uptime"].as_str().unwrap_or("?"));
    println!(
        "Database:      {}",
        report["dependencies"]["database"].as_str().unwrap_or("?")
    );
    println!(
        "Generation:    {}",
        report["dependencies"]["genkit"].as_str().unwrap_or("?")
    );

    if report["status"] != "healthy" {
        std::process::exit(1);
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    // Generation can take a while; everything else answers quickly.
    let timeout = match cli.command {
        Commands::Chat { .. } => Duration::from_secs(300),
        _ => Duration::from_secs(10),
    };

    let result = Api::new(&cli.server, &cli.user, timeout).and_then(|api| match cli.command {
        Commands::Chat {
            message,
            session,
            model,
            json,
        } => do_chat(&api, &message, session.as_deref(), model.as_deref(), json),
        Commands::Sessions { page, size, json } => do_sessions(&api, page, size, json),
        Commands::History {
            session_id,
            page,
            size,
        } => do_history(&api, &session_id, page, size),
        Commands::Abort { session_id } => do_abort(&api, &session_id),
        Commands::Status => do_status(&api),
    });

    if let Err(e) = result {
        eprintln!("parley-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
