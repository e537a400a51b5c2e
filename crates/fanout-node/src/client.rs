//! Interactive line client.
//!
//! Prints every frame the host pushes and turns each stdin line into a send:
//!
//! - `@bob hello` sends a direct message to `bob`
//! - `#ops deploy done` broadcasts on channel `ops`
//! - anything else broadcasts on the default channel

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

/// Arguments for `fanout-node client`.
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Host to connect to (`host:port`).
    #[arg(long, default_value = "127.0.0.1:8444")]
    pub server: String,

    /// Account to connect as.
    #[arg(long)]
    pub account: String,
}

/// A send parsed from one input line.
#[derive(Debug, PartialEq, Eq)]
enum Outgoing {
    Direct { target: String, content: String },
    Broadcast { channel: Option<String>, content: String },
}

impl Outgoing {
    /// Endpoint path and JSON body for this send.
    fn request(&self, author: &str) -> (&'static str, Value) {
        match self {
            Self::Direct { target, content } => (
                "/direct_message",
                json!({
                    "sourceAccountId": author,
                    "targetAccountId": target,
                    "content": content,
                }),
            ),
            Self::Broadcast { channel, content } => (
                "/send_message",
                json!({
                    "channel": channel,
                    "author": author,
                    "content": content,
                }),
            ),
        }
    }
}

/// Split `@name text` / `#name text` into its parts.
fn addressed(rest: &str) -> Option<(String, String)> {
    let (name, content) = rest.split_once(char::is_whitespace)?;
    let content = content.trim();
    if name.is_empty() || content.is_empty() {
        return None;
    }
    Some((name.to_owned(), content.to_owned()))
}

fn parse_line(line: &str) -> Option<Outgoing> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (target, content) = addressed(rest)?;
        return Some(Outgoing::Direct { target, content });
    }
    if let Some(rest) = line.strip_prefix('#') {
        let (channel, content) = addressed(rest)?;
        return Some(Outgoing::Broadcast {
            channel: Some(channel),
            content,
        });
    }
    Some(Outgoing::Broadcast {
        channel: None,
        content: line.to_owned(),
    })
}

/// Run until stdin closes or the host drops the connection.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut request = format!("ws://{}/connect", args.server).into_client_request()?;
    let account = HeaderValue::from_str(&args.account).context("Invalid account id")?;
    let _ = request.headers_mut().insert("AccountId", account);

    let (ws, _) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {}", args.server))?;
    // Keep the write half alive so the socket is not half-closed.
    let (_sink, mut frames) = ws.split();

    let http = reqwest::Client::new();
    let base = format!("http://{}", args.server);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    info!("server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("WebSocket error"),
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let Some(outgoing) = parse_line(&line) else {
                    debug!("ignoring empty or incomplete line");
                    continue;
                };
                let (path, body) = outgoing.request(&args.account);
                match http.post(format!("{base}{path}")).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!(status = %resp.status(), "send rejected"),
                    Err(e) => warn!(error = %e, "send failed"),
                }
            }
        }
    }
    Ok(())
}
