use anyhow::Result;
use clap::{Parser, Subcommand};
use console_proto::{AckRequest, ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "quarterdeck")]
#[command(about = "Operator console gateway and debug tail client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Tail a pod's log through a running gateway and print the lines
    Tail {
        /// Gateway URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Namespace of the pod
        #[arg(short, long)]
        namespace: String,

        /// Pod whose log to tail
        #[arg(short, long)]
        pod: String,

        /// Container within the pod (defaults to the pod's first container)
        #[arg(short, long)]
        container: Option<String>,
    },
}

pub async fn run_tail_client(
    url: String,
    namespace: String,
    pod: String,
    container: Option<String>,
) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the gateway running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let subscribe = ClientMessage::SubscribeLogs {
        namespace: namespace.clone(),
        pod_name: pod.clone(),
        container,
    };
    let subscribe_text = serde_json::to_string(&subscribe)?;
    write.send(Message::Text(subscribe_text.into())).await?;

    // Print lines until the stream ends or fails. The subscription ack may
    // arrive after the historical lines; a failed ack ends the client.
    while let Some(msg) = read.next().await {
        let msg = msg?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ServerMessage>(&text)? {
            ServerMessage::Ack {
                request: AckRequest::SubscribeLogs,
                success,
                error,
                ..
            } => {
                if !success {
                    let reason = error.unwrap_or_else(|| "unknown error".to_string());
                    error!("Subscription rejected: {}", reason);
                    return Err(anyhow::anyhow!("Subscription rejected: {}", reason));
                }
                debug!("Subscribed to {}/{}", namespace, pod);
            }
            ServerMessage::LogLine { line, .. } => println!("{}", line),
            ServerMessage::LogError {
                error: stream_error,
                ..
            } => {
                error!("Log stream failed: {}", stream_error);
                return Err(anyhow::anyhow!("Log stream failed: {}", stream_error));
            }
            ServerMessage::LogEnd { .. } => {
                debug!("Log stream ended");
                break;
            }
            ServerMessage::Error { message } => {
                error!("Gateway rejected request: {}", message);
                return Err(anyhow::anyhow!("Gateway rejected request: {}", message));
            }
            _ => {}
        }
    }

    Ok(())
}
