use anyhow::{anyhow, Result};
use callbox_proto::{ClientEnvelope, RelayEnvelope};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "callbox-relay")]
#[command(about = "Callbox signaling relay and connectivity probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay, register, and wait for the acknowledgment
    Probe {
        /// Relay URL (e.g., ws://localhost:3001)
        #[arg(short, long, default_value = "ws://localhost:3001")]
        url: String,

        /// Identity to register with; a throwaway one is used when omitted
        #[arg(long)]
        user_id: Option<String>,

        /// Seconds to wait for the connection and for the acknowledgment
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

/// Result of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub url: String,
    pub identity: String,
}

pub async fn run_probe(url: &str, user_id: Option<String>, timeout_secs: u64) -> Result<ProbeReport> {
    let wait = Duration::from_secs(timeout_secs.max(1));
    let identity = user_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("probe-{}", &id[..8])
    });
    debug!("Probing {} as {}", url, identity);

    let (ws_stream, _) = match timeout(wait, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!(
                "Connection timeout - is the relay running at {}?",
                url
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let register = serde_json::to_string(&ClientEnvelope::Register {
        user_id: identity.clone(),
    })?;
    write.send(Message::Text(register.into())).await?;

    let acknowledged = timeout(wait, async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                match RelayEnvelope::parse(text.as_str()) {
                    Ok(RelayEnvelope::Registered { user_id }) if user_id == identity => {
                        return Ok::<_, anyhow::Error>(user_id);
                    }
                    Ok(other) => debug!("Ignoring {} while probing", other.kind()),
                    Err(e) => debug!("Ignoring unparsable frame while probing: {}", e),
                }
            }
        }
        Err(anyhow!("Connection closed before registration was acknowledged"))
    })
    .await;

    let identity = match acknowledged {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("Relay did not acknowledge registration in time")),
    };

    write.send(Message::Close(None)).await?;

    Ok(ProbeReport {
        url: url.to_string(),
        identity,
    })
}
