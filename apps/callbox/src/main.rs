use std::sync::Arc;

use anyhow::Context;
use callbox_client::call::{CallEvent, EndReason};
use callbox_client::chat::Direction;
use callbox_client::config::{ClientArgs, ClientConfig};
use callbox_client::logging;
use callbox_client::media::{LocalMedia, TrackKind};
use callbox_client::peer::webrtc::WebRtcPeerFactory;
use callbox_client::session::{ClientSession, SessionCommand, SessionEvent, SessionHandle};
use callbox_client::signaling::ConnectionStatus;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  /call <id>    call a peer
  /wait <id>    chat with a peer without calling
  /hangup       end the current call
  /audio        toggle the microphone
  /video        toggle the camera
  /id [new-id]  switch identity (random when omitted)
  /quit         leave
anything else is sent as a chat message";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    let config = ClientConfig::from_args(&args).context("invalid configuration")?;
    logging::init(&config.log).context("failed to initialise logging")?;

    let media = LocalMedia::acquire(config.media.clone());
    let factory = WebRtcPeerFactory::new(&config.ice_servers)
        .context("failed to set up WebRTC")?
        .with_local_tracks(media.tracks());
    let (session, mut events) =
        ClientSession::connect_with_media(&config, Arc::new(factory), media)
            .await
            .with_context(|| format!("could not reach the relay at {}", config.relay_url))?;

    println!("your identity: {}", session.identity());
    println!("type /help for commands");
    let handle = session.spawn();

    let lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(lines, handle, &mut events).await
}

/// Feeds prompt lines to the session and prints its events until either side
/// stops. The session is always shut down before returning, also when
/// reading input fails.
async fn prompt<R>(
    mut lines: Lines<R>,
    handle: SessionHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let outcome = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(anyhow::Error::new(err).context("failed to read stdin")),
                };
                match parse_line(&line) {
                    Ok(Some(SessionCommand::Shutdown)) => break Ok(()),
                    Ok(Some(command)) => {
                        if !handle.send(command) {
                            break Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
            event = events.recv() => match event {
                Some(event) => {
                    let text = render(&event);
                    if !text.is_empty() {
                        println!("{text}");
                    }
                }
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    handle.shutdown().await;
    outcome
}

fn parse_line(line: &str) -> Result<Option<SessionCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(SessionCommand::Chat(line.to_string())));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let command = match (name, argument) {
        ("call", "") | ("wait", "") => return Err(format!("usage: /{name} <id>")),
        ("call", remote) => SessionCommand::Call(remote.to_string()),
        ("wait", remote) => SessionCommand::AwaitPeer(remote.to_string()),
        ("hangup", _) => SessionCommand::Hangup,
        ("audio", _) => SessionCommand::Toggle(TrackKind::Audio),
        ("video", _) => SessionCommand::Toggle(TrackKind::Video),
        ("id", "") => SessionCommand::RenewIdentity(None),
        ("id", identity) => SessionCommand::RenewIdentity(Some(identity.to_string())),
        ("quit", _) | ("exit", _) => SessionCommand::Shutdown,
        ("help", _) => return Err(HELP.to_string()),
        _ => return Err(format!("unknown command /{name}; type /help")),
    };
    Ok(Some(command))
}

fn render(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connection(status) => match status {
            ConnectionStatus::Connecting => "* connecting to relay".into(),
            ConnectionStatus::Ready { identity } => format!("* ready as {identity}"),
            ConnectionStatus::Disconnected => "* relay connection lost".into(),
            ConnectionStatus::Reconnecting { attempt } => {
                format!("* reconnecting (attempt {attempt})")
            }
            ConnectionStatus::GaveUp { attempts } => {
                format!("* gave up on the relay after {attempts} attempts")
            }
        },
        SessionEvent::Call(event) => match event {
            CallEvent::PhaseChanged { phase, remote } => match remote {
                Some(remote) => format!("* {phase} ({remote})"),
                None => format!("* {phase}"),
            },
            CallEvent::Connected { remote, .. } => format!("* in a call with {remote}"),
            CallEvent::Ended { remote, reason } => match reason {
                EndReason::LocalHangup => format!("* call with {remote} ended"),
                EndReason::TransportLost(state) => {
                    format!("* call with {remote} dropped ({state})")
                }
                EndReason::NegotiationFailed(error) => {
                    format!("* call with {remote} failed: {error}")
                }
                EndReason::Superseded => format!("* answering {remote}'s call instead"),
            },
            CallEvent::OfferIgnored { from } => format!("* busy; ignored a call from {from}"),
            CallEvent::CandidateDiscarded { .. } => String::new(),
        },
        SessionEvent::Chat(entry) => match entry.direction {
            Direction::Outgoing => format!("me: {}", entry.text),
            Direction::Incoming => format!("{}: {}", entry.from, entry.text),
        },
        SessionEvent::Media { kind, enabled } => {
            format!("* {kind} {}", if *enabled { "on" } else { "off" })
        }
        SessionEvent::Identity(identity) => format!("* your identity is now {identity}"),
        SessionEvent::StandbyPeer(remote) => format!("* chatting with {remote}"),
        SessionEvent::Rejected(reason) => format!("! {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};

    use callbox_client::call::CandidatePolicy;
    use callbox_client::logging::LogConfig;
    use callbox_client::media::MediaAccess;
    use callbox_client::peer::mock::MockPeerFactory;
    use callbox_client::signaling::ReconnectPolicy;
    use callbox_relay::{ConnectionRegistry, RelayState};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::error::TryRecvError;
    use url::Url;

    /// Input whose every read fails.
    struct BrokenInput;

    impl AsyncRead for BrokenInput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("terminal went away")))
        }
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn input_errors_still_shut_the_session_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        tokio::spawn(callbox_relay::serve(
            listener,
            RelayState::new(ConnectionRegistry::new()),
        ));

        let config = ClientConfig {
            relay_url: Url::parse(&format!("ws://{addr}/")).expect("relay url"),
            identity: "sun-star-3".into(),
            reconnect: ReconnectPolicy::default(),
            ice_servers: Vec::new(),
            candidate_policy: CandidatePolicy::Discard,
            media: MediaAccess::Granted,
            log: LogConfig::default(),
        };
        let factory = Arc::new(MockPeerFactory::new("sun-star-3"));
        let (session, mut events) = ClientSession::connect(&config, factory)
            .await
            .expect("session connects");
        let handle = session.spawn();

        let result = prompt(BufReader::new(BrokenInput).lines(), handle, &mut events).await;
        let err = result.expect_err("read error is returned");
        assert!(format!("{err:#}").contains("terminal went away"));

        // The session task already finished, so its event sender is gone.
        loop {
            match events.try_recv() {
                Ok(_) => continue,
                Err(err) => {
                    assert_eq!(err, TryRecvError::Disconnected);
                    break;
                }
            }
        }
    }

    #[test_timeout::timeout]
    fn prompt_lines_become_commands() {
        assert_eq!(parse_line("  "), Ok(None));
        assert_eq!(
            parse_line("hello there"),
            Ok(Some(SessionCommand::Chat("hello there".into())))
        );
        assert_eq!(
            parse_line("/call calm-ocean-7"),
            Ok(Some(SessionCommand::Call("calm-ocean-7".into())))
        );
        assert_eq!(
            parse_line("/id"),
            Ok(Some(SessionCommand::RenewIdentity(None)))
        );
        assert_eq!(
            parse_line("/video"),
            Ok(Some(SessionCommand::Toggle(TrackKind::Video)))
        );
        assert!(parse_line("/call").is_err());
        assert!(parse_line("/dance").is_err());
    }
}
