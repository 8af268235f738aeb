use std::time::Duration;

use callbox_client::media::{LocalMedia, MediaAccess, TrackKind};
use callbox_client::peer::webrtc::WebRtcPeerFactory;
use callbox_client::peer::{
    PeerEvent, PeerEventKind, PeerEventSink, PeerTransport, PeerTransportFactory,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Peer {
    transport: Box<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    media: LocalMedia,
}

async fn peer(call: u64) -> Peer {
    let mut media = LocalMedia::acquire(MediaAccess::Granted);
    media.start_source();
    let factory = WebRtcPeerFactory::new(&[])
        .expect("factory builds")
        .with_local_tracks(media.tracks());
    let (tx, events) = mpsc::unbounded_channel();
    let transport = factory
        .create(PeerEventSink::new(call, tx))
        .await
        .expect("peer connection builds");
    Peer {
        transport,
        events,
        media,
    }
}

#[test_timeout::tokio_timeout_test(45)]
async fn synthetic_media_reaches_the_other_side() {
    let Peer {
        transport: caller,
        events: mut caller_events,
        media: caller_media,
    } = peer(1).await;
    let Peer {
        transport: callee,
        events: mut callee_events,
        media: callee_media,
    } = peer(2).await;

    let offer = caller.create_offer().await.expect("offer");
    callee
        .set_remote_description(offer)
        .await
        .expect("callee installs offer");
    let answer = callee.create_answer().await.expect("answer");
    assert!(answer.sdp.contains("a=sendrecv"));
    caller
        .set_remote_description(answer)
        .await
        .expect("caller installs answer");

    let mut caller_media_seen = None;
    let mut callee_media_seen = None;
    let exchanged = timeout(Duration::from_secs(30), async {
        while caller_media_seen.is_none() || callee_media_seen.is_none() {
            tokio::select! {
                Some(event) = caller_events.recv() => match event.kind {
                    PeerEventKind::LocalCandidate(candidate) => {
                        callee.add_ice_candidate(candidate).await.expect("callee adds candidate");
                    }
                    PeerEventKind::RemoteMedia(media) => caller_media_seen = Some(media),
                    PeerEventKind::StateChanged(_) => {}
                },
                Some(event) = callee_events.recv() => match event.kind {
                    PeerEventKind::LocalCandidate(candidate) => {
                        caller.add_ice_candidate(candidate).await.expect("caller adds candidate");
                    }
                    PeerEventKind::RemoteMedia(media) => callee_media_seen = Some(media),
                    PeerEventKind::StateChanged(_) => {}
                },
            }
        }
    })
    .await;
    assert!(exchanged.is_ok(), "remote media never arrived");

    let caller_seen = caller_media_seen.expect("caller saw media");
    assert_eq!(caller_seen.stream_id, "callbox-local");
    assert!(matches!(caller_seen.kind, TrackKind::Audio | TrackKind::Video));
    assert!(callee_media_seen.is_some());
    assert!(caller_media.frames_written(TrackKind::Audio) > 0);
    assert!(callee_media.frames_written(TrackKind::Video) > 0);

    caller.close().await;
    callee.close().await;
}
