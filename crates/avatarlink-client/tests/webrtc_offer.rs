//! Answering a real provider-style offer generated by a local peer.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use avatarlink_client::{
    classify, DefaultTransports, HeadlessSink, LifecycleState, MediaSinks, SessionController,
    SessionDescriptor, StartOutcome, TrackKind, TransportEvent, TransportFactory, TransportKind,
};
use common::MockBackend;

const START_PATH: &str = "/provider/proxy/streaming.start";
const ICE_PATH: &str = "/provider/proxy/streaming.ice";
const STOP_PATH: &str = "/provider/proxy/streaming.stop";

/// Stands in for the provider: a peer sending one video track.
struct OfferingPeer {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticSample>,
    offer_sdp: String,
}

async fn offering_peer() -> OfferingPeer {
    let mut m = MediaEngine::default();
    m.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(m).build();
    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();

    let video = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        "video".to_string(),
        "avatar".to_string(),
    ));
    pc.add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();

    let offer = pc.create_offer(None).await.unwrap();
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = gathered.recv().await;
    let offer_sdp = pc.local_description().await.unwrap().sdp;
    OfferingPeer {
        pc: Arc::new(pc),
        video,
        offer_sdp,
    }
}

/// Plays the provider's side against whatever the client posts to the mock
/// backend: applies the answer, takes trickled candidates, then streams video.
fn drive_provider(
    peer: &OfferingPeer,
    backend: MockBackend,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let pc = Arc::clone(&peer.pc);
    let video = Arc::clone(&peer.video);
    tokio::spawn(async move {
        let mut answered = false;
        let mut forwarded = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while !stop.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            if !answered {
                if let Some(start) = backend.calls_to(START_PATH).first() {
                    let sdp = start.body["sdp"]["sdp"].as_str().unwrap().to_string();
                    pc.set_remote_description(RTCSessionDescription::answer(sdp).unwrap())
                        .await
                        .unwrap();
                    answered = true;
                }
            }
            if answered {
                let candidates = backend.calls_to(ICE_PATH);
                for call in candidates.iter().skip(forwarded) {
                    let candidate: RTCIceCandidateInit =
                        serde_json::from_value(call.body["candidate"].clone()).unwrap();
                    let _ = pc.add_ice_candidate(candidate).await;
                }
                forwarded = candidates.len();

                let _ = video
                    .write_sample(&Sample {
                        data: vec![0u8; 64].into(),
                        duration: Duration::from_millis(20),
                        ..Default::default()
                    })
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

#[tokio::test]
async fn test_offer_session_answers_and_trickles_after_start() {
    let provider = offering_peer().await;
    let backend = MockBackend::spawn().await;
    let config = backend.config();

    let payload = json!({"data": {"session_id": "s2", "sdp": {"type": "offer", "sdp": provider.offer_sdp}}});
    let descriptor = classify(&payload).unwrap();
    assert!(matches!(descriptor, SessionDescriptor::Offer(_)));

    let factory = DefaultTransports::new(backend.http(&config), &config);
    let mut transport = factory.create(descriptor);
    assert_eq!(transport.kind(), TransportKind::RawWebRtc);

    let (tx, _rx) = mpsc::unbounded_channel();
    transport
        .establish(tx, MediaSinks::headless())
        .await
        .unwrap();

    let requests = backend.requests();
    let start_index = requests
        .iter()
        .position(|r| r.path == START_PATH)
        .expect("answer was not sent");
    let start = &requests[start_index];
    assert_eq!(start.body["session_id"], "s2");
    assert_eq!(start.body["sdp"]["type"], "answer");
    let answer = start.body["sdp"]["sdp"].as_str().unwrap();
    assert!(answer.starts_with("v=0"));
    assert!(answer.contains("m=video"));

    // Give the gatherer a moment, then check nothing was trickled early.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let requests = backend.requests();
    for (i, r) in requests.iter().enumerate() {
        if r.path == ICE_PATH {
            assert!(i > start_index, "candidate sent before the answer");
            assert_eq!(r.body["session_id"], "s2");
        }
    }

    transport.teardown().await.unwrap();
    transport.teardown().await.unwrap();
    assert_eq!(backend.calls_to(STOP_PATH).len(), 1);

    provider.pc.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_video_reaches_the_sink() {
    let provider = offering_peer().await;
    let backend = MockBackend::spawn().await;
    let config = backend.config();

    let payload = json!({"session_id": "s2", "sdp": provider.offer_sdp.clone()});
    let factory = DefaultTransports::new(backend.http(&config), &config);
    let mut transport = factory.create(classify(&payload).unwrap());

    let video = Arc::new(HeadlessSink::new("video"));
    let audio = Arc::new(HeadlessSink::new("audio"));
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive_provider(&provider, backend.clone(), Arc::clone(&stop));

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .establish(tx, MediaSinks::new(video.clone(), audio.clone()))
        .await
        .unwrap();

    let ready = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Some(TransportEvent::MediaReady(track)) => break track,
                Some(_) => continue,
                None => panic!("transport closed before media"),
            }
        }
    })
    .await
    .expect("no remote track arrived");
    assert_eq!(ready.kind, TrackKind::Video);
    assert_eq!(video.attach_count(), 1);
    assert_eq!(audio.attach_count(), 0);

    stop.store(true, Ordering::SeqCst);
    driver.await.unwrap();
    transport.teardown().await.unwrap();
    assert_eq!(video.detach_count(), 1);

    provider.pc.close().await.unwrap();
}

#[tokio::test]
async fn test_controller_activates_offer_session() {
    let provider = offering_peer().await;
    let backend = MockBackend::spawn().await;
    backend.respond_json(
        "/provider/token",
        200,
        json!({"data": {"session_id": "s2", "sdp": {"type": "offer", "sdp": provider.offer_sdp}}}),
    );
    let mut config = backend.config();
    config.media_timeout = Duration::from_secs(15);

    let video = Arc::new(HeadlessSink::new("video"));
    let audio = Arc::new(HeadlessSink::new("audio"));
    let controller =
        SessionController::from_config(&config, MediaSinks::new(video.clone(), audio), None)
            .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive_provider(&provider, backend.clone(), Arc::clone(&stop));

    let outcome = controller.start().await.unwrap();
    assert_eq!(
        outcome,
        StartOutcome::Started {
            session_id: Some("s2".into()),
            transport: TransportKind::RawWebRtc,
        }
    );
    assert_eq!(controller.state(), LifecycleState::Active);
    assert_eq!(video.attach_count(), 1);

    stop.store(true, Ordering::SeqCst);
    driver.await.unwrap();
    controller.end().await;
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(backend.calls_to(STOP_PATH).len(), 1);
    assert_eq!(video.detach_count(), 1);

    provider.pc.close().await.unwrap();
}
