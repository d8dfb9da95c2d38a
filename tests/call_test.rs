// author: kodeholic (powered by Claude)
//
// 참여자 엔진 통합 테스트: LocalChannel + loopback 미디어로 한 프로세스 안에서 통화 2자 구성

use std::sync::Arc;
use std::time::Duration;

use televisit_signal::call::{
    join_session, negotiate_role, resolve, Appointment, CallConfig, CallDeps, CallPhase,
    CleanupPolicy, EndReason, NegotiationPolicy, ParticipantSession, StaticDirectory,
};
use televisit_signal::core::{Role, SessionDescription, SessionKey, SessionStore};
use televisit_signal::error::{CallError, DeviceFault};
use televisit_signal::media::{LoopbackDevices, LoopbackFactory, LoopbackNetwork, TrackKind};
use televisit_signal::reaper::reap_once;
use televisit_signal::signaling::{LocalChannel, SignalingChannel};
use televisit_signal::trace::TraceHub;

const WAIT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// [테스트 헬퍼]
// ----------------------------------------------------------------------------

fn key() -> SessionKey {
    SessionKey::new("H01", "APT1")
}

fn directory() -> StaticDirectory {
    let dir = StaticDirectory::new();
    dir.insert(Appointment {
        room_id:      "H01".into(),
        call_id:      "APT1".into(),
        clinician_id: "dr_kim".into(),
        patient_id:   "pt_lee".into(),
    });
    dir
}

fn quick_config() -> CallConfig {
    CallConfig {
        negotiation: NegotiationPolicy { max_attempts: 3, retry_backoff_ms: 5 },
        ..CallConfig::default()
    }
}

struct Participant {
    session: ParticipantSession,
    devices: Arc<LoopbackDevices>,
    peers:   Arc<LoopbackFactory>,
}

fn enter(store: &Arc<SessionStore>, identity: &str, devices: LoopbackDevices, peers: LoopbackFactory) -> Participant {
    let ctx = resolve(&directory(), &key(), identity).unwrap();
    let devices = Arc::new(devices);
    let peers = Arc::new(peers);
    let deps = CallDeps::new(
        Arc::new(LocalChannel::new(Arc::clone(store))),
        devices.clone(),
        peers.clone(),
    )
    .with_config(quick_config());

    Participant { session: join_session(ctx, deps), devices, peers }
}

/// 한 진료실: 공유 저장소 + 양쪽 peer 가 만나는 loopback 네트워크
struct Clinic {
    store:   Arc<SessionStore>,
    network: Arc<LoopbackNetwork>,
}

impl Clinic {
    fn new() -> Self {
        Self { store: Arc::new(SessionStore::new()), network: LoopbackNetwork::new() }
    }

    fn clinician(&self) -> Participant {
        let peers = LoopbackFactory::new().with_sdp("v=0...A").with_candidates(3).on_network(&self.network);
        enter(&self.store, "dr_kim", LoopbackDevices::new(), peers)
    }

    fn patient(&self) -> Participant {
        let peers = LoopbackFactory::new().with_sdp("v=0...B").with_candidates(3).on_network(&self.network);
        enter(&self.store, "pt_lee", LoopbackDevices::new(), peers)
    }
}

fn offer_published(store: &Arc<SessionStore>) -> impl Fn() -> bool {
    let s = Arc::clone(store);
    move || s.get(&key()).map(|r| r.offer.is_some()).unwrap_or(false)
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("조건 대기 타임아웃");
}

async fn wait_phase(p: &Participant, pred: impl Fn(&CallPhase) -> bool) -> CallPhase {
    tokio::time::timeout(WAIT, p.session.wait_for_phase(pred))
        .await
        .expect("phase 대기 타임아웃")
}

/// A 가 먼저 claim 해서 offerer, B 가 answerer 가 되도록 순서를 고정하고 Connected 까지
async fn connect_pair(store: &Arc<SessionStore>, a: &Participant, b: &Participant) {
    let first = a.session.clone();
    let join_a = tokio::spawn(async move { first.join_call().await });

    // 이전 통화 잔재가 아니라 A 가 새로 만든 레코드가 보일 때까지
    let s = Arc::clone(store);
    let offerer = a.session.context().identity.clone();
    wait_until(move || {
        s.get(&key())
            .map(|r| r.initiator_id == offerer && r.answer.is_none())
            .unwrap_or(false)
    })
    .await;

    b.session.join_call().await.expect("answerer join 실패");
    join_a.await.unwrap().expect("offerer join 실패");

    assert_eq!(wait_phase(a, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
    assert_eq!(wait_phase(b, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
}

// ----------------------------------------------------------------------------
// [역할 협상]
// ----------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_negotiators_yield_one_offerer_one_answerer() {
    let store = Arc::new(SessionStore::new());
    let policy = NegotiationPolicy { max_attempts: 2, retry_backoff_ms: 1 };

    let mut handles = Vec::new();
    for i in 0..8 {
        let channel = LocalChannel::new(Arc::clone(&store));
        handles.push(tokio::spawn(async move {
            negotiate_role(&channel, &key(), &format!("user_{}", i), &policy).await
        }));
    }

    let mut offerers = 0;
    let mut answerers = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(n) if n.role == Role::Offerer  => offerers += 1,
            Ok(_)                             => answerers += 1,
            Err(CallError::RoleConflict(_))   => conflicts += 1,
            Err(e) => panic!("예상 밖 에러: {:?}", e),
        }
    }

    assert_eq!(offerers, 1);
    assert_eq!(answerers, 1);
    assert_eq!(conflicts, 6);
    assert_eq!(store.count(), 1);
}

#[tokio::test]
async fn leftover_from_previous_call_is_replaced() {
    let clinic = Clinic::new();
    let store = &clinic.store;

    // 이전 통화가 정리되지 않은 채 남음
    store.claim(&key(), "dr_kim");
    store.claim(&key(), "pt_lee");
    store.set_offer(&key(), SessionDescription::offer("v=0 old offer")).unwrap();
    store.set_answer(&key(), SessionDescription::answer("v=0 old answer")).unwrap();
    let old_nonce = store.get(&key()).unwrap().nonce;

    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    let record = store.get(&key()).unwrap();
    assert_ne!(record.nonce, old_nonce);
    assert_eq!(record.offer.unwrap().sdp, "v=0...A");
    assert_eq!(record.answer.unwrap().sdp, "v=0...B");
}

// ----------------------------------------------------------------------------
// [전체 통화]
// ----------------------------------------------------------------------------

#[tokio::test]
async fn two_parties_reach_connected() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();

    connect_pair(store, &a, &b).await;

    assert_eq!(a.session.role(), Some(Role::Offerer));
    assert_eq!(b.session.role(), Some(Role::Answerer));
    assert!(a.session.remote_present());
    assert!(b.session.remote_present());

    let record = store.get(&key()).unwrap();
    assert_eq!(record.initiator_id, "dr_kim");
    assert_eq!(record.answerer_id.as_deref(), Some("pt_lee"));
    assert_eq!(record.offer.unwrap().sdp, "v=0...A");
    assert_eq!(record.answer.unwrap().sdp, "v=0...B");

    // 각 peer 는 자기 트랙 2개를 부착하고 상대 description 을 적용
    let pa = a.peers.last_peer().unwrap();
    let pb = b.peers.last_peer().unwrap();
    assert_eq!(pa.track_count(), 2);
    assert_eq!(pb.track_count(), 2);
    assert_eq!(pa.remote_description().unwrap().sdp, "v=0...B");
    assert_eq!(pb.remote_description().unwrap().sdp, "v=0...A");
}

#[tokio::test]
async fn candidates_arrive_in_append_order_without_early_apply() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    let pa = a.peers.last_peer().unwrap();
    let pb = b.peers.last_peer().unwrap();
    wait_until(|| pa.applied_candidates().len() == 3 && pb.applied_candidates().len() == 3).await;

    let doc = store.snapshot(&key()).unwrap();
    assert_eq!(pb.applied_candidates(), doc.offerer_candidates);
    assert_eq!(pa.applied_candidates(), doc.answerer_candidates);

    // remote description 전에 적용 시도된 candidate 없음
    assert_eq!(pa.early_candidates(), 0);
    assert_eq!(pb.early_candidates(), 0);
}

#[tokio::test]
async fn toggles_keep_phase_and_never_reacquire() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    let media = a.session.local_media().await.unwrap();
    assert!(!a.session.toggle_mic());
    assert!(!a.session.toggle_camera());

    assert!(!media.track(TrackKind::Audio).unwrap().is_enabled());
    assert!(!media.track(TrackKind::Video).unwrap().is_enabled());
    assert_eq!(a.session.phase(), CallPhase::Connected);
    assert_eq!(a.devices.acquisitions(), 1);
    assert_eq!(a.peers.peers().len(), 1);
}

// ----------------------------------------------------------------------------
// [장치 실패]
// ----------------------------------------------------------------------------

#[tokio::test]
async fn denied_devices_never_touch_shared_state() {
    let store = Arc::new(SessionStore::new());
    let p = enter(&store, "pt_lee", LoopbackDevices::failing(DeviceFault::PermissionDenied), LoopbackFactory::new());

    let err = p.session.join_call().await.unwrap_err();
    assert_eq!(err, CallError::DeviceAcquisition(DeviceFault::PermissionDenied));
    assert_eq!(p.session.phase(), CallPhase::Terminated(EndReason::DeviceFailure(DeviceFault::PermissionDenied)));
    assert_eq!(store.count(), 0);
    assert!(p.peers.peers().is_empty());
}

#[tokio::test]
async fn stranger_is_rejected_before_any_activity() {
    let err = resolve(&directory(), &key(), "intruder").unwrap_err();
    assert!(matches!(err, CallError::Authorization(_)));
}

// ----------------------------------------------------------------------------
// [종료/정리]
// ----------------------------------------------------------------------------

#[tokio::test]
async fn leave_during_acquisition_cancels_it() {
    let store = Arc::new(SessionStore::new());
    let p = enter(
        &store,
        "pt_lee",
        LoopbackDevices::new().with_delay(Duration::from_millis(200)),
        LoopbackFactory::new(),
    );

    p.session.leave().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(p.devices.issued().is_empty());
    assert!(p.session.local_media().await.is_err());
    assert_eq!(p.session.phase(), CallPhase::Terminated(EndReason::LocalLeave));
}

#[tokio::test]
async fn leave_after_acquisition_stops_every_track() {
    let p = Clinic::new().patient();
    p.session.local_media().await.unwrap();

    let report = p.session.leave().await;
    assert_eq!(report.released_local, 2);
    assert!(p.devices.issued().iter().all(|t| t.is_stopped()));
}

#[tokio::test]
async fn one_sided_patient_leave_leaves_nothing_behind() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let p = clinic.patient();

    let session = p.session.clone();
    let join = tokio::spawn(async move { session.join_call().await });
    wait_until(offer_published(store)).await;

    let report = p.session.leave().await;
    assert!(report.deleted_shared);
    assert!(report.closed_peer);
    assert!(join.await.unwrap().is_err());
    assert_eq!(store.count(), 0);
    assert!(p.peers.last_peer().unwrap().is_closed());
}

#[tokio::test]
async fn authority_leave_ends_the_other_side() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    let report = a.session.leave().await;
    assert!(report.deleted_shared);
    assert_eq!(report.released_local, 2);

    let phase = wait_phase(&b, CallPhase::is_terminated).await;
    assert_eq!(phase, CallPhase::Terminated(EndReason::RemoteEnded));
    assert_eq!(store.count(), 0);

    // 두 번째 leave 는 아무것도 하지 않음
    assert!(!a.session.leave().await.deleted_shared);
    wait_until(|| b.peers.last_peer().unwrap().is_closed()).await;
}

#[tokio::test]
async fn non_authority_leave_ends_call_and_clinician_reclaims() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    // 환자는 공유 상태를 지우지 않지만 연결이 끊기므로 의사 쪽도 종료
    let report = b.session.leave().await;
    assert!(!report.deleted_shared);

    let phase = wait_phase(&a, CallPhase::is_terminated).await;
    assert_eq!(phase, CallPhase::Terminated(EndReason::RemoteEnded));
    wait_until(|| a.peers.last_peer().unwrap().is_closed()).await;

    // 권한 측 teardown 이 세션을 회수
    let s = Arc::clone(store);
    wait_until(move || s.count() == 0).await;
    assert!(!a.session.leave().await.deleted_shared);
}

#[tokio::test]
async fn one_sided_clinician_leave_leaves_nothing_behind() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();

    let session = a.session.clone();
    let join = tokio::spawn(async move { session.join_call().await });
    wait_until(offer_published(store)).await;
    let s = Arc::clone(store);
    wait_until(move || s.snapshot(&key()).map(|d| d.offerer_candidates.len() == 3).unwrap_or(false)).await;

    let report = a.session.leave().await;
    assert!(report.deleted_shared);
    assert!(join.await.unwrap().is_err());
    assert_eq!(a.session.phase(), CallPhase::Terminated(EndReason::LocalLeave));
    assert!(store.snapshot(&key()).is_none());
    assert!(a.peers.last_peer().unwrap().is_closed());
}

#[tokio::test]
async fn authority_leave_while_awaiting_answer_removes_session() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();

    let session = a.session.clone();
    let join = tokio::spawn(async move { session.join_call().await });
    wait_until(offer_published(store)).await;

    // 환자가 answerer 로 참여했지만 아직 answer 를 올리지 않은 상태
    let joined = store.claim(&key(), "pt_lee");
    assert_eq!(joined.record().answerer_id.as_deref(), Some("pt_lee"));
    let mut watch = store.subscribe(&key()).unwrap();
    assert_eq!(a.session.phase(), CallPhase::Negotiating);

    let report = a.session.leave().await;
    assert!(report.deleted_shared);
    assert!(join.await.unwrap().is_err());
    assert_eq!(store.count(), 0);

    // 환자 쪽 구독은 삭제를 None 으로 관측
    tokio::time::timeout(WAIT, watch.wait_for(|doc| doc.is_none()))
        .await
        .expect("삭제 대기 타임아웃")
        .unwrap();
}

#[tokio::test]
async fn patient_arriving_long_after_clinician_still_connects() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();

    let session = a.session.clone();
    let join_a = tokio::spawn(async move { session.join_call().await });
    wait_until(offer_published(store)).await;
    let waiting = store.get(&key()).unwrap().nonce;

    // 의사가 한참 기다린 뒤에 환자 입장
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.session.phase(), CallPhase::Negotiating);

    b.session.join_call().await.expect("늦게 온 환자 join 실패");
    join_a.await.unwrap().expect("의사 join 실패");

    assert_eq!(wait_phase(&a, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
    assert_eq!(wait_phase(&b, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
    assert_eq!(b.session.role(), Some(Role::Answerer));
    assert_eq!(store.get(&key()).unwrap().nonce, waiting);
}

#[tokio::test]
async fn patient_rejoin_survives_clinician_teardown_and_reconnects() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;
    let first_call = store.get(&key()).unwrap().nonce;

    // 환자가 나갔다가 곧바로 같은 진료에 다시 입장
    b.session.leave().await;
    let rejoined = clinic.patient();
    let session = rejoined.session.clone();
    let join_b = tokio::spawn(async move { session.join_call().await });

    assert_eq!(wait_phase(&a, CallPhase::is_terminated).await, CallPhase::Terminated(EndReason::RemoteEnded));

    let s = Arc::clone(store);
    let old = first_call.clone();
    wait_until(move || {
        s.get(&key())
            .map(|r| r.nonce != old && r.initiator_id == "pt_lee" && r.offer.is_some())
            .unwrap_or(false)
    })
    .await;

    // 이전 통화 의사 쪽 teardown 이 끝난 뒤에도 새 세션은 그대로
    wait_until(|| a.devices.issued().iter().all(|t| t.is_stopped())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = store.get(&key()).expect("재입장 세션이 지워짐");
    assert_ne!(record.nonce, first_call);
    assert_eq!(rejoined.session.phase(), CallPhase::Negotiating);

    // 의사도 다시 입장하면 새 세션으로 연결
    let back = clinic.clinician();
    back.session.join_call().await.expect("의사 재입장 실패");
    join_b.await.unwrap().expect("환자 재입장 실패");

    assert_eq!(wait_phase(&back, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
    assert_eq!(wait_phase(&rejoined, |p| *p == CallPhase::Connected).await, CallPhase::Connected);
    assert_eq!(rejoined.session.role(), Some(Role::Offerer));
    assert_eq!(back.session.role(), Some(Role::Answerer));
}

#[tokio::test]
async fn either_side_policy_deletes_exactly_once() {
    let store = Arc::new(SessionStore::new());
    let config = CallConfig { cleanup: CleanupPolicy::EitherSide, ..quick_config() };

    let make = |identity: &str, sdp: &str| {
        let ctx = resolve(&directory(), &key(), identity).unwrap();
        let channel: Arc<dyn SignalingChannel> = Arc::new(LocalChannel::new(Arc::clone(&store)));
        let devices = Arc::new(LoopbackDevices::new());
        let peers = Arc::new(LoopbackFactory::new().with_sdp(sdp));
        let deps = CallDeps::new(channel, devices.clone(), peers.clone()).with_config(config);
        Participant { session: join_session(ctx, deps), devices, peers }
    };
    let a = make("dr_kim", "v=0...A");
    let b = make("pt_lee", "v=0...B");
    connect_pair(&store, &a, &b).await;

    let (ra, rb) = tokio::join!(a.session.leave(), b.session.leave());
    assert_eq!([ra.deleted_shared, rb.deleted_shared].iter().filter(|d| **d).count(), 1);
    assert_eq!(store.count(), 0);
}

#[tokio::test]
async fn reaper_purge_ends_both_participants() {
    let clinic = Clinic::new();
    let store = &clinic.store;
    let hub = TraceHub::new();
    let a = clinic.clinician();
    let b = clinic.patient();
    connect_pair(store, &a, &b).await;

    assert_eq!(reap_once(store, &hub, 0), 1);

    assert_eq!(wait_phase(&a, CallPhase::is_terminated).await, CallPhase::Terminated(EndReason::RemoteEnded));
    assert_eq!(wait_phase(&b, CallPhase::is_terminated).await, CallPhase::Terminated(EndReason::RemoteEnded));
    wait_until(|| a.devices.issued().iter().all(|t| t.is_stopped())).await;
    wait_until(|| b.devices.issued().iter().all(|t| t.is_stopped())).await;
}
