//! The control plane: token auth, pause/drain/shutdown, jmod, jkill,
//! bad-server handling, backup and upload.


use std::io::Write as _;
use std::time::{Duration, Instant};

use chrono::Utc;
use drover::error::{
    BrokerError, ERR_CLOSED_STOP, ERR_PERMISSION_DENIED,
};
use drover::job::{Job, JobEndState, JobModifier, JobState};
use drover::sched::Requirements;
use drover::store::MemStore;
use drover::wire::{BadServer, Client, M_SSTATS};
use flate2::write::GzEncoder;
use flate2::Compression;
use test_harness::TestServer;

fn job(cmd: &str) -> Job {
    let mut j = Job::new(cmd, "/tmp");
    j.rep_group = "cp".to_string();
    j.requirements = Requirements::new(100, 60, 1);
    j
}

fn ok_exit() -> JobEndState {
    JobEndState {
        exited: true,
        exitcode: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn wrong_token_is_denied_except_for_ping() {
    let ts = TestServer::start().await;
    let mut bad_client = Client::connect(
        &format!("127.0.0.1:{}", ts.server.port()),
        "cmds",
        b"not the right token".to_vec(),
    )
    .await
    .unwrap();

    let req = bad_client.new_request(M_SSTATS);
    let resp = bad_client.call(&req).await.unwrap();
    assert_eq!(resp.err, ERR_PERMISSION_DENIED);

    // ping needs no token: it is how clients find out who they talk to
    let info = bad_client.ping().await.unwrap();
    assert_eq!(info.port, ts.server.port());
}

#[tokio::test]
async fn drain_stops_reservations_but_lets_work_finish() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(vec![job("echo a"), job("echo b")], Vec::new(), false)
        .await
        .unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();

    client.drain().await.unwrap();

    // plenty ready, but drain reports nothing immediately
    let started = Instant::now();
    let got = client.reserve(Duration::from_secs(5)).await.unwrap();
    assert!(got.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    // the in-flight job still completes normally
    client.archive(&reserved, ok_exit()).await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_gate_reservations() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("echo p")], Vec::new(), false).await.unwrap();
    client.pause().await.unwrap();

    let got = client.reserve(Duration::from_millis(200)).await.unwrap();
    assert!(got.is_none());

    client.resume().await.unwrap();
    let got = client.reserve(Duration::from_secs(5)).await.unwrap();
    assert!(got.is_some());
}

#[tokio::test]
async fn modify_changes_priority_and_rep_group() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(vec![job("echo m1"), job("echo m2")], Vec::new(), false)
        .await
        .unwrap();
    let keys = vec![job("echo m1").key(), job("echo m2").key()];

    let modified = client
        .modify(
            keys.clone(),
            JobModifier {
                priority: Some(7),
                rep_group: Some("renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(modified.len(), 2);
    // identity is untouched, so old and new keys coincide
    for (old, new) in &modified {
        assert_eq!(old, new);
    }

    let found = client
        .jobs_by_rep_group("renamed", false, 0, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|j| j.priority == 7));

    let found = client.jobs_by_rep_group("cp", false, 0, None).await.unwrap();
    assert!(found.is_empty(), "old rep group index entries are gone");
}

#[tokio::test]
async fn modify_can_rewrite_the_command_and_thus_the_key() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("echo before")], Vec::new(), false).await.unwrap();
    let old_key = job("echo before").key();
    let new_key = job("echo after").key();

    let modified = client
        .modify(
            vec![old_key.clone()],
            JobModifier {
                cmd: Some("echo after".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(modified.get(&old_key), Some(&new_key));

    let found = client.jobs_by_keys(vec![new_key], false, false).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].cmd, "echo after");
    assert!(client
        .jobs_by_keys(vec![old_key], false, false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn running_jobs_are_not_modified() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("echo r")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();

    let modified = client
        .modify(
            vec![reserved.key()],
            JobModifier {
                priority: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(modified.is_empty());
}

#[tokio::test]
async fn jkill_flags_running_jobs_for_their_runners() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("sleep 999")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();
    assert!(!client.touch(&reserved).await.unwrap());

    let killable = client.kill(vec![reserved.key()]).await.unwrap();
    assert_eq!(killable, 1);
    assert!(client.touch(&reserved).await.unwrap(), "touch now reports the kill");
}

#[tokio::test]
async fn server_wide_kill_switch_reaches_every_runner() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("sleep 1")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();

    ts.server.set_kill_runners(true);
    assert!(client.touch(&reserved).await.unwrap());
    ts.server.set_kill_runners(false);
    assert!(!client.touch(&reserved).await.unwrap());
}

#[tokio::test]
async fn confirmed_bad_servers_are_destroyed_and_their_jobs_killed() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job("echo bad")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "badhost", "").await.unwrap();

    // the adapter's id for the host the job reported in on
    let host_id = "id-badhost".to_string();
    ts.server.register_bad_server(BadServer {
        id: host_id.clone(),
        host: "badhost".to_string(),
        flagged_at: Utc::now(),
        is_bad: true,
    });

    let (servers, jobs) = client.bad_servers(false, "").await.unwrap();
    assert_eq!(servers.len(), 1);
    assert!(jobs.is_empty());

    let (confirmed, affected) = client.bad_servers(true, "").await.unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(affected.len(), 1);
    assert_eq!(ts.sched.destroyed.lock().unwrap().as_slice(), [host_id]);

    // the runner hears about it on its next touch
    assert!(client.touch(&reserved).await.unwrap());

    // and the list is now empty
    let (servers, _) = client.bad_servers(false, "").await.unwrap();
    assert!(servers.is_empty());
}

#[tokio::test]
async fn limit_groups_can_be_read_and_set() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    assert_eq!(client.limit_group("datamover").await.unwrap(), -1);
    assert_eq!(client.limit_group("datamover:4").await.unwrap(), 4);
    assert_eq!(client.limit_group("datamover").await.unwrap(), 4);
    assert_eq!(client.limit_group("datamover:-1").await.unwrap(), -1);
}

#[tokio::test]
async fn backup_snapshots_are_restorable() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(vec![job("echo persist")], b"A=1".to_vec(), false)
        .await
        .unwrap();
    let bytes = client.backup().await.unwrap();
    assert!(!bytes.is_empty());

    let restored = MemStore::from_backup(&bytes).unwrap();
    let live = restored.live_jobs().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].cmd, "echo persist");
}

#[tokio::test]
async fn uploaded_files_are_decompressed_and_saved() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"#!/bin/sh\necho hi\n").unwrap();
    let compressed = encoder.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("script.sh");
    let saved = client
        .upload(compressed, target.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(saved, target.display().to_string());
    assert_eq!(
        std::fs::read(&target).unwrap(),
        b"#!/bin/sh\necho hi\n".to_vec()
    );
}

#[tokio::test]
async fn shutdown_request_stops_the_server() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.shutdown().await.unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(5), ts.server.block())
        .await
        .expect("server should stop quickly");
    match cause {
        BrokerError::Closed(code) => assert_eq!(code, ERR_CLOSED_STOP),
        other => panic!("unexpected stop cause: {other}"),
    }

    // a stopped server refuses further requests, if it answers at all
    let err = client.server_stats().await;
    assert!(err.is_err());
}

#[tokio::test]
async fn stop_with_wait_shuts_down_cleanly() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;
    client.add(vec![job("echo stop")], Vec::new(), false).await.unwrap();

    ts.server.stop(true).await;

    let err = client.reserve(Duration::from_millis(200)).await;
    assert!(err.is_err());
}
