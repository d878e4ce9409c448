//! The get* query methods: lookups by key, rep group and current state,
//! std/env population rules, dependencies, and server stats.


use std::time::Duration;

use drover::job::{Dependency, Job, JobEndState, JobState};
use drover::sched::Requirements;
use drover::wire::M_SSTATS;
use test_harness::TestServer;

fn job_in(rep_group: &str, cmd: &str) -> Job {
    let mut j = Job::new(cmd, "/tmp");
    j.rep_group = rep_group.to_string();
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
async fn getbc_joins_queue_and_complete_store() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(
            vec![job_in("rg", "echo live"), job_in("rg", "echo done")],
            Vec::new(),
            false,
        )
        .await
        .unwrap();

    // reserve both, finish only the "done" one
    let done_key = job_in("rg", "echo done").key();
    let r1 = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    let r2 = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    let target = if r1.key() == done_key { r1 } else { r2 };
    client.started(&target, 1, "h1", "").await.unwrap();
    client.archive(&target, ok_exit()).await.unwrap();

    let live_key = job_in("rg", "echo live").key();
    let found = client
        .jobs_by_keys(vec![live_key.clone(), done_key.clone()], false, false)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    let states: Vec<JobState> = found.iter().map(|j| j.state).collect();
    assert!(states.contains(&JobState::Complete));
    assert!(states.iter().any(|s| *s != JobState::Complete));
}

#[tokio::test]
async fn getbr_finds_jobs_by_rep_group_exactly_and_by_search() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(
            vec![
                job_in("batch1", "echo a"),
                job_in("batch1", "echo b"),
                job_in("batch2", "echo c"),
            ],
            Vec::new(),
            false,
        )
        .await
        .unwrap();

    let found = client
        .jobs_by_rep_group("batch1", false, 0, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let found = client
        .jobs_by_rep_group("batch", true, 0, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 3);

    let found = client
        .jobs_by_rep_group("batch", true, 2, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 2, "limit caps the result");

    let found = client
        .jobs_by_rep_group("nosuch", false, 0, None)
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn getbr_covers_completed_jobs_too() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job_in("done-rg", "echo d")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();
    client.archive(&reserved, ok_exit()).await.unwrap();

    let found = client
        .jobs_by_rep_group("done-rg", false, 0, Some(JobState::Complete))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].state, JobState::Complete);
}

#[tokio::test]
async fn getin_filters_by_state() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(
            vec![job_in("rg", "echo one"), job_in("rg", "echo two")],
            Vec::new(),
            false,
        )
        .await
        .unwrap();
    client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();

    let ready = client
        .current_jobs(0, Some(JobState::Ready), false, false)
        .await
        .unwrap();
    assert_eq!(ready.len(), 1);

    let reserved = client
        .current_jobs(0, Some(JobState::Reserved), false, false)
        .await
        .unwrap();
    assert_eq!(reserved.len(), 1);

    let all = client.current_jobs(0, None, false, false).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn std_streams_are_returned_only_for_failures() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job_in("rg", "false")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();
    client
        .release(
            &reserved,
            JobEndState {
                exited: true,
                exitcode: 2,
                stderr: b"it broke".to_vec(),
                ..Default::default()
            },
            "it broke",
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let found = client
        .jobs_by_keys(vec![reserved.key()], true, false)
        .await
        .unwrap();
    assert_eq!(found[0].stderr.as_deref(), Some(&b"it broke"[..]));

    // a successful job keeps nothing
    client.add(vec![job_in("rg", "true")], Vec::new(), false).await.unwrap();
    let ok = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&ok, 1, "h1", "").await.unwrap();
    client.archive(&ok, ok_exit()).await.unwrap();
    let found = client.jobs_by_keys(vec![ok.key()], true, false).await.unwrap();
    assert!(found[0].stdout.is_none());
}

#[tokio::test]
async fn env_is_returned_on_request() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(vec![job_in("rg", "echo e")], b"HOME=/home/u".to_vec(), false)
        .await
        .unwrap();
    let key = job_in("rg", "echo e").key();

    let plain = client.jobs_by_keys(vec![key.clone()], false, false).await.unwrap();
    assert!(plain[0].env.is_none());

    let with_env = client.jobs_by_keys(vec![key], false, true).await.unwrap();
    assert_eq!(with_env[0].env.as_deref(), Some(&b"HOME=/home/u"[..]));
}

#[tokio::test]
async fn dep_group_members_hold_back_their_dependents() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    let mut producer = job_in("rg", "produce data");
    producer.dep_groups = vec!["stage1".to_string()];
    let mut consumer = job_in("rg", "consume data");
    consumer.dependencies = vec![Dependency::Group("stage1".to_string())];
    client
        .add(vec![producer, consumer], Vec::new(), false)
        .await
        .unwrap();

    let consumer_key = {
        let mut j = job_in("rg", "consume data");
        j.dependencies = vec![Dependency::Group("stage1".to_string())];
        j.key()
    };
    let found = client
        .jobs_by_keys(vec![consumer_key.clone()], false, false)
        .await
        .unwrap();
    assert_eq!(found[0].state, JobState::Dependent);

    // only the producer is reservable
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(reserved.cmd, "produce data");
    client.started(&reserved, 1, "h1", "").await.unwrap();
    client.archive(&reserved, ok_exit()).await.unwrap();

    let mut c2 = ts.client().await;
    wait_for_state(&mut c2, &consumer_key, JobState::Ready).await;
}

async fn wait_for_state(client: &mut drover::wire::Client, key: &str, state: JobState) {
    for _ in 0..100 {
        let found = client
            .jobs_by_keys(vec![key.to_string()], false, false)
            .await
            .unwrap();
        if found.first().map(|j| j.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {key} never reached {state}");
}

#[tokio::test]
async fn explicit_job_dependencies_on_complete_jobs_are_satisfied() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client.add(vec![job_in("rg", "step one")], Vec::new(), false).await.unwrap();
    let reserved = client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();
    client.started(&reserved, 1, "h1", "").await.unwrap();
    client.archive(&reserved, ok_exit()).await.unwrap();

    // depending on an already-complete job does not hold the new job back
    let mut follow = job_in("rg", "step two");
    follow.dependencies = vec![Dependency::Job(reserved.key())];
    client.add(vec![follow.clone()], Vec::new(), false).await.unwrap();

    let found = client
        .jobs_by_keys(vec![follow.key()], false, false)
        .await
        .unwrap();
    assert_eq!(found[0].state, JobState::Ready);
}

#[tokio::test]
async fn sstats_reports_sub_queue_counts() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    client
        .add(
            vec![job_in("rg", "echo 1"), job_in("rg", "echo 2")],
            Vec::new(),
            false,
        )
        .await
        .unwrap();
    client.reserve(Duration::from_secs(5)).await.unwrap().unwrap();

    let stats = client.server_stats().await.unwrap();
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.server_info.port, ts.server.port());
    assert!(stats.uptime > Duration::ZERO);
}

#[tokio::test]
async fn ping_works_and_unknown_methods_are_rejected() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    let info = client.ping().await.unwrap();
    assert_eq!(info.port, ts.server.port());
    assert!(info.pid > 0);

    let mut req = client.new_request(M_SSTATS);
    req.method = "frobnicate".to_string();
    let resp = client.call(&req).await.unwrap();
    assert_eq!(resp.err, drover::error::ERR_UNKNOWN_COMMAND);
}

#[tokio::test]
async fn getbr_and_getbc_reject_empty_arguments() {
    let ts = TestServer::start().await;
    let mut client = ts.client().await;

    let mut req = client.new_request(drover::wire::M_GETBC);
    req.keys = Vec::new();
    let resp = client.call(&req).await.unwrap();
    assert_eq!(resp.err, drover::error::ERR_BAD_REQUEST);

    let req = client.new_request(drover::wire::M_GETBR);
    let resp = client.call(&req).await.unwrap();
    assert_eq!(resp.err, drover::error::ERR_BAD_REQUEST);
}
