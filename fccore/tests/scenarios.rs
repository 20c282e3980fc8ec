//! End-to-end scenarios driven through real programs: assembled guests,
//! booted main VMs, forked request pools, reservations, storage VMs and
//! live updates.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use fccore::dispatch::{self, BackendBody, CallInputs};
use fccore::error::CallError;
use fccore::program::ProgramInstance;
use fccore::tenant::{TenantConfig, TenantGroup, WarmupSpec};
use fccore::tenant_instance::{TenantInstance, UpdateOutcome};

fn call(prog: &Arc<ProgramInstance>, inputs: &CallInputs) -> Result<(u16, String, Vec<u8>), CallError> {
    let resv = prog.reserve_vm()?;
    let result = dispatch::backend_call(&resv, inputs)?;
    let body = if result.is_streamed() {
        dispatch::collect_streamed(&resv, &result, 4096)?
    } else {
        dispatch::collect_body(&resv, &result)?
    };
    Ok((result.status, result.content_type, body))
}

fn call_get(prog: &Arc<ProgramInstance>, url: &str) -> Result<(u16, String, Vec<u8>), CallError> {
    call(prog, &CallInputs::get(url))
}

#[test]
fn s1_get_round_trip() {
    init_logs();
    let cfg = test_config("t1", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, static_get_guest(200, "text/plain; charset=utf-8", b"ok\n"));
    prog.wait_for_initialization().unwrap();

    let resv = prog.reserve_vm().unwrap();
    let result = dispatch::backend_call(&resv, &CallInputs::get("/hello")).unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(result.content_type, "text/plain; charset=utf-8");
    assert_eq!(result.content_length, 3);
    // buffered responses account for every byte
    match &result.body {
        BackendBody::Buffered { buffers } => {
            let total: u64 = buffers.iter().map(|b| b.len).sum();
            assert_eq!(total, result.content_length);
        }
        _ => panic!("expected a buffered body"),
    }
    let body = dispatch::collect_body(&resv, &result).unwrap();
    assert_eq!(body, vec![0x6f, 0x6b, 0x0a]);
}

#[test]
fn s2_buffered_post_echo() {
    init_logs();
    let cfg = test_config("t2", |_| {});
    let prog = launch_single(&cfg, post_echo_guest(201, "application/octet-stream"));
    prog.wait_for_initialization().unwrap();

    let payload = vec![1u8, 2, 3, 4, 5];
    let inputs = CallInputs::post("/echo", "application/octet-stream", payload.clone());
    let resv = prog.reserve_vm().unwrap();
    let result = dispatch::backend_call(&resv, &inputs).unwrap();
    assert_eq!(result.status, 201);
    assert_eq!(result.content_length, 5);
    assert_eq!(dispatch::collect_body(&resv, &result).unwrap(), payload);
}

#[test]
fn s3_timeout_then_error_substitute() {
    init_logs();
    let cfg = test_config("t3", |g| {
        g.max_req_time = Duration::from_millis(100);
        g.max_concurrency = 1;
    });
    let prog = launch_single(&cfg, spin_with_error_guest(504, b"timeout"));
    prog.wait_for_initialization().unwrap();

    let t0 = Instant::now();
    let (status, ctype, body) = call_get(&prog, "/slow").unwrap();
    assert_eq!(status, 504);
    assert_eq!(ctype, "text/plain");
    assert_eq!(body, b"timeout");
    assert!(t0.elapsed() < Duration::from_secs(3));
}

#[test]
fn p4_reset_discards_poisoned_state() {
    init_logs();
    // non-ephemeral: only the failure-driven reset can clean the VM
    let cfg = test_config("t4", |g| {
        g.max_req_time = Duration::from_millis(100);
        g.max_concurrency = 1;
        g.ephemeral = false;
    });
    let prog = launch_single(&cfg, poison_then_tell_guest());
    prog.wait_for_initialization().unwrap();

    // both calls must time out: the scribbled cell never survives the
    // post-failure hard reset
    for _ in 0..2 {
        let err = call_get(&prog, "/x").unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)), "got {err:?}");
    }
}

#[test]
fn ephemeral_vs_warm_state() {
    init_logs();
    let cfg = test_config("t5-eph", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, scribble_guest(false));
    prog.wait_for_initialization().unwrap();
    for _ in 0..3 {
        let (_, _, body) = call_get(&prog, "/").unwrap();
        assert_eq!(body, b"0", "ephemeral VMs reset between requests");
    }

    let cfg = test_config("t5-warm", |g| {
        g.max_concurrency = 1;
        g.ephemeral = false;
    });
    let prog = launch_single(&cfg, scribble_guest(false));
    prog.wait_for_initialization().unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(call_get(&prog, "/").unwrap().2[0]);
    }
    assert_eq!(seen, vec![b'0', b'1', b'2'], "warm VMs keep working memory");
}

#[test]
fn guest_controlled_ephemeral() {
    init_logs();
    let cfg = test_config("t5-ctl", |g| {
        g.max_concurrency = 1;
        g.ephemeral = true;
        g.control_ephemeral = true;
    });
    let prog = launch_single(&cfg, scribble_guest(true));
    prog.wait_for_initialization().unwrap();
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(call_get(&prog, "/").unwrap().2[0]);
    }
    assert_eq!(seen, vec![b'0', b'1'], "the guest opted out of ephemeral resets");
}

#[test]
fn s4_storage_rpc_and_live_update() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let program_path = dir.path().join("counter.elf");
    std::fs::write(&program_path, counter_guest(1, true)).unwrap();

    let mut group = TenantGroup::new("test");
    group.has_storage = true;
    group.max_concurrency = 2;
    let config = TenantConfig::new(
        "storage.test".into(),
        program_path.to_string_lossy().into_owned(),
        "update-key".into(),
        group,
        String::new(),
    );
    let tenant = TenantInstance::new(config);
    tenant.begin_initialize(false);
    let prog = tenant.ref_program(false).unwrap();

    for expect in ["1", "2", "3"] {
        let (status, _, body) = call_get(&prog, "/count").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, expect.as_bytes());
    }

    // live update: the new program reads (never increments) and scales by 10
    let outcome = tenant.live_update(counter_guest(10, false), false).unwrap();
    assert_eq!(outcome, UpdateOutcome::Stored);

    let new_prog = tenant.ref_program(false).unwrap();
    assert!(!Arc::ptr_eq(&prog, &new_prog), "program handle was swapped");
    let (_, _, body) = call_get(&new_prog, "/count").unwrap();
    assert_eq!(body, b"30", "transferred counter times the new multiplier");

    let stats = &new_prog.core.stats;
    assert_eq!(stats.live_updates.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(stats.live_update_transfer_bytes.load(std::sync::atomic::Ordering::Relaxed), 4);

    // the old program still answers in-flight style requests
    let (_, _, body) = call_get(&prog, "/count").unwrap();
    assert_eq!(body, b"4");

    // reload: the program comes back from its (rewritten) file with the
    // storage state carried over
    tenant.reload_program_live(false);
    let reloaded = tenant.ref_program(false).unwrap();
    assert!(!Arc::ptr_eq(&new_prog, &reloaded));
    let (_, _, body) = call_get(&reloaded, "/count").unwrap();
    assert_eq!(body, b"30");
}

#[test]
fn p5_storage_calls_serialize() {
    init_logs();
    let cfg = test_config("t-p5", |g| {
        g.has_storage = true;
        g.max_concurrency = 4;
    });
    let guest = counter_guest(1, true);
    let prog = launch_with_storage(&cfg, guest.clone(), guest);
    prog.wait_for_initialization().unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let prog = prog.clone();
        handles.push(std::thread::spawn(move || {
            let (_, _, body) = call_get(&prog, "/").unwrap();
            String::from_utf8(body).unwrap().parse::<u32>().unwrap()
        }));
    }
    let mut values: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    values.sort_unstable();
    // a strict total order on the counter: every increment observed once
    assert_eq!(values, (1..=8).collect::<Vec<u32>>());
}

#[test]
fn s5_queue_timeout() {
    init_logs();
    let cfg = test_config("t6", |g| {
        g.max_concurrency = 1;
        g.max_queue_time = Duration::from_secs(1);
    });
    let prog = launch_single(&cfg, sleepy_guest(3000));
    prog.wait_for_initialization().unwrap();

    let slow = {
        let prog = prog.clone();
        std::thread::spawn(move || call_get(&prog, "/slow"))
    };
    std::thread::sleep(Duration::from_millis(200));

    let t0 = Instant::now();
    let err = prog.reserve_vm().unwrap_err();
    let waited = t0.elapsed();
    assert!(matches!(err, CallError::QueueTimeout));
    assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(1600), "waited {waited:?}");
    assert_eq!(prog.core.stats.reservation_timeouts.load(std::sync::atomic::Ordering::Relaxed), 1);

    let (status, _, body) = slow.join().unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");
}

#[test]
fn s6_streaming_response() {
    init_logs();
    let cfg = test_config("t7", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, streaming_guest());
    prog.wait_for_initialization().unwrap();

    let resv = prog.reserve_vm().unwrap();
    let result = dispatch::backend_call(&resv, &CallInputs::get("/stream")).unwrap();
    assert!(result.is_streamed());
    assert_eq!(result.status, 200);
    assert_eq!(result.content_length, 10);

    let mut body = Vec::new();
    while (body.len() as u64) < result.content_length {
        let chunk = dispatch::stream_next(&resv, &result, 4, body.len() as u64).unwrap();
        assert_eq!(chunk.len(), 1, "one digit per callback");
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, b"0123456789");
}

#[test]
fn streaming_post_consumes_chunks() {
    init_logs();
    let cfg = test_config("t8", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, stream_post_guest());
    prog.wait_for_initialization().unwrap();

    let inputs = CallInputs {
        method: "POST".into(),
        url: "/upload".into(),
        content_type: "application/octet-stream".into(),
        ..Default::default()
    };
    let resv = prog.reserve_vm().unwrap();
    let mut st = dispatch::begin_post(&resv, 11).unwrap();
    assert!(st.streamed);
    dispatch::post_data(&resv, &inputs, &mut st, b"hello ").unwrap();
    dispatch::post_data(&resv, &inputs, &mut st, b"world").unwrap();
    let result = dispatch::backend_call_with_post(&resv, &inputs, Some(st)).unwrap();
    assert_eq!(dispatch::collect_body(&resv, &result).unwrap(), b"hello world");
}

#[test]
fn warmup_primes_the_snapshot() {
    init_logs();
    let cfg = test_config("t9", |g| {
        g.max_concurrency = 2;
        g.warmup = Some(WarmupSpec {
            method: "GET".into(),
            url: "/warm".into(),
            headers: vec!["X-Warm: 1".into()],
            num_requests: 2,
        });
    });
    let prog = launch_single(&cfg, resume_counting_guest());
    prog.wait_for_initialization().unwrap();

    // both forks inherit the twice-warmed snapshot
    for _ in 0..2 {
        let (status, _, body) = call_get(&prog, "/real").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"2");
    }
    // warmup requests never count toward request statistics
    assert_eq!(prog.core.stats.invocations.load(std::sync::atomic::Ordering::Relaxed), 2);
}

#[test]
fn http_header_syscalls() {
    init_logs();
    let cfg = test_config("t10", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, header_guest());
    prog.wait_for_initialization().unwrap();

    let mut inputs = CallInputs::get("/hdr");
    inputs.headers = vec!["Host: unit.test".into(), "X-Custom: hello".into()];
    let resv = prog.reserve_vm().unwrap();
    let result = dispatch::backend_call(&resv, &inputs).unwrap();
    assert_eq!(dispatch::collect_body(&resv, &result).unwrap(), b"hello");
    assert!(result.headers.iter().any(|h| h == "X-Resp: yes"), "headers: {:?}", result.headers);
}

#[test]
fn regex_syscalls_match() {
    init_logs();
    let cfg = test_config("t11", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, regex_guest("^/h[aeiou]llo$", "/hello"));
    prog.wait_for_initialization().unwrap();
    for _ in 0..2 {
        // the second call recompiles into the freshly reset cache
        let (_, _, body) = call_get(&prog, "/").unwrap();
        assert_eq!(body, b"1");
    }
}

#[test]
fn cache_directives_surface() {
    init_logs();
    let cfg = test_config("t12", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, cacheable_guest());
    prog.wait_for_initialization().unwrap();
    let resv = prog.reserve_vm().unwrap();
    let result = dispatch::backend_call(&resv, &CallInputs::get("/c")).unwrap();
    let cache = result.cache.expect("cache directives set");
    assert!(cache.cached);
    assert!((cache.ttl - 60.0).abs() < 1e-3);
    assert!((cache.grace - 30.0).abs() < 1e-3);
}

#[test]
fn bad_status_code_rejected() {
    init_logs();
    let cfg = test_config("t13", |g| g.max_concurrency = 1);
    let prog = launch_single(&cfg, static_get_guest(199, TEXT_PLAIN, b"x"));
    prog.wait_for_initialization().unwrap();
    let err = call_get(&prog, "/").unwrap_err();
    assert!(matches!(err, CallError::BadStatusCode(199)), "got {err:?}");
}

#[test]
fn pool_survives_concurrent_load() {
    init_logs();
    let cfg = test_config("t14", |g| g.max_concurrency = 2);
    let prog = launch_single(&cfg, sleepy_guest(50));
    prog.wait_for_initialization().unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let prog = prog.clone();
        handles.push(std::thread::spawn(move || call_get(&prog, "/").map(|(s, _, _)| s)));
    }
    for h in handles {
        assert_eq!(h.join().unwrap().unwrap(), 200);
    }
}

#[test]
fn missing_program_is_a_clean_failure() {
    init_logs();
    let config = TenantConfig::new(
        "ghost.test".into(),
        "/nonexistent/path.elf".into(),
        String::new(),
        TenantGroup::new("test"),
        String::new(),
    );
    let tenant = TenantInstance::new(config);
    let err = tenant.ref_program(false).unwrap_err();
    assert!(matches!(err, CallError::NoProgram(_)));
}
