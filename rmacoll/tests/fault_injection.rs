//! Fault-injection tests: a failed operation aborts its request at the
//! round where it happened, and nothing after that round is issued.

mod common;

use rmacoll::transport::loopback::{Fault, OpKind};
use rmacoll::{
    AlltoallvAlgorithm, AlltoallvBuffer, BufferLoc, CollectiveRequest, DataType, LoopbackFabric,
    LoopbackOptions, RequestState, RmaCollConfig, RmaCollError, Schedule, alltoallv_with,
};

const INJECTED: i32 = 77;

fn faulty(world: u32, faults: Vec<Fault>) -> LoopbackFabric {
    LoopbackFabric::with_options(
        world,
        LoopbackOptions {
            completion_delay: 1,
            faults,
        },
    )
}

fn put_fault(rank: u32, nth: u64) -> Fault {
    Fault {
        rank,
        kind: OpKind::Put,
        nth,
        code: INJECTED,
    }
}

// ── Schedules ───────────────────────────────────────────────────────

#[test]
fn failed_round_stops_later_rounds() {
    let fabric = faulty(1, vec![put_fault(0, 1)]);
    let comms = common::comms(&fabric, RmaCollConfig::default());
    let window = comms[0].transport().create_window().unwrap();
    let origin = [9u32; 4];
    let mut target = [0u32; 8];
    unsafe { window.attach(target.as_mut_ptr() as u64, 32).unwrap() };
    window.lock_all().unwrap();

    let mut s = Schedule::new();
    for round in 0..3u64 {
        s.append_put(
            BufferLoc::User(origin.as_ptr() as u64),
            2,
            DataType::U32,
            0,
            2,
            DataType::U32,
            target.as_mut_ptr() as u64 + 8 * round,
        )
        .unwrap();
        s.end_round().unwrap();
    }
    s.append_window_release().unwrap();
    s.commit().unwrap();

    let req =
        unsafe { CollectiveRequest::from_schedule_with_window(&comms[0], s, window, false) }
            .unwrap();
    req.start().unwrap();
    let err = req.wait_blocking().unwrap_err();
    match &err {
        RmaCollError::OperationFailed {
            operation, code, ..
        } => {
            assert_eq!(*operation, "rput");
            assert_eq!(*code, INJECTED);
        }
        other => panic!("expected OperationFailed, got {other:?}"),
    }
    assert_eq!(err.code(), INJECTED);

    // Only round 0 was issued; the failed put moved no data.
    let issued = fabric.issued(0);
    assert_eq!(issued.puts, 1);
    assert_eq!(issued.releases, 0);
    assert_eq!(target, [0; 8]);

    // A failed request keeps reporting the same error.
    for _ in 0..3 {
        assert_eq!(req.test().unwrap_err(), err);
    }
    assert_eq!(req.error(), Some(err));
    assert_eq!(comms[0].component().active_requests(), 0);
}

#[test]
fn failure_in_second_round_keeps_first_round_data() {
    let fabric = faulty(1, vec![put_fault(0, 2)]);
    let comms = common::comms(&fabric, RmaCollConfig::default());
    let window = comms[0].transport().create_window().unwrap();
    let origin = [3u16; 4];
    let mut target = [0u16; 8];
    unsafe { window.attach(target.as_mut_ptr() as u64, 16).unwrap() };
    window.lock_all().unwrap();

    let mut s = Schedule::new();
    for round in 0..3u64 {
        s.append_put(
            BufferLoc::User(origin.as_ptr() as u64),
            4,
            DataType::BF16,
            0,
            4,
            DataType::BF16,
            target.as_mut_ptr() as u64 + 8 * (round % 2),
        )
        .unwrap();
        s.end_round().unwrap();
    }
    s.commit().unwrap();

    let req =
        unsafe { CollectiveRequest::from_schedule_with_window(&comms[0], s, window, false) }
            .unwrap();
    req.start().unwrap();
    assert!(req.wait_blocking().is_err());
    assert_eq!(fabric.issued(0).puts, 2);
    assert_eq!(&target[..4], &[3; 4]);
    assert_eq!(&target[4..], &[0; 4]);
}

#[test]
fn persistent_request_rearms_after_failure() {
    let fabric = faulty(1, vec![put_fault(0, 1)]);
    let comms = common::comms(&fabric, RmaCollConfig::default());
    let window = comms[0].transport().create_window().unwrap();
    let origin = [0x5Au8; 4];
    let mut target = [0u8; 4];
    unsafe { window.attach(target.as_mut_ptr() as u64, 4).unwrap() };
    window.lock_all().unwrap();

    let mut s = Schedule::new();
    s.append_put(
        BufferLoc::User(origin.as_ptr() as u64),
        4,
        DataType::U8,
        0,
        4,
        DataType::U8,
        target.as_mut_ptr() as u64,
    )
    .unwrap();
    s.commit().unwrap();
    let req =
        unsafe { CollectiveRequest::from_schedule_with_window(&comms[0], s, window, true) }
            .unwrap();

    req.start().unwrap();
    let err = req.wait_blocking().unwrap_err();
    assert_eq!(err.code(), INJECTED);
    assert!(matches!(req.state().unwrap(), RequestState::Failed(_)));

    // The schedule survived the failure; the second put is healthy.
    req.start().unwrap();
    req.wait_blocking().unwrap();
    assert_eq!(req.state().unwrap(), RequestState::Finished);
    assert_eq!(target, [0x5A; 4]);
    assert_eq!(req.error(), None);
}

// ── All-to-all-variable ─────────────────────────────────────────────

// Rank 0's first get fails. Peers cannot finish without rank 0, so they
// are polled a bounded number of times and abandoned.
fn failing_get_exchange(algo: AlltoallvAlgorithm) -> (LoopbackFabric, Vec<Option<RmaCollError>>) {
    const WORLD: usize = 3;
    let fabric = faulty(
        WORLD as u32,
        vec![Fault {
            rank: 0,
            kind: OpKind::Get,
            nth: 1,
            code: INJECTED,
        }],
    );
    let comms = common::comms(&fabric, RmaCollConfig::default());
    let counts = [1usize; WORLD];
    let displs = [0usize, 1, 2];

    let results = common::run_ranks(&comms, |comm| {
        let send = vec![comm.rank() as u64; WORLD];
        let mut recv = vec![0u64; WORLD];
        let req = unsafe {
            alltoallv_with(
                comm,
                AlltoallvBuffer {
                    ptr: send.as_ptr() as u64,
                    counts: &counts,
                    displs: &displs,
                    dtype: DataType::U64,
                },
                AlltoallvBuffer {
                    ptr: recv.as_mut_ptr() as u64,
                    counts: &counts,
                    displs: &displs,
                    dtype: DataType::U64,
                },
                algo,
                false,
            )
        }
        .unwrap();
        req.start().unwrap();
        let outcome = if comm.rank() == 0 {
            req.wait_blocking().err()
        } else {
            let mut outcome = None;
            for _ in 0..200 {
                if let Err(e) = req.test() {
                    outcome = Some(e);
                    break;
                }
                std::thread::yield_now();
            }
            outcome
        };
        // Abandoned peers may still reference these buffers.
        std::mem::forget(send);
        std::mem::forget(recv);
        outcome
    });
    (fabric, results)
}

#[test]
fn alltoallv_trigger_pull_reports_failed_get() {
    let (_fabric, results) = failing_get_exchange(AlltoallvAlgorithm::TriggerPull);
    let err = results[0].clone().expect("rank 0 must fail");
    assert_eq!(err.code(), INJECTED);
    assert!(results[1..].iter().all(Option::is_none));
}

#[test]
fn alltoallv_linear_get_never_releases_after_failure() {
    let (fabric, results) = failing_get_exchange(AlltoallvAlgorithm::LinearGet);
    let err = results[0].clone().expect("rank 0 must fail");
    assert_eq!(err.code(), INJECTED);
    // Rank 0 stopped at round 0; its window release was never issued.
    assert_eq!(fabric.issued(0).releases, 0);
    assert_eq!(fabric.issued(1).releases, 1);
    assert_eq!(fabric.issued(2).releases, 1);
}
