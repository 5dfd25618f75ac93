mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use mmrm::{ClientDescriptor, MmrmError, Priority};

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test_log::test]
fn budget_holds_over_random_traffic() {
    let clients = [(1, 300.0), (2, 500.0), (3, 200.0), (4, 700.0)];
    let (engine, _) = engine(&platform(1200, &clients, &[1, 4]));
    let handles = clients
        .iter()
        .map(|(local_id, _)| {
            let priority = if *local_id % 2 == 0 {
                Priority::High
            } else {
                Priority::Normal
            };
            engine
                .register(ClientDescriptor::new(clk(*local_id)).with_priority(priority))
                .unwrap()
        })
        .collect::<Vec<_>>();

    let mut rng = Lcg(7);
    for _ in 0..2000 {
        let handle = handles[rng.next(handles.len() as u64) as usize];
        let rate = match rng.next(7) {
            0 => 0,
            step => LADDER[(step - 1).min(4) as usize] - rng.next(2) * MHZ,
        };
        let blocks = 1 + rng.next(2) as u32;
        let reserve_only = rng.next(5) == 0;

        if let Err(err) = engine.request_rate(handle, rate, blocks, reserve_only) {
            assert!(
                matches!(err.current_context(), MmrmError::BudgetExceeded { .. }),
                "{err:?}"
            );
        }
        assert_consistent(&engine.snapshot());
    }
}

#[test_log::test]
fn concurrent_clients_never_overshoot() {
    let clients = [(1, 200.0), (2, 200.0), (3, 200.0), (4, 200.0)];
    let (engine, clock) = engine(&platform(1000, &clients, &[1, 2]));
    let engine = Arc::new(engine);

    let workers = clients
        .iter()
        .map(|(local_id, _)| {
            let engine = Arc::clone(&engine);
            let local_id = *local_id;
            thread::spawn(move || {
                let handle = engine
                    .register(ClientDescriptor::new(clk(local_id)).with_priority(
                        if local_id > 2 {
                            Priority::High
                        } else {
                            Priority::Normal
                        },
                    ))
                    .unwrap();
                let mut rng = Lcg(u64::from(local_id));
                for round in 0..=250 {
                    let rate = if round == 250 {
                        0
                    } else {
                        LADDER[rng.next(5) as usize]
                    };
                    if let Err(err) = engine.request_rate(handle, rate, 1, false) {
                        assert!(matches!(
                            err.current_context(),
                            MmrmError::BudgetExceeded { .. }
                        ));
                    }
                    assert_consistent(&engine.snapshot());
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    let snapshot = engine.snapshot();
    assert_consistent(&snapshot);
    assert!(!clock.calls().is_empty());
}
