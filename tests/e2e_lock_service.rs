//! E2E: the lock service over loopback RPC.
//!
//! Client and server run in one process but use separate registries, so
//! every interaction crosses a real TCP connection. The interesting cases
//! are the ones where a caller gives up while its handler waits on the
//! lock.

mod common;

use common::*;
use interruptible_rpc::lock::{LockStatus, Ticket};
use interruptible_rpc::{CancelReason, ErrorKind, UnitHandle};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

fn spawn_acquire(stack: &LockStack) -> UnitHandle<interruptible_rpc::Result<Ticket>> {
    let client = stack.client.clone();
    stack
        .units
        .spawn(move |cx| client.acquire(cx))
        .expect("spawn acquirer")
}

// =========================================================================
// Cancelling a waiter
// =========================================================================

#[test]
fn e2e_scenario_b_cancelled_waiter_is_never_granted() {
    init_test("e2e_scenario_b_cancelled_waiter_is_never_granted");
    let stack = LockStack::start();
    let cx = stack.caller();

    test_section!("holder takes the lock");
    let held = stack.client.acquire(&cx).expect("first acquire");

    test_section!("second caller blocks, then gives up");
    let waiter = spawn_acquire(&stack);
    assert!(stack.wait_for_waiters(1), "waiter parked on the lock");
    let waiter_unit = waiter.id();
    assert!(waiter.cancel_with(CancelReason::user("gave up")));
    assert!(!stack.client_registry.is_alive(waiter_unit));

    let err = waiter.join().expect("join").expect_err("cancelled");
    assert_with_log!(
        err.is_cancelled(),
        "waiter sees its own cancel",
        ErrorKind::Cancelled,
        err.kind()
    );

    test_section!("server abandons the wait");
    assert!(stack.wait_for_waiters(0), "handler left the wait");
    assert_eq!(
        stack.lock.holder(),
        Some(held),
        "lock never moved to the dead caller"
    );

    stack.client.release(&cx, held).expect("release");
    assert_eq!(stack.lock.holder(), None, "nobody was handed the lock");

    test_section!("third caller");
    let third = stack.client.acquire(&cx).expect("third acquire");
    assert_ne!(third, held);
    stack.client.release(&cx, third).expect("release third");
    test_complete!("e2e_scenario_b_cancelled_waiter_is_never_granted");
}

#[test]
fn e2e_scenario_c_cancel_second_acquirer_first_keeps_lock() {
    init_test("e2e_scenario_c_cancel_second_acquirer_first_keeps_lock");
    let stack = LockStack::start();

    let first = spawn_acquire(&stack);
    let first_ticket = first.join().expect("join first").expect("first granted");

    let second = spawn_acquire(&stack);
    assert!(stack.wait_for_waiters(1));
    second.cancel();
    let err = second.join().expect("join second").expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(stack.wait_for_waiters(0));

    assert_eq!(stack.lock.holder(), Some(first_ticket));
    let cx = stack.caller();
    let status: LockStatus = stack.client.status(&cx).expect("status");
    assert!(status.held);
    assert_eq!(status.waiters, 0);

    stack
        .client
        .release(&cx, first_ticket)
        .expect("first releases cleanly");
    assert_eq!(stack.lock.holder(), None);
    test_complete!("e2e_scenario_c_cancel_second_acquirer_first_keeps_lock");
}

#[test]
fn e2e_surviving_waiters_acquire_in_turn() {
    init_test("e2e_surviving_waiters_acquire_in_turn");
    let stack = LockStack::start();
    let cx = stack.caller();
    let held = stack.client.acquire(&cx).expect("holder");

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let client = stack.client.clone();
            stack
                .units
                .spawn(move |cx| {
                    let ticket = client.acquire(cx)?;
                    client.release(cx, ticket)?;
                    Ok::<_, interruptible_rpc::Error>(ticket)
                })
                .expect("spawn waiter")
        })
        .collect();
    assert!(stack.wait_for_waiters(4));

    test_section!("cancel half the waiters");
    let (cancelled, survivors): (Vec<_>, Vec<_>) = waiters
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);
    for (_, handle) in cancelled {
        handle.cancel();
        let err = handle.join().expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
    }
    assert!(stack.wait_for_waiters(2));

    test_section!("release and let survivors run");
    stack.client.release(&cx, held).expect("release holder");
    for (_, handle) in survivors {
        let ticket = handle
            .join()
            .expect("join")
            .expect("survivor acquired and released");
        assert!(!ticket.is_none());
    }
    assert_eq!(stack.lock.holder(), None);
    assert!(wait_until(DEFAULT_WAIT, || stack.server_registry.is_empty()));
    test_complete!("e2e_surviving_waiters_acquire_in_turn");
}

// =========================================================================
// Release rules
// =========================================================================

#[test]
fn e2e_release_rules_over_rpc() {
    init_test("e2e_release_rules_over_rpc");
    let stack = LockStack::start();
    let cx = stack.caller();

    stack
        .client
        .release(&cx, Ticket::from_raw(0x1234))
        .expect("release of a free lock is a no-op");

    let ticket = stack.client.acquire(&cx).expect("acquire");
    let wrong = Ticket::from_raw(ticket.as_u64() ^ 1);
    assert_error_kind!(stack.client.release(&cx, wrong), ErrorKind::Remote);
    let none = Ticket::NONE;
    let err = stack.client.release(&cx, none).expect_err("empty ticket");
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(
        stack.lock.holder(),
        Some(ticket),
        "failed releases change nothing"
    );

    stack.client.release(&cx, ticket).expect("holder releases");
    stack
        .client
        .release(&cx, ticket)
        .expect("second release is a no-op");
    test_complete!("e2e_release_rules_over_rpc");
}

// =========================================================================
// Shutdown
// =========================================================================

#[test]
fn e2e_lock_shutdown_fails_waiters() {
    init_test("e2e_lock_shutdown_fails_waiters");
    let stack = LockStack::start();
    let cx = stack.caller();
    let _held = stack.client.acquire(&cx).expect("holder");

    let waiter = spawn_acquire(&stack);
    assert!(stack.wait_for_waiters(1));

    stack.lock.shutdown();
    let err = waiter.join().expect("join").expect_err("shutting down");
    assert_with_log!(
        err.kind() == ErrorKind::ShuttingDown,
        "waiter told the service is going away",
        ErrorKind::ShuttingDown,
        err.kind()
    );

    let err = stack.client.acquire(&cx).expect_err("no new grants");
    assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    assert!(stack.client.status(&cx).expect("status").shutting_down);
    test_complete!("e2e_lock_shutdown_fails_waiters");
}

#[test]
fn e2e_server_shutdown_cancels_waiting_handler() {
    init_test("e2e_server_shutdown_cancels_waiting_handler");
    let stack = LockStack::start();
    let cx = stack.caller();
    let held = stack.client.acquire(&cx).expect("holder");

    let waiter = spawn_acquire(&stack);
    assert!(stack.wait_for_waiters(1));

    stack.server.shutdown();
    let err = waiter.join().expect("join").expect_err("server gone");
    assert!(
        matches!(err.kind(), ErrorKind::Connection | ErrorKind::Abandoned),
        "waiter sees a genuine fault, got {err}"
    );
    assert!(stack.wait_for_waiters(0));
    assert_eq!(
        stack.lock.holder(),
        Some(held),
        "cancelled handler granted nothing"
    );
    assert!(wait_until(DEFAULT_WAIT, || stack.server.live_handlers() == 0));
    assert!(stack.server.is_shutting_down());
    test_complete!("e2e_server_shutdown_cancels_waiting_handler");
}
