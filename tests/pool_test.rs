//! End-to-end pool behavior on a paused clock: preconnects, backup jobs,
//! stall fallback through higher-layered pools, priority reshuffles, flush
//! semantics, and generation invalidation.

use sockpool::base::loadstate::LoadState;
use sockpool::base::neterror::NetError;
use sockpool::base::priority::RequestPriority;
use sockpool::socket::connectjob::{ConnectJobFactory, TransportConnectJobFactory};
use sockpool::socket::group_id::GroupId;
use sockpool::socket::handle::ClientSocketHandle;
use sockpool::socket::pool::{
    HigherLayeredPool, RequestParams, RespectLimits, SslConfigChangeKind,
    TransportClientSocketPool, TransportPoolParams,
};
use sockpool::socket::stream::StreamSocket;
use sockpool::socket::test_util::{completion, run_local, MockConnectJobFactory, MockJobBehavior};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

fn make_pool(
    max_sockets: usize,
    max_sockets_per_group: usize,
    factory: Rc<MockConnectJobFactory>,
) -> Rc<TransportClientSocketPool> {
    TransportClientSocketPool::new(
        TransportPoolParams {
            max_sockets,
            max_sockets_per_group,
            ..TransportPoolParams::default()
        },
        factory as Rc<dyn ConnectJobFactory>,
    )
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[tokio::test(start_paused = true)]
async fn test_preconnect_satisfies_real_request() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(10))));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "a.test", 80);

        let (preconnect_callback, preconnect_rx) = completion();
        let rv = pool.request_sockets(&group_id, 1, preconnect_callback);
        assert!(rv.is_pending());
        assert_eq!(factory.jobs_created(), 1);

        // The real request claims the in-flight preconnect job instead of
        // starting a second one.
        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        let rv = pool.request_socket(&group_id, &handle, RequestParams::default(), callback);
        assert!(rv.is_pending());
        assert_eq!(factory.jobs_created(), 1);

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(handle.has_socket());
        assert_eq!(pool.handed_out_socket_count(), 1);
        assert_eq!(pool.connecting_socket_count(), 0);
        assert_eq!(pool.idle_socket_count(), 0);

        assert_eq!(preconnect_rx.await.unwrap(), Ok(()));
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_backup_job_races_slow_connect() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        // First connect attempt drags through the TCP handshake for 600 ms;
        // the backup finishes in 10 ms.
        factory.enqueue(MockJobBehavior::pending_ok(ms(600)));
        factory.enqueue(MockJobBehavior::pending_ok(ms(10)));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "slow.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        let rv = pool.request_socket(&group_id, &handle, RequestParams::default(), callback);
        assert!(rv.is_pending());
        assert_eq!(factory.jobs_created(), 1);

        // The backup job fires at the 250 ms retry interval and wins.
        tokio::time::sleep(ms(300)).await;
        assert_eq!(factory.jobs_created(), 2);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(handle.has_socket());
        assert_eq!(pool.handed_out_socket_count(), 1);
        assert_eq!(pool.connecting_socket_count(), 1);

        // The loser eventually connects and is parked as idle.
        tokio::time::sleep(ms(400)).await;
        assert_eq!(pool.connecting_socket_count(), 0);
        assert_eq!(pool.idle_socket_count(), 1);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_backup_timer_rearms_while_resolving_dns() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::Stalled {
            load_state: LoadState::ResolvingHost,
            established: false,
        }));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "dns.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        let rv = pool.request_socket(&group_id, &handle, RequestParams::default(), callback);
        assert!(rv.is_pending());
        assert_eq!(pool.get_load_state(&group_id, &handle), LoadState::ResolvingHost);

        // Backup jobs hedge against lost SYNs, not slow DNS: the timer keeps
        // re-arming while the first job is resolving.
        tokio::time::sleep(ms(1000)).await;
        assert_eq!(factory.jobs_created(), 1);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_no_backup_job_once_connection_established() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::Stalled {
            load_state: LoadState::SslHandshake,
            established: true,
        }));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("https", "tls.test", 443);

        let handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        let rv = pool.request_socket(&group_id, &handle, RequestParams::default(), callback);
        assert!(rv.is_pending());

        tokio::time::sleep(ms(1000)).await;
        assert_eq!(factory.jobs_created(), 1);
        pool.check_consistency();
    })
    .await;
}

struct TestHigherPool {
    pool: RefCell<Option<Rc<TransportClientSocketPool>>>,
    held: RefCell<Option<(GroupId, Box<dyn StreamSocket>, i64)>>,
    calls: Cell<usize>,
}

impl TestHigherPool {
    fn new() -> Rc<Self> {
        Rc::new(Self { pool: RefCell::new(None), held: RefCell::new(None), calls: Cell::new(0) })
    }
}

impl HigherLayeredPool for TestHigherPool {
    fn close_one_idle_connection(&self) -> bool {
        let calls = self.calls.get() + 1;
        self.calls.set(calls);
        // First ask: nothing to give up yet.
        if calls == 1 {
            return false;
        }
        let Some((group_id, mut socket, generation)) = self.held.borrow_mut().take() else {
            return false;
        };
        socket.disconnect();
        let pool = self.pool.borrow().clone().expect("pool registered");
        pool.release_socket(&group_id, socket, generation);
        true
    }
}

#[tokio::test(start_paused = true)]
async fn test_global_stall_falls_back_to_higher_layered_pool() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(10))));
        let pool = make_pool(1, 1, Rc::clone(&factory));
        let group_1 = GroupId::new("http", "one.test", 80);
        let group_2 = GroupId::new("http", "two.test", 80);

        // First request takes the only global slot.
        let handle_1 = ClientSocketHandle::new();
        let (callback, rx_1) = completion();
        assert!(pool
            .request_socket(&group_1, &handle_1, RequestParams::default(), callback)
            .is_pending());
        assert_eq!(rx_1.await.unwrap(), Ok(()));

        // A higher layer now holds that socket active.
        let higher_pool = TestHigherPool::new();
        *higher_pool.pool.borrow_mut() = Some(Rc::clone(&pool));
        *higher_pool.held.borrow_mut() = Some((
            group_1.clone(),
            handle_1.pass_socket().unwrap(),
            handle_1.group_generation(),
        ));
        let higher_pool_dyn: Rc<dyn HigherLayeredPool> = higher_pool.clone();
        pool.add_higher_layered_pool(&higher_pool_dyn);

        // Second request stalls on the global budget; the posted stall check
        // queries the higher pool, which declines.
        let handle_2 = ClientSocketHandle::new();
        let (callback, rx_2) = completion();
        assert!(pool
            .request_socket(&group_2, &handle_2, RequestParams::default(), callback)
            .is_pending());
        tokio::time::sleep(ms(1)).await;
        assert_eq!(higher_pool.calls.get(), 1);
        assert!(pool.is_stalled());
        assert_eq!(
            pool.get_load_state(&group_2, &handle_2),
            LoadState::WaitingForStalledSocketPool
        );

        // Another arrival re-posts the stall check; this time the higher
        // pool gives up its connection and the top-priority request wins the
        // freed slot.
        let handle_3 = ClientSocketHandle::new();
        let (callback, mut rx_3) = completion();
        assert!(pool
            .request_socket(
                &group_2,
                &handle_3,
                RequestParams { priority: RequestPriority::Low, ..RequestParams::default() },
                callback,
            )
            .is_pending());

        assert_eq!(rx_2.await.unwrap(), Ok(()));
        assert!(handle_2.has_socket());
        assert_eq!(higher_pool.calls.get(), 2);
        assert_eq!(pool.handed_out_socket_count(), 1);
        assert!(rx_3.try_recv().is_err(), "lower-priority request stays queued");
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_priority_raise_steals_connect_job() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(100))));
        let pool = make_pool(10, 1, Rc::clone(&factory));
        let group_id = GroupId::new("http", "steal.test", 80);

        let handle_1 = ClientSocketHandle::new();
        let (callback, mut rx_1) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle_1,
                RequestParams { priority: RequestPriority::Medium, ..RequestParams::default() },
                callback,
            )
            .is_pending());

        let handle_2 = ClientSocketHandle::new();
        let (callback, rx_2) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle_2,
                RequestParams { priority: RequestPriority::Low, ..RequestParams::default() },
                callback,
            )
            .is_pending());
        // The single job works for the highest-priority request.
        assert_eq!(pool.get_load_state(&group_id, &handle_1), LoadState::Connecting);
        assert_eq!(
            pool.get_load_state(&group_id, &handle_2),
            LoadState::WaitingForAvailableSocket
        );

        pool.set_priority(&group_id, &handle_2, RequestPriority::Highest);
        assert_eq!(pool.get_load_state(&group_id, &handle_2), LoadState::Connecting);

        assert_eq!(rx_2.await.unwrap(), Ok(()));
        assert!(handle_2.has_socket());
        assert!(rx_1.try_recv().is_err(), "demoted request remains pending");
        assert_eq!(pool.handed_out_socket_count(), 1);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_set_priority_is_idempotent() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(50))));
        let pool = make_pool(10, 1, Rc::clone(&factory));
        let group_id = GroupId::new("http", "idem.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle, RequestParams::default(), callback)
            .is_pending());

        pool.set_priority(&group_id, &handle, RequestPriority::Highest);
        pool.set_priority(&group_id, &handle, RequestPriority::Highest);
        pool.check_consistency();

        assert_eq!(rx.await.unwrap(), Ok(()));
        // After completion the handle is gone from the queues; this must be
        // a no-op.
        pool.set_priority(&group_id, &handle, RequestPriority::Low);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_with_error_while_request_is_bound() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("https", "proxy.test", 443);
        let idle_group_id = GroupId::new("http", "idle.test", 80);

        // Park one idle socket so the flush has something to close.
        let idle_handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&idle_group_id, &idle_handle, RequestParams::default(), callback)
            .is_ok());
        pool.release_socket(
            &idle_group_id,
            idle_handle.pass_socket().unwrap(),
            idle_handle.group_generation(),
        );
        assert_eq!(pool.idle_socket_count(), 1);

        // Request whose connect job hits a proxy auth challenge.
        factory.enqueue(MockJobBehavior::NeedsProxyAuth { delay: ms(10) });
        let restart: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(None));
        let restart_slot = Rc::clone(&restart);
        let handle = ClientSocketHandle::new();
        let (callback, mut rx) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle,
                RequestParams {
                    proxy_auth_callback: Some(Rc::new(move |challenge| {
                        *restart_slot.borrow_mut() = Some(challenge.restart_with_auth);
                    })),
                    ..RequestParams::default()
                },
                callback,
            )
            .is_pending());

        tokio::time::sleep(ms(20)).await;
        let restart = restart.borrow_mut().take().expect("challenge was delivered");
        assert_eq!(pool.connecting_socket_count(), 1, "bound job still counts as connecting");

        pool.flush_with_error(
            NetError::NetworkChanged,
            TransportClientSocketPool::NETWORK_CHANGED,
        );
        assert_eq!(pool.idle_socket_count(), 0);
        // The bound request sees nothing yet: exactly one terminal event,
        // delivered when its job next completes.
        tokio::time::sleep(ms(1)).await;
        assert!(rx.try_recv().is_err());

        restart();
        assert_eq!(rx.await.unwrap(), Err(NetError::NetworkChanged));
        assert!(!handle.has_socket(), "socket from a flushed job is discarded");
        assert_eq!(pool.connecting_socket_count(), 0);
        assert_eq!(pool.handed_out_socket_count(), 0);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_ssl_config_change_drops_idle_and_starts_fresh_job() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("https", "refresh.test", 443);

        let handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle, RequestParams::default(), callback)
            .is_ok());
        pool.release_socket(&group_id, handle.pass_socket().unwrap(), handle.group_generation());
        assert_eq!(pool.idle_socket_count(), 1);

        let servers: HashSet<(String, u16)> =
            [("refresh.test".to_string(), 443)].into_iter().collect();
        pool.on_ssl_config_for_servers_changed(&servers);
        assert_eq!(pool.idle_socket_count(), 0);

        // The next request cannot be served from pre-change state.
        let handle_2 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_2, RequestParams::default(), callback)
            .is_ok());
        assert_eq!(factory.jobs_created(), 2);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_group_cap_queues_without_new_job() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(10, 1, Rc::clone(&factory));
        let group_id = GroupId::new("http", "cap.test", 80);

        let handle_1 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_1, RequestParams::default(), callback)
            .is_ok());

        let handle_2 = ClientSocketHandle::new();
        let (callback, mut rx_2) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_2, RequestParams::default(), callback)
            .is_pending());
        assert_eq!(factory.jobs_created(), 1, "no job beyond the per-group cap");
        assert_eq!(pool.connecting_socket_count(), 0);
        assert_eq!(
            pool.get_load_state(&group_id, &handle_2),
            LoadState::WaitingForAvailableSocket
        );
        assert!(rx_2.try_recv().is_err());
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_global_cap_steals_idle_slot_from_other_group() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(1, 1, Rc::clone(&factory));
        let group_1 = GroupId::new("http", "one.test", 80);
        let group_2 = GroupId::new("http", "two.test", 80);

        let handle_1 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_1, &handle_1, RequestParams::default(), callback)
            .is_ok());
        pool.release_socket(&group_1, handle_1.pass_socket().unwrap(), handle_1.group_generation());
        assert_eq!(pool.idle_socket_count(), 1);

        // The other group's oldest idle socket is sacrificed for the slot.
        let handle_2 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_2, &handle_2, RequestParams::default(), callback)
            .is_ok());
        assert!(handle_2.has_socket());
        assert_eq!(pool.idle_socket_count(), 0);
        assert_eq!(pool.handed_out_socket_count(), 1);
        assert!(!pool.has_active_socket(&group_1), "emptied group is removed");
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_request_prevents_callback() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(50))));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "cancel.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle, RequestParams::default(), callback)
            .is_pending());
        assert_eq!(pool.connecting_socket_count(), 1);

        pool.cancel_request(&group_id, &handle, /*cancel_connect_job=*/ true);
        assert_eq!(pool.connecting_socket_count(), 0);
        assert!(!pool.has_active_socket(&group_id));

        // Cancellation is observable only as the absence of a callback.
        tokio::time::sleep(ms(100)).await;
        assert!(rx.await.is_err());
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_scrubs_posted_callback_and_recovers_socket() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        factory.enqueue(MockJobBehavior::NeedsProxyAuth { delay: ms(10) });
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("https", "scrub.test", 443);

        let restart: Rc<RefCell<Option<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(None));
        let restart_slot = Rc::clone(&restart);
        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle,
                RequestParams {
                    proxy_auth_callback: Some(Rc::new(move |challenge| {
                        *restart_slot.borrow_mut() = Some(challenge.restart_with_auth);
                    })),
                    ..RequestParams::default()
                },
                callback,
            )
            .is_pending());

        tokio::time::sleep(ms(20)).await;
        let restart = restart.borrow_mut().take().expect("challenge was delivered");

        // Completing the job posts the callback; cancelling before the task
        // runner delivers it must scrub it and reclaim the socket.
        restart();
        assert!(handle.has_socket());
        pool.cancel_request(&group_id, &handle, /*cancel_connect_job=*/ false);
        assert_eq!(pool.idle_socket_count(), 1, "recovered socket is reusable");
        assert_eq!(pool.handed_out_socket_count(), 0);

        tokio::time::sleep(ms(10)).await;
        assert!(rx.await.is_err(), "scrubbed callback never fires");
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_fails_every_pending_request_exactly_once() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::Stalled {
            load_state: LoadState::Connecting,
            established: false,
        }));
        let pool = make_pool(10, 2, Rc::clone(&factory));

        let mut receivers = Vec::new();
        for host in ["a.test", "b.test", "c.test"] {
            let group_id = GroupId::new("http", host, 80);
            let handle = ClientSocketHandle::new();
            let (callback, rx) = completion();
            assert!(pool
                .request_socket(&group_id, &handle, RequestParams::default(), callback)
                .is_pending());
            receivers.push(rx);
        }
        assert_eq!(pool.connecting_socket_count(), 3);

        pool.on_ip_address_changed();
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(NetError::NetworkChanged));
        }
        assert_eq!(pool.connecting_socket_count(), 0);
        assert_eq!(pool.idle_socket_count(), 0);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_preconnect_capped_to_group_budget() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::pending_ok(ms(10))));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "pre.test", 80);

        let (callback, rx) = completion();
        let rv = pool.request_sockets(&group_id, 5, callback);
        assert!(rv.is_pending());
        assert_eq!(factory.jobs_created(), 2, "preconnect count capped to the group budget");

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(pool.idle_socket_count(), 2);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_preconnect_at_global_limit_fails_locally() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(1, 1, Rc::clone(&factory));
        let group_1 = GroupId::new("http", "one.test", 80);
        let group_2 = GroupId::new("http", "two.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_1, &handle, RequestParams::default(), callback)
            .is_ok());

        // No idle socket to evict anywhere: the preconnect fails locally
        // instead of queueing.
        let (callback, _rx) = completion();
        let rv = pool.request_sockets(&group_2, 1, callback);
        assert!(rv.is_ok(), "preconnect failures are not surfaced");
        assert_eq!(factory.jobs_created(), 1);
        assert!(!pool.has_active_socket(&group_2));
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_limit_ignoring_request_bypasses_budgets() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(1, 1, Rc::clone(&factory));
        let group_id = GroupId::new("http", "vip.test", 80);

        let handle_1 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_1, RequestParams::default(), callback)
            .is_ok());

        // Same group, both budgets exhausted; the limit-ignoring request
        // connects anyway.
        let handle_2 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        let rv = pool.request_socket(
            &group_id,
            &handle_2,
            RequestParams {
                priority: RequestPriority::Highest,
                respect_limits: RespectLimits::Disabled,
                ..RequestParams::default()
            },
            callback,
        );
        assert!(rv.is_ok());
        assert!(handle_2.has_socket());
        assert_eq!(pool.handed_out_socket_count(), 2);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reaches_highest_priority_waiter() {
    run_local(async {
        // After the failure the pool retries for the remaining waiter, so
        // the follow-up job must stall to keep that request pending.
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::Stalled {
            load_state: LoadState::Connecting,
            established: false,
        }));
        factory.enqueue(MockJobBehavior::PendingThenError {
            delay: ms(10),
            error: NetError::ConnectionRefused,
        });
        let pool = make_pool(10, 1, Rc::clone(&factory));
        let group_id = GroupId::new("http", "refused.test", 80);

        let handle_low = ClientSocketHandle::new();
        let (callback, mut rx_low) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle_low,
                RequestParams { priority: RequestPriority::Low, ..RequestParams::default() },
                callback,
            )
            .is_pending());

        let handle_high = ClientSocketHandle::new();
        let (callback, rx_high) = completion();
        assert!(pool
            .request_socket(
                &group_id,
                &handle_high,
                RequestParams { priority: RequestPriority::Highest, ..RequestParams::default() },
                callback,
            )
            .is_pending());

        // The failure goes to the highest-priority waiter, with the error
        // details transferred to its handle; the demoted request gets a
        // fresh connect attempt.
        assert_eq!(rx_high.await.unwrap(), Err(NetError::ConnectionRefused));
        assert!(handle_high.connect_error_details().is_some());
        assert!(rx_low.try_recv().is_err());
        assert_eq!(factory.jobs_created(), 2);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_socket_timeouts() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = TransportClientSocketPool::new(
            TransportPoolParams {
                max_sockets: 10,
                max_sockets_per_group: 2,
                unused_idle_socket_timeout: Duration::from_secs(10),
                used_idle_socket_timeout: Duration::from_secs(300),
                ..TransportPoolParams::default()
            },
            Rc::clone(&factory) as Rc<dyn ConnectJobFactory>,
        );
        let group_id = GroupId::new("http", "age.test", 80);

        // One never-used and one used idle socket.
        let handle_1 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_1, RequestParams::default(), callback)
            .is_ok());
        let handle_2 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_2, RequestParams::default(), callback)
            .is_ok());
        factory.socket_controls()[1].set_was_used(true);
        pool.release_socket(&group_id, handle_1.pass_socket().unwrap(), handle_1.group_generation());
        pool.release_socket(&group_id, handle_2.pass_socket().unwrap(), handle_2.group_generation());
        assert_eq!(pool.idle_socket_count(), 2);

        // Past the unused timeout, the never-used socket is dropped on the
        // next admission sweep; the used one survives and is handed out.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let handle_3 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_3, RequestParams::default(), callback)
            .is_ok());
        assert!(handle_3.is_reused(), "surviving used-idle socket is handed out");
        assert_eq!(factory.jobs_created(), 2);
        assert_eq!(pool.idle_socket_count(), 0);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_pool_info_snapshot() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::new(MockJobBehavior::Stalled {
            load_state: LoadState::Connecting,
            established: false,
        }));
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_id = GroupId::new("http", "info.test", 80);

        let handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle, RequestParams::default(), callback)
            .is_pending());

        let info = pool.info_as_value("transport", "transport_socket_pool");
        assert_eq!(info["connecting_socket_count"], 1);
        assert_eq!(info["max_socket_count"], 10);
        let group = &info["groups"]["http://info.test:80"];
        assert_eq!(group["pending_request_count"], 1);
        assert_eq!(group["connect_job_count"], 1);
        assert_eq!(group["top_pending_priority"], "MEDIUM");
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cert_database_change_refreshes_every_group() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let idle_group_id = GroupId::new("https", "idle.test", 443);
        let pending_group_id = GroupId::new("https", "pending.test", 443);

        let idle_handle = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&idle_group_id, &idle_handle, RequestParams::default(), callback)
            .is_ok());
        pool.release_socket(
            &idle_group_id,
            idle_handle.pass_socket().unwrap(),
            idle_handle.group_generation(),
        );

        factory.enqueue(MockJobBehavior::pending_ok(ms(50)));
        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        assert!(pool
            .request_socket(&pending_group_id, &handle, RequestParams::default(), callback)
            .is_pending());

        pool.on_ssl_config_changed(SslConfigChangeKind::CertDatabaseChanged);
        assert_eq!(pool.idle_socket_count(), 0);
        // The refreshed group's job was cancelled; the stall sweep started a
        // replacement for the still-queued request.
        assert_eq!(factory.jobs_created(), 3);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(handle.has_socket());
        pool.check_consistency();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_close_idle_sockets_in_group_only_touches_that_group() {
    run_local(async {
        let factory = Rc::new(MockConnectJobFactory::sync_ok());
        let pool = make_pool(10, 2, Rc::clone(&factory));
        let group_1 = GroupId::new("http", "one.test", 80);
        let group_2 = GroupId::new("http", "two.test", 80);

        for group_id in [&group_1, &group_2] {
            let handle = ClientSocketHandle::new();
            let (callback, _rx) = completion();
            assert!(pool
                .request_socket(group_id, &handle, RequestParams::default(), callback)
                .is_ok());
            pool.release_socket(group_id, handle.pass_socket().unwrap(), handle.group_generation());
        }
        assert_eq!(pool.idle_socket_count(), 2);

        pool.close_idle_sockets_in_group(&group_1, "Network changed");
        assert_eq!(pool.idle_socket_count_in_group(&group_1), 0);
        assert_eq!(pool.idle_socket_count_in_group(&group_2), 1);
        assert!(!pool.has_active_socket(&group_1));

        pool.close_idle_sockets("Network changed");
        assert_eq!(pool.idle_socket_count(), 0);
        pool.check_consistency();
    })
    .await;
}

#[tokio::test]
async fn test_transport_connect_job_against_local_listener() {
    run_local(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {
                // Hold accepted connections until the test ends.
            }
        });

        let pool = TransportClientSocketPool::new(
            TransportPoolParams::default(),
            Rc::new(TransportConnectJobFactory) as Rc<dyn ConnectJobFactory>,
        );
        let group_id = GroupId::new("http", "127.0.0.1", port);

        let handle = ClientSocketHandle::new();
        let (callback, rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle, RequestParams::default(), callback)
            .is_pending());
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(handle.has_socket());

        // Round trip through the idle list.
        pool.release_socket(&group_id, handle.pass_socket().unwrap(), handle.group_generation());
        assert_eq!(pool.idle_socket_count(), 1);
        let handle_2 = ClientSocketHandle::new();
        let (callback, _rx) = completion();
        assert!(pool
            .request_socket(&group_id, &handle_2, RequestParams::default(), callback)
            .is_ok());
        assert!(handle_2.has_socket());
        pool.check_consistency();
    })
    .await;
}
