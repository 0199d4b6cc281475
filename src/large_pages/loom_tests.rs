/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --profile loom`
///
/// The remap itself is single-threaded by contract; what races is the
/// once-only entry state and the diagnostic counters. Thread counts stay at 2.
#[cfg(loom)]
mod tests {
    use crate::large_pages::manager::OnceStatus;
    use crate::large_pages::stats::Counter;
    use crate::large_pages::status::StatusCode;
    use crate::sync::atomic::{AtomicU8, Ordering};
    use crate::sync::Arc;

    // =====================================================================
    // 1. OnceStatus
    // =====================================================================

    #[test]
    fn loom_once_status_runs_exactly_once() {
        loom::model(|| {
            let once = Arc::new(OnceStatus::new());
            let runs = Arc::new(AtomicU8::new(0));

            let spawn_caller = |status: StatusCode| {
                let once = once.clone();
                let runs = runs.clone();
                loom::thread::spawn(move || {
                    once.get_or_run(|| {
                        runs.fetch_add(1, Ordering::Relaxed);
                        status
                    })
                })
            };
            let t1 = spawn_caller(StatusCode::Ok);
            let t2 = spawn_caller(StatusCode::MappingFailure);

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            assert_eq!(a, b, "both callers must see the first result");
            assert_eq!(runs.load(Ordering::Relaxed), 1);
            assert_eq!(once.get(), Some(a));
        });
    }

    #[test]
    fn loom_once_status_get_never_sees_partial_result() {
        loom::model(|| {
            let once = Arc::new(OnceStatus::new());
            let reader = {
                let once = once.clone();
                loom::thread::spawn(move || once.get())
            };

            let status = once.get_or_run(|| StatusCode::RegionNotFound);
            assert_eq!(status, StatusCode::RegionNotFound);

            let seen = reader.join().unwrap();
            assert!(seen.is_none() || seen == Some(StatusCode::RegionNotFound));
        });
    }

    // =====================================================================
    // 2. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add() {
        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || c1.add(3));
            let t2 = loom::thread::spawn(move || c2.add(4));
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(counter.get(), 7);
        });
    }
}
