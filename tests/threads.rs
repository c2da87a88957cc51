use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use sable::{libraries, Ctx, RtResult, Runtime, RuntimeOptions, Value};

fn small_pools() -> RuntimeOptions {
    let mut options = RuntimeOptions::new();
    options.pool_block = 64;
    options.alloc_batch = 8;
    options.dead_blocks = 4;
    options
}

const ALLOCATING: &[u8] = br#"
    var total = 0;
    var keep = [];
    for (var i = 0; i < 2000; i += 1) {
        var v = [i, "s" ~ i, { k: i }];
        total += v[2].k;
        if (i - int(i / 100) * 100 == 0) append(keep, v);
    }
    foreach (v; keep) {
        if (v[1] != "s" ~ v[0]) die("corrupted: " ~ v[1]);
    }
    total
"#;

#[test]
fn threads_allocate_while_collecting() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rt = Runtime::with_options(small_pools());

    thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let rt = &rt;
                s.spawn(move || {
                    let mut cx = rt.new_context();
                    let ns = cx.with(|ctx| {
                        let ns = ctx.new_hash();
                        libraries::core::register(ctx, &ns).unwrap();
                        ns
                    });
                    let file = format!("worker{}.nas", n);
                    let code = cx.compile(ALLOCATING, &file, 1).unwrap();
                    cx.call(&code, &[], Value::Nil, ns)
                        .map(|v| v.num())
                        .map_err(|e| e.to_string())
                })
            })
            .collect();

        for _ in 0..5 {
            rt.collect();
            thread::sleep(Duration::from_millis(2));
        }

        for worker in workers {
            assert_eq!(worker.join().unwrap(), Ok(Some(1_999_000.0)));
        }
    });

    let stats = rt.stats();
    assert!(stats.collections >= 5);
    assert!(stats.total_cells >= stats.free_cells);
}

static LOOP_STARTED: AtomicBool = AtomicBool::new(false);

fn started(_ctx: &mut Ctx<'_>, _me: Value, _args: &[Value]) -> RtResult {
    LOOP_STARTED.store(true, Ordering::SeqCst);
    Ok(Value::Nil)
}

#[test]
fn tight_loops_reach_safepoints() {
    let rt = Runtime::new();

    thread::scope(|s| {
        let spinner = s.spawn(|| {
            let mut cx = rt.new_context();
            let ns = cx.with(|ctx| ctx.new_lib(&[("started", started)]).unwrap());
            let code = cx
                .compile(b"started(); var i = 0; while (i < 200000) i += 1; i", "spin.nas", 1)
                .unwrap();
            cx.call(&code, &[], Value::Nil, ns).map(|v| v.num()).ok().flatten()
        });

        while !LOOP_STARTED.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        // Returns only once the spinning thread has parked at a backward jump
        // or left the runtime.
        rt.collect();
        assert_eq!(spinner.join().unwrap(), Some(200_000.0));
    });

    assert!(rt.stats().collections >= 1);
}

#[test]
fn pinned_values_survive() {
    let rt = Runtime::with_options(small_pools());
    let mut cx = rt.new_context();
    let (kept, key) = cx.with(|ctx| {
        let kept = ctx.new_string("pinned");
        let key = ctx.runtime().gc_save(kept.clone());
        (kept, key)
    });
    let code = cx
        .compile(b"var v = []; for (var i = 0; i < 500; i += 1) v = [v, \"x\" ~ i]; 1", "churn.nas", 1)
        .unwrap();
    cx.call(&code, &[], Value::Nil, Value::Nil).unwrap();
    rt.collect();
    assert_eq!(kept.to_str_lossy().as_deref(), Some("pinned"));
    rt.gc_release(key);
}
