//! End-to-end scenarios for the multi-rail engine: striping across rails,
//! notification ordering against delayed rails, and release semantics.

use std::time::{Duration, Instant};

use fabrix::{
    BackendEngine, EngineParams, FabrixError, LocalDesc, MemDesc, MultiRailEngine, RemoteDesc,
    Topology, XferOp, XferOpts, XferStatus,
};

const MIB: usize = 1024 * 1024;

fn engine(agent: &str, data_rails: usize) -> MultiRailEngine {
    let mut params = EngineParams::new(agent);
    params.num_data_rails = data_rails;
    params.striping_threshold = MIB;
    params.progress_thread = false;
    MultiRailEngine::with_topology(params, Topology::undiscovered()).unwrap()
}

fn link(a: &MultiRailEngine, b: &MultiRailEngine) {
    a.load_remote_conn_info(b.local_agent(), &b.conn_info().unwrap())
        .unwrap();
    b.load_remote_conn_info(a.local_agent(), &a.conn_info().unwrap())
        .unwrap();
    a.connect(b.local_agent()).unwrap();
}

fn one_desc(buf: &[u8], mem: &fabrix::MemHandle) -> Vec<LocalDesc> {
    vec![LocalDesc {
        addr: buf.as_ptr() as u64,
        len: buf.len(),
        mem: mem.clone(),
    }]
}

fn one_remote(base: u64, len: usize, mem: &fabrix::RemoteMemHandle) -> Vec<RemoteDesc> {
    vec![RemoteDesc {
        addr: base,
        len,
        mem: mem.clone(),
    }]
}

fn wait_complete(engine: &MultiRailEngine, req: &fabrix::ReqHandle) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match engine.check_xfer(req).unwrap() {
            XferStatus::Complete => return,
            XferStatus::InProgress => {
                assert!(Instant::now() < deadline, "transfer never completed");
                std::thread::yield_now();
            }
        }
    }
}

fn notifs_from(engine: &MultiRailEngine, from: &str) -> Option<Vec<Vec<u8>>> {
    engine.take_notifs().unwrap().remove(from)
}

fn wait_notif(engine: &MultiRailEngine, from: &str, expect: &[u8]) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(msgs) = notifs_from(engine, from) {
            assert_eq!(msgs, vec![expect.to_vec()]);
            return;
        }
        assert!(Instant::now() < deadline, "notification never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// An 8 MiB descriptor over four rails with a 1 MiB threshold stripes into
/// exactly one sub-request per rail, and the notification only fires after
/// all four complete.
#[test]
fn write_stripes_across_all_rails() {
    let a = engine("striper", 4);
    let b = engine("target", 4);
    link(&a, &b);

    let src = vec![0xA7u8; 8 * MIB];
    let dst = vec![0u8; 8 * MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    // Hold every rail so the sub-request fan-out is observable.
    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, true);
    }

    let opts = XferOpts::with_notif("striped");
    let req = a
        .prep_xfer(
            XferOp::Write,
            &one_desc(&src, &a_mem),
            &one_remote(dst.as_ptr() as u64, dst.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    assert_eq!(a.post_xfer(&req, &opts).unwrap(), XferStatus::InProgress);

    // One data-pool slot per rail is outstanding.
    assert_eq!(a.outstanding_requests(), 4);

    // The notification was sent immediately but must be held at the
    // receiver until the data lands.
    std::thread::sleep(Duration::from_millis(20));
    assert!(notifs_from(&b, "striper").is_none());
    assert!(dst.iter().all(|&byte| byte == 0));

    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, false);
    }
    wait_complete(&a, &req);
    assert!(dst.iter().all(|&byte| byte == 0xA7));
    wait_notif(&b, "striper", b"striped");

    a.release_req(&req).unwrap();
    assert_eq!(a.outstanding_requests(), 0);

    a.unload_md(b_md).unwrap();
    b.deregister_mem(b_mem).unwrap();
    a.deregister_mem(a_mem).unwrap();
}

/// Delay a single rail: the notification stays pending until that rail's
/// XFER_ID arrives, then flips to delivered.
#[test]
fn notification_held_for_delayed_rail() {
    let a = engine("delayer", 4);
    let b = engine("target", 4);
    link(&a, &b);

    let src = vec![0x3Cu8; 8 * MIB];
    let dst = vec![0u8; 8 * MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    // Only rail 2 lags.
    a.set_data_rail_paused(2, true);

    let opts = XferOpts::with_notif("ordered");
    let req = a
        .prep_xfer(
            XferOp::Write,
            &one_desc(&src, &a_mem),
            &one_remote(dst.as_ptr() as u64, dst.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    let _ = a.post_xfer(&req, &opts).unwrap();

    // Three rails' XFER_IDs arrive; the manifest is not subsumed yet.
    let deadline = Instant::now() + Duration::from_secs(5);
    while a.check_xfer(&req).unwrap() == XferStatus::InProgress
        && a.outstanding_requests() > 1
    {
        assert!(Instant::now() < deadline);
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(20));
    assert!(
        notifs_from(&b, "delayer").is_none(),
        "notification outran the delayed rail"
    );

    a.set_data_rail_paused(2, false);
    wait_complete(&a, &req);
    wait_notif(&b, "delayer", b"ordered");
    assert!(dst.iter().all(|&byte| byte == 0x3C));

    a.release_req(&req).unwrap();
}

/// Transfers at or below the striping threshold ride a single rail.
#[test]
fn small_transfer_uses_one_rail() {
    let a = engine("small", 4);
    let b = engine("target", 4);
    link(&a, &b);

    let src = vec![0x11u8; MIB];
    let dst = vec![0u8; MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, true);
    }

    let opts = XferOpts::default();
    let req = a
        .prep_xfer(
            XferOp::Write,
            &one_desc(&src, &a_mem),
            &one_remote(dst.as_ptr() as u64, dst.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    assert_eq!(a.post_xfer(&req, &opts).unwrap(), XferStatus::InProgress);
    assert_eq!(a.outstanding_requests(), 1, "threshold-sized transfer must not stripe");

    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, false);
    }
    wait_complete(&a, &req);
    assert!(dst.iter().all(|&byte| byte == 0x11));
    a.release_req(&req).unwrap();
}

/// Reads pull remote bytes and the attached notification trails completion.
#[test]
fn read_completes_and_notifies_target() {
    let a = engine("reader", 2);
    let b = engine("target", 2);
    link(&a, &b);

    let dst = vec![0u8; 4 * MIB];
    let src = vec![0xDAu8; 4 * MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    let opts = XferOpts::with_notif("read-done");
    let req = a
        .prep_xfer(
            XferOp::Read,
            &one_desc(&dst, &a_mem),
            &one_remote(src.as_ptr() as u64, src.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    if a.post_xfer(&req, &opts).unwrap() == XferStatus::InProgress {
        wait_complete(&a, &req);
    }
    assert!(dst.iter().all(|&byte| byte == 0xDA));
    wait_notif(&b, "reader", b"read-done");
    a.release_req(&req).unwrap();
}

/// Release on an in-progress request returns synchronously and the handle
/// reaches a terminal state instead of polling `InProgress` forever.
#[test]
fn release_while_in_progress_reaches_terminal() {
    let a = engine("releaser", 4);
    let b = engine("target", 4);
    link(&a, &b);

    let src = vec![9u8; 8 * MIB];
    let dst = vec![0u8; 8 * MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, true);
    }

    let opts = XferOpts::default();
    let req = a
        .prep_xfer(
            XferOp::Write,
            &one_desc(&src, &a_mem),
            &one_remote(dst.as_ptr() as u64, dst.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    assert_eq!(a.post_xfer(&req, &opts).unwrap(), XferStatus::InProgress);

    let released_at = Instant::now();
    a.release_req(&req).unwrap();
    assert!(released_at.elapsed() < Duration::from_secs(1));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match a.check_xfer(&req) {
            Ok(XferStatus::InProgress) => {
                assert!(Instant::now() < deadline, "stuck in progress after release");
                std::thread::yield_now();
            }
            Ok(XferStatus::Complete) => panic!("released request completed successfully"),
            Err(FabrixError::Cancelled) => break,
            Err(other) => panic!("unexpected terminal error: {other}"),
        }
    }
    assert_eq!(a.outstanding_requests(), 0);

    for rail in 0..a.num_data_rails() {
        a.set_data_rail_paused(rail, false);
    }
}

/// Registration handles quiesce: after every load/unload/deregister pair,
/// no pool entry stays outstanding.
#[test]
fn metadata_lifecycle_leaks_nothing() {
    let a = engine("clean", 2);
    let b = engine("target", 2);
    link(&a, &b);

    for _ in 0..4 {
        let buf = vec![0u8; 2 * MIB];
        let mem = b.register_mem(&MemDesc::for_slice(&buf)).unwrap();
        let blob = b.public_data(&mem).unwrap();
        let md = a.load_remote_md("target", &blob).unwrap();
        a.unload_md(md).unwrap();
        b.deregister_mem(mem).unwrap();
    }
    assert_eq!(a.outstanding_requests(), 0);
    assert_eq!(b.outstanding_requests(), 0);
}

/// A run with the dedicated progress thread enabled: completion and
/// notification delivery require no user-driven progress on the receiver.
#[test]
fn progress_thread_drives_completion() {
    let mut params = EngineParams::new("threaded");
    params.num_data_rails = 2;
    params.striping_threshold = MIB;
    params.progress_thread = true;
    let a = MultiRailEngine::with_topology(params, Topology::undiscovered()).unwrap();

    let mut params = EngineParams::new("target");
    params.num_data_rails = 2;
    params.striping_threshold = MIB;
    params.progress_thread = true;
    let b = MultiRailEngine::with_topology(params, Topology::undiscovered()).unwrap();
    link(&a, &b);

    let src = vec![0x66u8; 4 * MIB];
    let dst = vec![0u8; 4 * MIB];
    let a_mem = a.register_mem(&MemDesc::for_slice(&src)).unwrap();
    let b_mem = b.register_mem(&MemDesc::for_slice(&dst)).unwrap();
    let b_md = a
        .load_remote_md("target", &b.public_data(&b_mem).unwrap())
        .unwrap();

    let opts = XferOpts::with_notif("threaded-done");
    let req = a
        .prep_xfer(
            XferOp::Write,
            &one_desc(&src, &a_mem),
            &one_remote(dst.as_ptr() as u64, dst.len(), &b_md),
            "target",
            &opts,
        )
        .unwrap();
    let _ = a.post_xfer(&req, &opts).unwrap();

    wait_complete(&a, &req);
    assert!(dst.iter().all(|&byte| byte == 0x66));
    wait_notif(&b, "threaded", b"threaded-done");
    a.release_req(&req).unwrap();
}

/// GPU-to-GPU transfer across two devices; requires the `cuda` feature and
/// at least two visible devices, otherwise skips.
#[cfg(feature = "cuda")]
#[test]
fn vram_write_across_devices() {
    use cudarc::driver::{CudaDevice, DevicePtr};
    use fabrix::MemKind;

    if !fabrix::gpu::is_cuda_available() {
        eprintln!("skipping: no CUDA device");
        return;
    }
    let Ok(dev0) = CudaDevice::new(0) else {
        return;
    };
    let Ok(dev1) = CudaDevice::new(1) else {
        eprintln!("skipping: fewer than two CUDA devices");
        return;
    };

    // The address workaround pins an engine to one device.
    std::env::set_var("FABRIX_DISABLE_CUDA_ADDR_WA", "1");

    let size = 64 * MIB;
    let pattern = vec![0x5Au8; size];
    let src = dev0.htod_sync_copy(&pattern).unwrap();
    let dst = dev1.alloc_zeros::<u8>(size).unwrap();

    let a = engine("gpu-a", 2);
    let b = engine("gpu-b", 2);
    link(&a, &b);

    let a_mem = a
        .register_mem(&MemDesc::new(*src.device_ptr() as u64, size, 0, MemKind::Vram))
        .unwrap();
    let b_mem = b
        .register_mem(&MemDesc::new(*dst.device_ptr() as u64, size, 1, MemKind::Vram))
        .unwrap();
    let b_md = a
        .load_remote_md("gpu-b", &b.public_data(&b_mem).unwrap())
        .unwrap();

    let opts = XferOpts::with_notif("gpu");
    let locals = vec![LocalDesc {
        addr: *src.device_ptr() as u64,
        len: size,
        mem: a_mem.clone(),
    }];
    let remotes = vec![RemoteDesc {
        addr: *dst.device_ptr() as u64,
        len: size,
        mem: b_md.clone(),
    }];
    let req = a
        .prep_xfer(XferOp::Write, &locals, &remotes, "gpu-b", &opts)
        .unwrap();
    if a.post_xfer(&req, &opts).unwrap() == XferStatus::InProgress {
        wait_complete(&a, &req);
    }
    wait_notif(&b, "gpu-a", b"gpu");

    // Verify through a host copy.
    let host = dev1.dtoh_sync_copy(&dst).unwrap();
    assert!(host.iter().all(|&byte| byte == 0x5A));
    a.release_req(&req).unwrap();
}
