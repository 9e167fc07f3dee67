//! End-to-end scenarios driven through `Context::poll_event`, in-process,
//! with a master and slave context sharing one socket path (per-endpoint
//! callbacks use a raw `private_ctx` pointer, matching the C-style callback
//! contract the original ICMP responder demo uses).

use std::cell::Cell;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use memif::{Context, EndpointConfig, EndpointId, Mode, Role};

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("memif-it-{}-{}", std::process::id(), name))
}

fn pump(contexts: &mut [&mut Context], deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        for ctx in contexts.iter_mut() {
            let _ = ctx.poll_event(Some(20));
        }
        if done() {
            return true;
        }
    }
    false
}

extern "C" fn mark_true(_id: EndpointId, ctx: *mut c_void) {
    unsafe { (*(ctx as *const Cell<bool>)).set(true) };
}

#[test]
fn master_first_then_slave_connects() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = socket_path("master-first");
    let _ = std::fs::remove_file(&path);

    let mut master_ctx = Context::new(None).unwrap();
    let mut slave_ctx = Context::new(None).unwrap();

    let master_connected = Box::new(Cell::new(false));
    let slave_connected = Box::new(Cell::new(false));

    let base = EndpointConfig {
        interface_id: 1,
        mode: Mode::Ethernet,
        socket_path: path.clone(),
        log2_ring_size: 6,
        ..EndpointConfig::default()
    };

    master_ctx
        .create_endpoint(
            EndpointConfig {
                role: Role::Master,
                ..base.clone()
            },
            move |id, ctx| mark_true(id, ctx),
            |_, _| {},
            |_, _, _| {},
            master_connected.as_ref() as *const _ as *mut c_void,
        )
        .expect("create master");

    slave_ctx
        .create_endpoint(
            EndpointConfig {
                role: Role::Slave,
                ..base
            },
            move |id, ctx| mark_true(id, ctx),
            |_, _| {},
            |_, _, _| {},
            slave_connected.as_ref() as *const _ as *mut c_void,
        )
        .expect("create slave");

    let connected = pump(
        &mut [&mut master_ctx, &mut slave_ctx],
        Duration::from_secs(6),
        || master_connected.get() && slave_connected.get(),
    );

    assert!(connected, "both sides should reach on_connect");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn slave_first_waits_then_master_arrives() {
    let path = socket_path("slave-first");
    let _ = std::fs::remove_file(&path);

    let mut slave_ctx = Context::new(None).unwrap();
    let slave_connected = Box::new(Cell::new(false));

    let base = EndpointConfig {
        interface_id: 2,
        mode: Mode::Ethernet,
        socket_path: path.clone(),
        log2_ring_size: 6,
        role: Role::Slave,
        ..EndpointConfig::default()
    };

    slave_ctx
        .create_endpoint(
            base,
            move |id, ctx| mark_true(id, ctx),
            |_, _| {},
            |_, _, _| {},
            slave_connected.as_ref() as *const _ as *mut c_void,
        )
        .expect("create slave");

    // let at least one reconnect tick pass with nobody listening
    let _ = pump(&mut [&mut slave_ctx], Duration::from_millis(300), || false);
    assert!(!slave_connected.get());

    let mut master_ctx = Context::new(None).unwrap();
    let master_connected = Box::new(Cell::new(false));
    master_ctx
        .create_endpoint(
            EndpointConfig {
                role: Role::Master,
                interface_id: 2,
                mode: Mode::Ethernet,
                socket_path: path.clone(),
                log2_ring_size: 6,
                ..EndpointConfig::default()
            },
            move |id, ctx| mark_true(id, ctx),
            |_, _| {},
            |_, _, _| {},
            master_connected.as_ref() as *const _ as *mut c_void,
        )
        .expect("create master");

    let connected = pump(
        &mut [&mut master_ctx, &mut slave_ctx],
        Duration::from_secs(6),
        || master_connected.get() && slave_connected.get(),
    );
    assert!(connected);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn secret_mismatch_disconnects_the_slave() {
    let path = socket_path("secret-mismatch");
    let _ = std::fs::remove_file(&path);

    let mut master_ctx = Context::new(None).unwrap();
    let mut slave_ctx = Context::new(None).unwrap();
    let slave_disconnected = Box::new(Cell::new(false));

    master_ctx
        .create_endpoint(
            EndpointConfig {
                role: Role::Master,
                interface_id: 3,
                socket_path: path.clone(),
                log2_ring_size: 6,
                secret: Some("abc".into()),
                ..EndpointConfig::default()
            },
            |_, _| {},
            |_, _| {},
            |_, _, _| {},
            std::ptr::null_mut(),
        )
        .expect("create master");

    slave_ctx
        .create_endpoint(
            EndpointConfig {
                role: Role::Slave,
                interface_id: 3,
                socket_path: path.clone(),
                log2_ring_size: 6,
                secret: Some("xyz".into()),
                ..EndpointConfig::default()
            },
            |_, _| {},
            move |id, ctx| mark_true(id, ctx),
            |_, _, _| {},
            slave_disconnected.as_ref() as *const _ as *mut c_void,
        )
        .expect("create slave");

    let disconnected = pump(
        &mut [&mut master_ctx, &mut slave_ctx],
        Duration::from_secs(6),
        || slave_disconnected.get(),
    );
    assert!(disconnected, "secret mismatch should fire on_disconnect on the slave");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn stale_non_socket_file_is_rejected_then_recovers() {
    let path = socket_path("stale-file");
    let _ = std::fs::remove_file(&path);
    std::fs::write(&path, b"not a socket").unwrap();

    let mut ctx = Context::new(None).unwrap();
    let result = ctx.create_endpoint(
        EndpointConfig {
            role: Role::Master,
            interface_id: 4,
            socket_path: path.clone(),
            ..EndpointConfig::default()
        },
        |_, _| {},
        |_, _| {},
        |_, _, _| {},
        std::ptr::null_mut(),
    );
    assert!(result.is_err());

    let _ = std::fs::remove_file(&path);
    let result = ctx.create_endpoint(
        EndpointConfig {
            role: Role::Master,
            interface_id: 4,
            socket_path: path.clone(),
            ..EndpointConfig::default()
        },
        |_, _| {},
        |_, _| {},
        |_, _, _| {},
        std::ptr::null_mut(),
    );
    assert!(result.is_ok());
    let _ = std::fs::remove_file(&path);
}
