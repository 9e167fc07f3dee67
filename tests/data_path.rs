//! End-to-end data-path scenarios (SPEC_FULL.md §8 scenarios 3 and 4), driven
//! through a connected master/slave `Context` pair rather than the raw
//! `Queue` plumbing `src/data_path.rs`'s unit tests exercise directly.

use std::cell::Cell;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use memif::{Context, EndpointConfig, EndpointId, Mode, Role};

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("memif-dp-it-{}-{}", std::process::id(), name))
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

fn connect_pair(name: &str, log2_ring_size: u8) -> (Context, EndpointId, Context, EndpointId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = socket_path(name);
    let _ = std::fs::remove_file(&path);

    let mut master_ctx = Context::new(None).unwrap();
    let mut slave_ctx = Context::new(None).unwrap();

    let master_connected = Box::new(Cell::new(false));
    let slave_connected = Box::new(Cell::new(false));

    let base = EndpointConfig {
        interface_id: 7,
        mode: Mode::Ethernet,
        socket_path: path.clone(),
        log2_ring_size,
        ..EndpointConfig::default()
    };

    let master_id = master_ctx
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

    let slave_id = slave_ctx
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
    assert!(connected, "master and slave should connect");
    let _ = std::fs::remove_file(&path);

    (master_ctx, master_id, slave_ctx, slave_id)
}

// --- minimal Ethernet/IP/ICMP helpers, enough to drive scenario 3 ---

fn internet_checksum(data: &[u8]) -> u16 {
    let mut acc: u32 = 0xffff;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        if acc > 0xffff {
            acc -= 0xffff;
        }
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
        if acc > 0xffff {
            acc -= 0xffff;
        }
    }
    !(acc as u16)
}

fn build_icmp_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 14 + 20 + 8 + payload.len()];
    pkt[0..6].copy_from_slice(&[0xaa; 6]); // eth dst
    pkt[6..12].copy_from_slice(&[0xbb; 6]); // eth src
    pkt[12..14].copy_from_slice(&0x0800u16.to_be_bytes()); // ethertype IP

    {
        let ip = &mut pkt[14..34];
        ip[0] = 0x45; // version/ihl
        ip[9] = 1; // protocol: ICMP
        ip[12..16].copy_from_slice(&[192, 168, 1, 2]); // saddr
        ip[16..20].copy_from_slice(&[192, 168, 1, 1]); // daddr
    }
    let csum = internet_checksum(&pkt[14..34]);
    pkt[24..26].copy_from_slice(&csum.to_be_bytes());

    {
        let icmp = &mut pkt[34..42 + payload.len()];
        icmp[0] = 8; // ICMP_ECHO
        icmp[4..6].copy_from_slice(&id.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        icmp[8..].copy_from_slice(payload);
    }
    let csum = internet_checksum(&pkt[34..42 + payload.len()]);
    pkt[36..38].copy_from_slice(&csum.to_be_bytes());

    pkt
}

fn swap_bytes(pkt: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        pkt.swap(a + i, b + i);
    }
}

/// Rewrites an echo-request into an echo-reply in place, matching
/// `demos/icmp-responder`'s `resolve_packet`.
fn rewrite_as_reply(pkt: &mut [u8]) {
    swap_bytes(pkt, 0, 6, 6);
    swap_bytes(pkt, 14 + 12, 14 + 16, 4);
    pkt[14 + 10] = 0;
    pkt[14 + 11] = 0;
    let csum = internet_checksum(&pkt[14..34]);
    pkt[14 + 10..14 + 12].copy_from_slice(&csum.to_be_bytes());

    pkt[34] = 0; // ICMP_ECHOREPLY
    pkt[36] = 0;
    pkt[37] = 0;
    let csum = internet_checksum(&pkt[34..]);
    pkt[36..38].copy_from_slice(&csum.to_be_bytes());
}

fn rx_burst_until(ctx: &mut Context, id: EndpointId, qid: u16, max: u16) -> Vec<memif::Buffer> {
    for _ in 0..100 {
        let _ = ctx.poll_event(Some(20));
        let bufs = ctx.rx_burst(id, qid, max).unwrap();
        if !bufs.is_empty() {
            return bufs;
        }
    }
    Vec::new()
}

#[test]
fn icmp_echo_round_trip_through_connected_endpoints() {
    let (mut master_ctx, master_id, mut slave_ctx, slave_id) = connect_pair("icmp-echo", 6);

    let payload = [0x42u8; 56];
    let request = build_icmp_echo_request(0x1234, 1, &payload);

    let (mut bufs, result) = slave_ctx.buffer_alloc(slave_id, 0, 1).unwrap();
    assert!(result.is_ok());
    unsafe {
        std::ptr::copy_nonoverlapping(request.as_ptr(), bufs[0].data, request.len());
    }
    bufs[0].data_len = request.len() as u32;
    slave_ctx.tx_burst(slave_id, 0, &bufs).unwrap();

    let received = rx_burst_until(&mut master_ctx, master_id, 0, 8);
    assert_eq!(received.len(), 1, "master should receive the echo request");
    assert_eq!(received[0].data_len as usize, request.len());
    let received_bytes = unsafe { std::slice::from_raw_parts(received[0].data, request.len()) };
    assert_eq!(received_bytes[34], 8, "request should carry ICMP_ECHO");
    assert_eq!(&received_bytes[38..40], &0x1234u16.to_be_bytes());
    assert_eq!(&received_bytes[40..42], &1u16.to_be_bytes());

    let (mut reply_bufs, result) = master_ctx.buffer_alloc(master_id, 0, 1).unwrap();
    assert!(result.is_ok());
    let mut reply = received_bytes.to_vec();
    rewrite_as_reply(&mut reply);
    unsafe {
        std::ptr::copy_nonoverlapping(reply.as_ptr(), reply_bufs[0].data, reply.len());
    }
    reply_bufs[0].data_len = reply.len() as u32;
    master_ctx.tx_burst(master_id, 0, &reply_bufs).unwrap();
    master_ctx.buffer_free(master_id, 0, &received).unwrap();

    let slave_received = rx_burst_until(&mut slave_ctx, slave_id, 0, 8);
    assert_eq!(slave_received.len(), 1, "slave should receive the echo reply");
    let reply_bytes = unsafe {
        std::slice::from_raw_parts(slave_received[0].data, slave_received[0].data_len as usize)
    };
    assert_eq!(reply_bytes[34], 0, "reply should carry ICMP_ECHOREPLY");
    assert_eq!(
        &reply_bytes[42..],
        payload.as_ref(),
        "payload must round-trip bit-identical"
    );
}

#[test]
fn ring_full_pushback_then_recovery_through_context() {
    let (mut master_ctx, master_id, mut slave_ctx, slave_id) = connect_pair("ring-full", 4);

    let (bufs, result) = slave_ctx.buffer_alloc(slave_id, 0, 16).unwrap();
    assert_eq!(bufs.len(), 15, "one slot always stays reserved");
    assert!(result.is_err());

    let sent = slave_ctx.tx_burst(slave_id, 0, &bufs).unwrap();
    assert_eq!(sent as usize, bufs.len());

    // the ring is now full from the slave's (producer) point of view; a
    // further alloc must fail until the master (consumer) frees a buffer.
    let (bufs2, result2) = slave_ctx.buffer_alloc(slave_id, 0, 1).unwrap();
    assert!(bufs2.is_empty());
    assert!(result2.is_err());

    let received = rx_burst_until(&mut master_ctx, master_id, 0, 15);
    assert_eq!(received.len(), 15);
    let freed = master_ctx.buffer_free(master_id, 0, &received[..1]).unwrap();
    assert_eq!(freed, 1);

    let (bufs3, result3) = slave_ctx.buffer_alloc(slave_id, 0, 1).unwrap();
    assert_eq!(bufs3.len(), 1, "freeing one buffer should recover one slot");
    assert!(result3.is_ok());
}
