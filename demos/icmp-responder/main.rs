//! Minimal ICMP echo responder, reproducing the external behavior of the
//! original `icmp_responder2` demo (scenario 3): a slave endpoint whose
//! `on_interrupt` swaps Ethernet/IP src and dst, rewrites the ICMP type to
//! echo-reply, recomputes both checksums, and leaves the payload untouched.
//!
//! This binary contributes no core design (see DESIGN.md); it exists to
//! exercise the public `Context`/`Buffer` API end to end against a real
//! memif peer (e.g. VPP).

#[macro_use]
extern crate log;

use std::os::raw::c_void;

use memif::{Context, EndpointConfig, EndpointId, Mode, Role};

const MAX_MEMIF_BUFS: u16 = 256;

// The C original keeps a single process-wide `memif_connection_t` so its
// callbacks, which only receive a `void *private_ctx`, can still reach the
// connection handle. This demo does the same with a raw pointer to the one
// `Context` it creates; sound because the built-in reactor loop below is
// the only caller and it never runs two `poll_event` calls concurrently.
static mut CTX_PTR: *mut Context = std::ptr::null_mut();

fn main() {
    env_logger::init();

    let mut ctx = Context::new(None).expect("create context");

    let config = EndpointConfig {
        role: Role::Slave,
        mode: Mode::Ethernet,
        interface_id: 0,
        interface_name: "memif_connection".into(),
        instance_name: "ICMP_Responder".into(),
        log2_ring_size: 10,
        buffer_size: 2048,
        num_s2m_rings: 1,
        num_m2s_rings: 1,
        ..EndpointConfig::default()
    };

    unsafe {
        CTX_PTR = &mut ctx as *mut Context;
    }

    ctx.create_endpoint(
        config,
        |id, _ctx| info!("endpoint {:?} connected", id),
        |id, _ctx| info!("endpoint {:?} disconnected", id),
        on_interrupt,
        std::ptr::null_mut(),
    )
    .expect("create endpoint");

    loop {
        if let Err(e) = ctx.poll_event(None) {
            warn!("poll_event error: {}", e);
        }
    }
}

fn on_interrupt(id: EndpointId, _private_ctx: *mut c_void, qid: u16) {
    let ctx = unsafe { &mut *CTX_PTR };

    let received = match ctx.rx_burst(id, qid, MAX_MEMIF_BUFS) {
        Ok(bufs) => bufs,
        Err(e) => {
            warn!("rx_burst: {}", e);
            return;
        }
    };
    if received.is_empty() {
        return;
    }

    let (mut tx_bufs, alloc_result) = match ctx.buffer_alloc(id, qid, received.len() as u16) {
        Ok(r) => r,
        Err(e) => {
            warn!("buffer_alloc: {}", e);
            let _ = ctx.buffer_free(id, qid, &received);
            return;
        }
    };
    if let Err(e) = alloc_result {
        warn!("buffer_alloc: {}", e);
    }

    let n = received.len().min(tx_bufs.len());
    for i in 0..n {
        let in_len = received[i].data_len as usize;
        let out = unsafe { std::slice::from_raw_parts_mut(tx_bufs[i].data, in_len) };
        let src = unsafe { std::slice::from_raw_parts(received[i].data, in_len) };
        out.copy_from_slice(src);
        resolve_packet(out);
        tx_bufs[i].data_len = in_len as u32;
    }
    tx_bufs.truncate(n);

    if let Err(e) = ctx.tx_burst(id, qid, &tx_bufs) {
        warn!("tx_burst: {}", e);
    }
    if let Err(e) = ctx.buffer_free(id, qid, &received) {
        warn!("buffer_free: {}", e);
    }
}

const ETHER_HEADER_LEN: usize = 14;
const IP_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const ETHERTYPE_IP: u16 = 0x0800;
const ICMP_ECHOREPLY: u8 = 0;

/// In-place rewrite of an Ethernet/IP/ICMP echo-request into an echo-reply:
/// swap hardware and protocol addresses, flip the ICMP type, recompute both
/// checksums. Leaves everything past the ICMP header (the echo payload)
/// untouched, matching `resolve_packet`/`resolve_icmp` in the original demo.
fn resolve_packet(pkt: &mut [u8]) {
    if pkt.len() < ETHER_HEADER_LEN {
        return;
    }
    swap_bytes(pkt, 0, 6, 6); // ether dst <-> src
    let ether_type = u16::from_be_bytes([pkt[12], pkt[13]]);

    if ether_type != ETHERTYPE_IP || pkt.len() < ETHER_HEADER_LEN + IP_HEADER_LEN {
        return;
    }

    let ip_start = ETHER_HEADER_LEN;
    let protocol = pkt[ip_start + 9];
    swap_bytes(pkt, ip_start + 12, ip_start + 16, 4); // saddr <-> daddr
    pkt[ip_start + 10] = 0;
    pkt[ip_start + 11] = 0;
    let csum = internet_checksum(&pkt[ip_start..ip_start + IP_HEADER_LEN]);
    pkt[ip_start + 10] = (csum >> 8) as u8;
    pkt[ip_start + 11] = csum as u8;

    if protocol != 1 || pkt.len() < ip_start + IP_HEADER_LEN + ICMP_HEADER_LEN {
        return;
    }

    let icmp_start = ip_start + IP_HEADER_LEN;
    pkt[icmp_start] = ICMP_ECHOREPLY;
    pkt[icmp_start + 2] = 0;
    pkt[icmp_start + 3] = 0;
    let csum = internet_checksum(&pkt[icmp_start..]);
    pkt[icmp_start + 2] = (csum >> 8) as u8;
    pkt[icmp_start + 3] = csum as u8;
}

fn swap_bytes(pkt: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        pkt.swap(a + i, b + i);
    }
}

/// RFC 1071 one's-complement checksum, matching the original's `cksum`.
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
