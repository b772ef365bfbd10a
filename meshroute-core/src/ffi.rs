//! C ABI for linking meshroute-core as a static library into mote firmware or other C hosts.
//!
//! Every event entry point serializes the resulting actions into `out_buf`:
//! per action 1 byte kind, 2 bytes peer address, 8 bytes LE argument, 2 bytes
//! LE body length, then the body. Argument and body depend on the kind (see
//! the `ACTION_*` constants). Returns bytes written, or -1 on error.
//!
//! Actions that do not fit `out_buf` are kept in the handle, in order, until
//! the host drains them with `meshroute_poll_actions`. The engine's state has
//! already moved on, so the host must perform every action it is handed.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;
use std::time::Duration;

use crate::address::NodeAddress;
use crate::config::Config;
use crate::engine::{Action, Event, RouteEngine};
use crate::table::EvictionPolicy;
use crate::timer::TimerId;

/// Broadcast body to all neighbors. Peer unused.
pub const ACTION_BROADCAST: u8 = 1;
/// Unicast body to peer.
pub const ACTION_UNICAST: u8 = 2;
/// Arm timer: argument = timer id, body = 8 bytes LE milliseconds.
pub const ACTION_ARM_TIMER: u8 = 3;
/// Cancel timer: argument = timer id.
pub const ACTION_CANCEL_TIMER: u8 = 4;
/// Route established: peer = destination, argument = next hop (2 bytes) and distance (1 byte).
pub const ACTION_ROUTE_ESTABLISHED: u8 = 5;
/// No route: peer = destination.
pub const ACTION_NO_ROUTE: u8 = 6;
/// Route lost: peer = destination.
pub const ACTION_ROUTE_LOST: u8 = 7;
/// Path traced: peer = probe origin, body = 2 bytes per hop.
pub const ACTION_PATH_TRACED: u8 = 8;

const ACTION_HEADER_LEN: usize = 1 + 2 + 8 + 2;

/// Engine plus the actions not yet handed to the host.
struct Handle {
    engine: RouteEngine,
    outbox: VecDeque<Action>,
}

fn create(address: NodeAddress, config: Config) -> *mut c_void {
    let handle = Handle {
        engine: RouteEngine::with_config(address, config),
        outbox: VecDeque::new(),
    };
    Box::into_raw(Box::new(handle)) as *mut c_void
}

/// Create a new engine for the node at address `hi.lo` with default tunables. Returns opaque handle.
#[no_mangle]
pub extern "C" fn meshroute_engine_create(hi: u8, lo: u8) -> *mut c_void {
    create(NodeAddress::new(hi, lo), Config::default())
}

/// Create an engine with explicit tunables. `evict_oldest` nonzero selects
/// oldest-entry eviction when the table is full; zero rejects new entries.
/// Returns null if `table_capacity` is zero.
#[no_mangle]
pub extern "C" fn meshroute_engine_create_with_config(
    hi: u8,
    lo: u8,
    table_capacity: u32,
    evict_oldest: u8,
    reply_wait_ms: u64,
    reverse_expiry_ms: u64,
    discovery_timeout_ms: u64,
) -> *mut c_void {
    if table_capacity == 0 {
        return std::ptr::null_mut();
    }
    let config = Config {
        table_capacity: table_capacity as usize,
        eviction: if evict_oldest != 0 {
            EvictionPolicy::EvictOldest
        } else {
            EvictionPolicy::RejectNew
        },
        reply_wait_ms,
        reverse_expiry_ms,
        discovery_timeout_ms,
    };
    create(NodeAddress::new(hi, lo), config)
}

/// Destroy engine. No-op if h is null. Queued actions are discarded.
#[no_mangle]
pub extern "C" fn meshroute_engine_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Handle) };
}

/// Application trigger: discover (or probe) the route to `hi.lo`.
#[no_mangle]
pub extern "C" fn meshroute_discover(
    h: *mut c_void,
    hi: u8,
    lo: u8,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = (unsafe { (h as *mut Handle).as_mut() }) else {
        return -1;
    };
    let actions = handle.engine.discover(NodeAddress::new(hi, lo));
    handle.outbox.extend(actions);
    drain_actions(&mut handle.outbox, out_buf, out_buf_len)
}

/// Broadcast payload received from neighbor `from_hi.from_lo`.
#[no_mangle]
pub extern "C" fn meshroute_on_broadcast(
    h: *mut c_void,
    payload: *const u8,
    payload_len: usize,
    from_hi: u8,
    from_lo: u8,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = (unsafe { (h as *mut Handle).as_mut() }) else {
        return -1;
    };
    if payload.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(payload, payload_len) };
    match handle
        .engine
        .on_broadcast_received(bytes, NodeAddress::new(from_hi, from_lo))
    {
        Ok(actions) => {
            handle.outbox.extend(actions);
            drain_actions(&mut handle.outbox, out_buf, out_buf_len)
        }
        Err(_) => -1,
    }
}

/// Unicast payload received from neighbor `from_hi.from_lo`.
#[no_mangle]
pub extern "C" fn meshroute_on_unicast(
    h: *mut c_void,
    payload: *const u8,
    payload_len: usize,
    from_hi: u8,
    from_lo: u8,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = (unsafe { (h as *mut Handle).as_mut() }) else {
        return -1;
    };
    if payload.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(payload, payload_len) };
    match handle
        .engine
        .on_unicast_received(bytes, NodeAddress::new(from_hi, from_lo))
    {
        Ok(actions) => {
            handle.outbox.extend(actions);
            drain_actions(&mut handle.outbox, out_buf, out_buf_len)
        }
        Err(_) => -1,
    }
}

/// Timer armed by an earlier ACTION_ARM_TIMER expired.
#[no_mangle]
pub extern "C" fn meshroute_on_timer(
    h: *mut c_void,
    timer_id: u64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = (unsafe { (h as *mut Handle).as_mut() }) else {
        return -1;
    };
    let actions = handle.engine.on_timer_fired(TimerId(timer_id));
    handle.outbox.extend(actions);
    drain_actions(&mut handle.outbox, out_buf, out_buf_len)
}

/// Write queued actions that did not fit an earlier call's buffer. Returns bytes written.
#[no_mangle]
pub extern "C" fn meshroute_poll_actions(
    h: *mut c_void,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = (unsafe { (h as *mut Handle).as_mut() }) else {
        return -1;
    };
    drain_actions(&mut handle.outbox, out_buf, out_buf_len)
}

/// Number of queued actions still waiting for the host.
#[no_mangle]
pub extern "C" fn meshroute_pending_actions(h: *const c_void) -> c_int {
    match unsafe { (h as *const Handle).as_ref() } {
        Some(handle) => c_int::try_from(handle.outbox.len()).unwrap_or(c_int::MAX),
        None => -1,
    }
}

/// Bytes needed to receive the next queued action; 0 when the queue is empty.
#[no_mangle]
pub extern "C" fn meshroute_next_action_len(h: *const c_void) -> c_int {
    match unsafe { (h as *const Handle).as_ref() } {
        Some(handle) => handle.outbox.front().map_or(0, |a| {
            c_int::try_from(encoded_len(a)).unwrap_or(c_int::MAX)
        }),
        None => -1,
    }
}

/// Look up the route to `hi.lo`. Writes next hop (2 bytes) and distance. Returns 1 if reachable,
/// 0 if absent or broken, -1 on error.
#[no_mangle]
pub extern "C" fn meshroute_route_lookup(
    h: *const c_void,
    hi: u8,
    lo: u8,
    out_next_hop_2: *mut u8,
    out_distance: *mut u8,
) -> c_int {
    if out_next_hop_2.is_null() || out_distance.is_null() {
        return -1;
    }
    let Some(handle) = (unsafe { (h as *const Handle).as_ref() }) else {
        return -1;
    };
    match handle.engine.table().find(NodeAddress::new(hi, lo)) {
        Some(e) if e.is_reachable() => {
            unsafe {
                out_next_hop_2.copy_from_nonoverlapping(e.next_hop.as_bytes().as_ptr(), 2);
                *out_distance = e.distance;
            }
            1
        }
        _ => 0,
    }
}

fn encode_action(action: &Action) -> (u8, NodeAddress, [u8; 8], Vec<u8>) {
    let none = NodeAddress::new(0, 0);
    match action {
        Action::Broadcast(bytes) => (ACTION_BROADCAST, none, [0; 8], bytes.clone()),
        Action::Unicast(to, bytes) => (ACTION_UNICAST, *to, [0; 8], bytes.clone()),
        Action::ArmTimer { timer, after } => (
            ACTION_ARM_TIMER,
            none,
            timer.0.to_le_bytes(),
            millis(*after).to_le_bytes().to_vec(),
        ),
        Action::CancelTimer(timer) => (ACTION_CANCEL_TIMER, none, timer.0.to_le_bytes(), vec![]),
        Action::Notify(Event::RouteEstablished {
            dest,
            next_hop,
            distance,
        }) => {
            let mut arg = [0u8; 8];
            arg[..2].copy_from_slice(next_hop.as_bytes());
            arg[2] = *distance;
            (ACTION_ROUTE_ESTABLISHED, *dest, arg, vec![])
        }
        Action::Notify(Event::NoRoute { dest }) => (ACTION_NO_ROUTE, *dest, [0; 8], vec![]),
        Action::Notify(Event::RouteLost { dest }) => (ACTION_ROUTE_LOST, *dest, [0; 8], vec![]),
        Action::Notify(Event::PathTraced { origin, path }) => (
            ACTION_PATH_TRACED,
            *origin,
            [0; 8],
            path.iter().flat_map(|a| *a.as_bytes()).collect(),
        ),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn encoded_len(action: &Action) -> usize {
    ACTION_HEADER_LEN + encode_action(action).3.len()
}

/// Move whole actions from the front of `outbox` into out_buf while they fit.
/// Returns bytes written; whatever does not fit stays queued for `meshroute_poll_actions`.
fn drain_actions(outbox: &mut VecDeque<Action>, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if out_buf.is_null() || outbox.is_empty() {
        return 0;
    }
    let cap = out_buf_len.min(c_int::MAX as usize);
    let buf = unsafe { slice::from_raw_parts_mut(out_buf, cap) };
    let mut off = 0;
    while let Some(action) = outbox.front() {
        let (kind, peer, arg, body) = encode_action(action);
        let len = ACTION_HEADER_LEN + body.len();
        if off + len > cap || body.len() > u16::MAX as usize {
            break;
        }
        buf[off] = kind;
        buf[off + 1..off + 3].copy_from_slice(peer.as_bytes());
        buf[off + 3..off + 11].copy_from_slice(&arg);
        buf[off + 11..off + 13].copy_from_slice(&(body.len() as u16).to_le_bytes());
        buf[off + ACTION_HEADER_LEN..off + len].copy_from_slice(&body);
        off += len;
        outbox.pop_front();
    }
    off as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(out: &[u8], n: c_int) -> Vec<u8> {
        let mut kinds = Vec::new();
        let mut off = 0;
        while off < n as usize {
            kinds.push(out[off]);
            let body_len = u16::from_le_bytes([out[off + 11], out[off + 12]]) as usize;
            off += ACTION_HEADER_LEN + body_len;
        }
        kinds
    }

    #[test]
    fn discover_writes_broadcast_and_timer() {
        let h = meshroute_engine_create(1, 0);
        let mut out = vec![0u8; 256];
        let n = meshroute_discover(h, 3, 0, out.as_mut_ptr(), out.len());
        assert!(n > 0);
        assert_eq!(kinds(&out, n), vec![ACTION_BROADCAST, ACTION_ARM_TIMER]);
        let body_len = u16::from_le_bytes([out[11], out[12]]) as usize;
        assert_eq!(n as usize, 2 * ACTION_HEADER_LEN + body_len + 8);
        assert_eq!(meshroute_pending_actions(h), 0);
        meshroute_engine_destroy(h);
    }

    #[test]
    fn actions_that_do_not_fit_stay_queued() {
        let h = meshroute_engine_create(1, 0);
        let mut small = vec![0u8; 4];
        assert_eq!(meshroute_discover(h, 3, 0, small.as_mut_ptr(), small.len()), 0);
        assert_eq!(meshroute_pending_actions(h), 2);
        let need = meshroute_next_action_len(h);
        assert!(need as usize > ACTION_HEADER_LEN);

        // Room for the flood only: the timer waits for the next poll.
        let mut out = vec![0u8; need as usize];
        let n = meshroute_poll_actions(h, out.as_mut_ptr(), out.len());
        assert_eq!(n, need);
        assert_eq!(kinds(&out, n), vec![ACTION_BROADCAST]);
        assert_eq!(meshroute_pending_actions(h), 1);

        let mut out = vec![0u8; 512];
        let n = meshroute_poll_actions(h, out.as_mut_ptr(), out.len());
        assert_eq!(kinds(&out, n), vec![ACTION_ARM_TIMER]);
        assert_eq!(meshroute_pending_actions(h), 0);
        assert_eq!(meshroute_next_action_len(h), 0);
        assert_eq!(meshroute_poll_actions(h, out.as_mut_ptr(), out.len()), 0);
        meshroute_engine_destroy(h);
    }

    #[test]
    fn queued_actions_come_before_new_ones() {
        let h = meshroute_engine_create(1, 0);
        assert_eq!(meshroute_discover(h, 3, 0, std::ptr::null_mut(), 0), 0);
        let mut out = vec![0u8; 512];
        let n = meshroute_discover(h, 4, 0, out.as_mut_ptr(), out.len());
        assert_eq!(
            kinds(&out, n),
            vec![ACTION_BROADCAST, ACTION_ARM_TIMER, ACTION_BROADCAST, ACTION_ARM_TIMER]
        );
        meshroute_engine_destroy(h);
    }

    #[test]
    fn null_handle_fails() {
        let mut out = vec![0u8; 64];
        let null = std::ptr::null_mut();
        assert_eq!(meshroute_discover(null, 3, 0, out.as_mut_ptr(), out.len()), -1);
        assert_eq!(meshroute_on_timer(null, 1, out.as_mut_ptr(), out.len()), -1);
        assert_eq!(meshroute_poll_actions(null, out.as_mut_ptr(), out.len()), -1);
        assert_eq!(meshroute_pending_actions(null), -1);
        meshroute_engine_destroy(null);
    }

    #[test]
    fn garbage_payload_fails_without_queueing() {
        let h = meshroute_engine_create(2, 0);
        let mut out = vec![0u8; 64];
        let junk = [0xffu8; 3];
        let n = meshroute_on_unicast(h, junk.as_ptr(), junk.len(), 1, 0, out.as_mut_ptr(), out.len());
        assert_eq!(n, -1);
        assert_eq!(meshroute_pending_actions(h), 0);
        meshroute_engine_destroy(h);
    }

    #[test]
    fn configured_engine_uses_given_tunables() {
        assert!(meshroute_engine_create_with_config(1, 0, 0, 0, 1, 1, 1).is_null());

        let h = meshroute_engine_create_with_config(1, 0, 4, 1, 1000, 2000, 750);
        let mut out = vec![0u8; 256];
        let n = meshroute_discover(h, 3, 0, out.as_mut_ptr(), out.len());
        assert_eq!(kinds(&out, n), vec![ACTION_BROADCAST, ACTION_ARM_TIMER]);
        let body_len = u16::from_le_bytes([out[11], out[12]]) as usize;
        let timer = ACTION_HEADER_LEN + body_len;
        let ms = &out[timer + ACTION_HEADER_LEN..timer + ACTION_HEADER_LEN + 8];
        assert_eq!(u64::from_le_bytes(ms.try_into().unwrap()), 750);

        let handle = unsafe { &*(h as *const Handle) };
        assert_eq!(handle.engine.config().table_capacity, 4);
        assert_eq!(handle.engine.config().eviction, EvictionPolicy::EvictOldest);
        meshroute_engine_destroy(h);
    }

    #[test]
    fn lookup_reports_missing_route() {
        let h = meshroute_engine_create(1, 0);
        let mut next = [0u8; 2];
        let mut distance = 0u8;
        assert_eq!(
            meshroute_route_lookup(h, 3, 0, next.as_mut_ptr(), &mut distance),
            0
        );
        meshroute_engine_destroy(h);
    }
}
