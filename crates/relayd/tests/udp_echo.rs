use std::{
    cell::RefCell,
    ffi::{c_char, c_int},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    slice,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use relayd::{
    Handler, HandlerVtable, SocketInfo,
    bind::{BindEntry, BindProto},
    config::Config,
    server::Server,
};

extern "C" fn frame_prefixed(data: *const c_char, len: c_int, _: *const SocketInfo) -> c_int {
    let bytes = unsafe { slice::from_raw_parts(data.cast::<u8>(), len as usize) };
    if bytes.len() < 4 {
        return 0;
    }
    let need = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() >= need { need as c_int } else { 0 }
}

extern "C" fn process_echo(
    data: *const c_char,
    len: c_int,
    out: *mut *mut c_char,
    out_len: *mut c_int,
    _: *const SocketInfo,
) -> c_int {
    thread_local! {
        static OUT: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    }
    let record = unsafe { slice::from_raw_parts(data.cast::<u8>(), len as usize) };
    OUT.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.clear();
        buf.extend_from_slice(record);
        unsafe {
            *out = buf.as_mut_ptr().cast();
            *out_len = buf.len() as c_int;
        }
    });
    0
}

fn start_udp_server() -> (Server, SocketAddr) {
    let handler = Arc::new(Handler::from_vtable(
        HandlerVtable {
            init: None,
            input: frame_prefixed,
            process: process_echo,
            open: None,
            close: None,
            timer: None,
            fini: None,
        },
        vec![],
    ));
    let cfg = Config {
        ringqueue_length: 64 * 1024,
        worker_num: 2,
        recv_buffer: 4096,
        send_buffer: 4096,
        max_packet_size: 4096,
        ..Default::default()
    };
    let bind = BindEntry {
        ip: Ipv4Addr::LOCALHOST,
        port: 0,
        proto: BindProto::Udp,
        idle_timeout_secs: 0,
    };
    let stop = Arc::new(AtomicBool::new(false));
    let server = Server::start(&cfg, &[bind], handler, stop).unwrap();
    let addr = SocketAddr::V4(server.bound_addrs()[0].1);
    (server, addr)
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut v = ((payload.len() + 4) as u32).to_be_bytes().to_vec();
    v.extend_from_slice(payload);
    v
}

#[test]
fn datagram_echoes_to_sender() {
    let (_server, addr) = start_udp_server();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let msg = framed(b"x");
    assert_eq!(msg.len(), 5);
    client.send_to(&msg, addr).unwrap();

    let mut reply = [0u8; 32];
    let (n, from) = client.recv_from(&mut reply).unwrap();
    assert_eq!(&reply[..n], msg.as_slice());
    assert_eq!(from, addr);
}

#[test]
fn distinct_peers_get_their_own_replies() {
    let (_server, addr) = start_udp_server();

    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let msg_a = framed(b"from-a");
    let msg_b = framed(b"from-b");
    a.send_to(&msg_a, addr).unwrap();
    b.send_to(&msg_b, addr).unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], msg_a.as_slice());
    let (n, _) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], msg_b.as_slice());
}
