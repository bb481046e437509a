//! Reference handler plugin: echoes every record back to its sender.
//!
//! Records are framed with a 4-byte big-endian total-length prefix (prefix
//! included in the length). Build as a cdylib and point relayd at the
//! resulting shared object.

use std::{
    cell::RefCell,
    ffi::{c_char, c_int},
    slice,
};

use relayd::SocketInfo;

const PREFIX_LEN: usize = 4;

thread_local! {
    static OUT: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

fn frame_len(bytes: &[u8]) -> c_int {
    if bytes.len() < PREFIX_LEN {
        return 0;
    }
    let need = u32::from_be_bytes(bytes[..PREFIX_LEN].try_into().unwrap()) as usize;
    if need < PREFIX_LEN {
        // A record shorter than its own prefix is garbage.
        return -1;
    }
    if bytes.len() >= need { need as c_int } else { 0 }
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_init(_argc: c_int, _argv: *mut *mut c_char, _role: c_int) -> c_int {
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_input(
    data: *const c_char,
    len: c_int,
    _si: *const SocketInfo,
) -> c_int {
    if data.is_null() || len <= 0 {
        return 0;
    }
    let bytes = unsafe { slice::from_raw_parts(data.cast::<u8>(), len as usize) };
    frame_len(bytes)
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_process(
    data: *const c_char,
    len: c_int,
    out: *mut *mut c_char,
    out_len: *mut c_int,
    _si: *const SocketInfo,
) -> c_int {
    if data.is_null() || len < 0 || out.is_null() || out_len.is_null() {
        return -1;
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

#[unsafe(no_mangle)]
pub extern "C" fn handle_open(
    _out: *mut *mut c_char,
    _out_len: *mut c_int,
    _si: *const SocketInfo,
) -> c_int {
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_close(_si: *const SocketInfo) -> c_int {
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_timer(_elapsed_ms: *mut c_int) -> c_int {
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_fini(_role: c_int) {}

#[cfg(test)]
mod test {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut v = ((payload.len() + PREFIX_LEN) as u32).to_be_bytes().to_vec();
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn incomplete_prefix_needs_more() {
        assert_eq!(frame_len(b"\x00\x00"), 0);
    }

    #[test]
    fn complete_record_is_recognized() {
        let msg = framed(b"hello world");
        assert_eq!(frame_len(&msg), 12);
        assert_eq!(frame_len(&msg[..7]), 0);
    }

    #[test]
    fn undersized_length_is_fatal() {
        assert_eq!(frame_len(&[0, 0, 0, 2, 9]), -1);
    }
}
