use std::{
    ffi::{CStr, CString, c_char, c_int, c_void},
    path::Path,
    ptr,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::client::SocketInfo;

/// Thread role passed to `handle_init` / `handle_fini` so a plugin can
/// specialize per thread kind.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Main = 0,
    Conn = 1,
    Work = 2,
}

pub type InitFn = unsafe extern "C" fn(c_int, *mut *mut c_char, c_int) -> c_int;
pub type InputFn = unsafe extern "C" fn(*const c_char, c_int, *const SocketInfo) -> c_int;
pub type ProcessFn = unsafe extern "C" fn(
    *const c_char,
    c_int,
    *mut *mut c_char,
    *mut c_int,
    *const SocketInfo,
) -> c_int;
pub type OpenFn = unsafe extern "C" fn(*mut *mut c_char, *mut c_int, *const SocketInfo) -> c_int;
pub type CloseFn = unsafe extern "C" fn(*const SocketInfo) -> c_int;
pub type TimerFn = unsafe extern "C" fn(*mut c_int) -> c_int;
pub type FiniFn = unsafe extern "C" fn(c_int);

/// The plugin's entry points. `input` (framing) and `process` are mandatory;
/// everything else is nullable and checked before each invocation.
#[derive(Clone, Copy, Debug)]
pub struct HandlerVtable {
    pub init: Option<InitFn>,
    pub input: InputFn,
    pub process: ProcessFn,
    pub open: Option<OpenFn>,
    pub close: Option<CloseFn>,
    pub timer: Option<TimerFn>,
    pub fini: Option<FiniFn>,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to load {path}: {detail}")]
    Load { path: String, detail: String },
    #[error("handler is missing mandatory symbol `{0}`")]
    MissingSymbol(&'static str),
    #[error("handler path {0:?} is not valid as a C string")]
    BadPath(String),
}

/// Output of a `process` / `open` callback, copied out of the plugin's
/// borrowed buffer before the call returns.
pub struct Reply {
    pub status: i32,
    pub out: Option<Vec<u8>>,
}

/// A bound handler plugin: resolved vtable plus the shared object keeping the
/// code resident and the argv replayed into `handle_init`.
#[derive(Debug)]
pub struct Handler {
    vtable: HandlerVtable,
    dl_handle: *mut c_void,
    args: Vec<CString>,
}

// The ABI contract requires the plugin's callbacks to be callable from the
// network thread and every worker concurrently; the raw dl handle is only
// touched at load and drop.
unsafe impl Send for Handler {}
unsafe impl Sync for Handler {}

impl Handler {
    /// Binds a handler from a shared object, verifying the mandatory symbols.
    pub fn load(path: &Path, args: Vec<String>) -> Result<Self, HandlerError> {
        let path_display = path.display().to_string();
        let c_path = CString::new(path_display.clone())
            .map_err(|_| HandlerError::BadPath(path_display.clone()))?;

        let dl_handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if dl_handle.is_null() {
            return Err(HandlerError::Load { path: path_display, detail: dl_error() });
        }

        let sym = |name: &CStr| unsafe { libc::dlsym(dl_handle, name.as_ptr()) };
        let input = sym(c"handle_input");
        let process = sym(c"handle_process");
        if input.is_null() || process.is_null() {
            unsafe { libc::dlclose(dl_handle) };
            return Err(HandlerError::MissingSymbol(if input.is_null() {
                "handle_input"
            } else {
                "handle_process"
            }));
        }

        let vtable = unsafe {
            HandlerVtable {
                init: fn_opt(sym(c"handle_init")),
                input: std::mem::transmute::<*mut c_void, InputFn>(input),
                process: std::mem::transmute::<*mut c_void, ProcessFn>(process),
                open: fn_opt(sym(c"handle_open")),
                close: fn_opt(sym(c"handle_close")),
                timer: fn_opt(sym(c"handle_timer")),
                fini: fn_opt(sym(c"handle_fini")),
            }
        };
        debug!(path = %path_display, "handler bound");

        Ok(Self { vtable, dl_handle, args: c_args(args) })
    }

    /// Builds a handler straight from function pointers; embedders and tests
    /// supply callbacks without a shared object.
    pub fn from_vtable(vtable: HandlerVtable, args: Vec<String>) -> Self {
        Self { vtable, dl_handle: ptr::null_mut(), args: c_args(args) }
    }

    /// `handle_init` for one thread role; 0 when the plugin has no init.
    pub fn init(&self, role: Role) -> i32 {
        let Some(init) = self.vtable.init else { return 0 };
        let mut argv: Vec<*mut c_char> =
            self.args.iter().map(|a| a.as_ptr().cast_mut()).collect();
        argv.push(ptr::null_mut());
        unsafe { init(self.args.len() as c_int, argv.as_mut_ptr(), role as c_int) }
    }

    /// Framing callback: length of the next complete record at the head of
    /// `bytes`, 0 when more bytes are needed, negative on a fatal stream.
    #[inline]
    pub fn frame(&self, bytes: &[u8], si: &SocketInfo) -> i32 {
        unsafe { (self.vtable.input)(bytes.as_ptr().cast(), bytes.len() as c_int, si) }
    }

    /// Processing callback. The plugin's output buffer is borrowed only for
    /// the duration of the call; the bytes are copied before returning.
    pub fn process(&self, record: &[u8], si: &SocketInfo) -> Reply {
        let mut out_ptr: *mut c_char = ptr::null_mut();
        let mut out_len: c_int = 0;
        let status = unsafe {
            (self.vtable.process)(
                record.as_ptr().cast(),
                record.len() as c_int,
                &mut out_ptr,
                &mut out_len,
                si,
            )
        };
        Reply { status, out: copy_out(status, out_ptr, out_len) }
    }

    /// Post-accept callback; `None` when the plugin does not implement it.
    pub fn open(&self, si: &SocketInfo) -> Option<Reply> {
        let open = self.vtable.open?;
        let mut out_ptr: *mut c_char = ptr::null_mut();
        let mut out_len: c_int = 0;
        let status = unsafe { open(&mut out_ptr, &mut out_len, si) };
        Some(Reply { status, out: copy_out(status, out_ptr, out_len) })
    }

    /// Last callback before a descriptor closes.
    pub fn close(&self, si: &SocketInfo) {
        if let Some(close) = self.vtable.close {
            let rc = unsafe { close(si) };
            if rc < 0 {
                warn!(fd = si.sock_fd, rc, "handle_close reported failure");
            }
        }
    }

    /// Periodic tick with the elapsed milliseconds since the previous one.
    pub fn timer(&self, elapsed_ms: &mut i32) {
        if let Some(timer) = self.vtable.timer {
            unsafe { timer(elapsed_ms) };
        }
    }

    pub fn fini(&self, role: Role) {
        if let Some(fini) = self.vtable.fini {
            unsafe { fini(role as c_int) };
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        if !self.dl_handle.is_null() {
            unsafe { libc::dlclose(self.dl_handle) };
        }
    }
}

fn copy_out(status: i32, out_ptr: *mut c_char, out_len: c_int) -> Option<Vec<u8>> {
    (status >= 0 && !out_ptr.is_null() && out_len > 0).then(|| {
        unsafe { std::slice::from_raw_parts(out_ptr.cast::<u8>(), out_len as usize) }.to_vec()
    })
}

unsafe fn fn_opt<F>(sym: *mut c_void) -> Option<F> {
    if sym.is_null() {
        None
    } else {
        Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&sym) })
    }
}

fn c_args(args: Vec<String>) -> Vec<CString> {
    args.into_iter()
        .filter_map(|a| CString::new(a).ok())
        .collect()
}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen failure".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::client::SocketKind;

    extern "C" fn frame_all(_: *const c_char, len: c_int, _: *const SocketInfo) -> c_int {
        len
    }

    extern "C" fn upper_process(
        data: *const c_char,
        len: c_int,
        out: *mut *mut c_char,
        out_len: *mut c_int,
        _: *const SocketInfo,
    ) -> c_int {
        thread_local! {
            static BUF: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
        }
        BUF.with(|b| {
            let mut b = b.borrow_mut();
            b.clear();
            let input = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
            b.extend(input.iter().map(u8::to_ascii_uppercase));
            unsafe {
                *out = b.as_mut_ptr().cast();
                *out_len = b.len() as c_int;
            }
        });
        0
    }

    extern "C" fn failing_process(
        _: *const c_char,
        _: c_int,
        _: *mut *mut c_char,
        _: *mut c_int,
        _: *const SocketInfo,
    ) -> c_int {
        -1
    }

    fn si() -> SocketInfo {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        SocketInfo::new(1, SocketKind::Stream, addr, addr)
    }

    fn vtable(process: ProcessFn) -> HandlerVtable {
        HandlerVtable {
            init: None,
            input: frame_all,
            process,
            open: None,
            close: None,
            timer: None,
            fini: None,
        }
    }

    #[test]
    fn process_output_is_copied() {
        let h = Handler::from_vtable(vtable(upper_process), vec![]);
        let reply = h.process(b"abc", &si());
        assert_eq!(reply.status, 0);
        assert_eq!(reply.out.as_deref(), Some(b"ABC".as_slice()));
    }

    #[test]
    fn negative_process_yields_no_output() {
        let h = Handler::from_vtable(vtable(failing_process), vec![]);
        let reply = h.process(b"abc", &si());
        assert_eq!(reply.status, -1);
        assert!(reply.out.is_none());
    }

    #[test]
    fn optional_callbacks_tolerate_absence() {
        let h = Handler::from_vtable(vtable(upper_process), vec!["relayd".into()]);
        assert_eq!(h.init(Role::Main), 0);
        assert!(h.open(&si()).is_none());
        h.close(&si());
        let mut ms = 17;
        h.timer(&mut ms);
        h.fini(Role::Work);
    }

    #[test]
    fn load_of_missing_object_fails() {
        let err = Handler::load(Path::new("/nonexistent/libhandler.so"), vec![]).unwrap_err();
        assert!(matches!(err, HandlerError::Load { .. }));
    }

    #[test]
    fn frame_sees_exact_slice() {
        let h = Handler::from_vtable(vtable(upper_process), vec![]);
        assert_eq!(h.frame(b"12345", &si()), 5);
        assert_eq!(h.frame(&[], &si()), 0);
    }
}
