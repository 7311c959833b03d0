use crate::context::context;
use crate::debug::log_hex;
use crate::error::Result;
use crate::intercept::slice::{GrpcByteBuffer, GrpcSlice};
use libc::{c_char, c_void};
use log::{debug, error, warn};
use std::borrow::Cow;
use std::ffi::CStr;
use std::ptr;

/// What the managed side wants done with an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecision {
    Unchanged,
    Cancel,
    Replace(Vec<u8>),
}

/// Synchronous callback consulted before each outgoing unary call.
///
/// It runs on whichever host thread issued the call, and that thread is
/// suspended until it returns. There is no timeout: implementations must not
/// block indefinitely.
pub trait UnaryCallHandler: Send + Sync {
    fn on_unary_call(&self, uri: &str, request: &[u8]) -> Result<RequestDecision>;
}

/// Signature of the client's unexported unary call.
pub type UnaryCallFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *mut *mut GrpcByteBuffer,
    *mut c_void,
    *mut c_void,
    *mut c_void,
) -> *mut c_void;

/// Runs `handler` over the request held by `slice`, then forwards to `original`
/// unless the request was cancelled. A cancelled call returns null.
///
/// # Safety
/// `slice` must be null or point to a live slice whose refcount block, if any,
/// was allocated with `malloc`.
pub unsafe fn intercept_unary_call<F>(
    handler: Option<&dyn UnaryCallHandler>,
    uri: &str,
    slice: *mut GrpcSlice,
    original: F,
) -> *mut c_void
where
    F: FnOnce() -> *mut c_void,
{
    let Some(handler) = handler else {
        return original();
    };
    let Some(slice) = slice.as_mut() else {
        return original();
    };
    // Slices without a refcount are not ours to rebuild.
    if !slice.is_refcounted() {
        return original();
    }

    let request = slice.payload();
    log_hex(request, uri);

    match handler.on_unary_call(uri, request) {
        Ok(RequestDecision::Unchanged) => {}
        Ok(RequestDecision::Cancel) => {
            debug!("canceled request for {}", uri);
            return ptr::null_mut();
        }
        Ok(RequestDecision::Replace(replacement)) => match slice.replace_payload(&replacement) {
            Ok(()) => debug!("rewrote request for {} (length: {})", uri, replacement.len()),
            Err(e) => error!("failed to rewrite request for {}: {}", uri, e),
        },
        Err(e) => warn!("unary call callback failed for {}: {}", uri, e),
    }

    original()
}

pub unsafe extern "C" fn unary_call_hook(
    unk1: *mut c_void,
    uri: *const c_char,
    buffer_ptr: *mut *mut GrpcByteBuffer,
    unk4: *mut c_void,
    unk5: *mut c_void,
    unk6: *mut c_void,
) -> *mut c_void {
    let ctx = context();
    let Some(original) = ctx.originals.unary_call.get() else {
        return ptr::null_mut();
    };
    let original: UnaryCallFn = std::mem::transmute(original);

    let uri_str = if uri.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(uri).to_string_lossy()
    };

    intercept_unary_call(
        ctx.handler(),
        &uri_str,
        GrpcByteBuffer::first_slice(buffer_ptr),
        || original(unk1, uri, buffer_ptr, unk4, unk5, unk6),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeError;
    use crate::intercept::slice::tests::{free_slice, refcounted_slice, HEADER};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const URI: &str = "/snapchat.messaging.MessagingCoreService/CreateContentMessage";

    struct StubHandler {
        decision: fn() -> Result<RequestDecision>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl StubHandler {
        fn new(decision: fn() -> Result<RequestDecision>) -> Self {
            Self {
                decision,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl UnaryCallHandler for StubHandler {
        fn on_unary_call(&self, uri: &str, request: &[u8]) -> Result<RequestDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((uri.to_string(), request.to_vec()));
            (self.decision)()
        }
    }

    const SENT: *mut c_void = 0x5e47 as *mut c_void;

    /// Calls the interceptor and returns its result and the payload the original saw.
    unsafe fn run(
        handler: &StubHandler,
        slice: *mut GrpcSlice,
    ) -> (*mut c_void, Option<Vec<u8>>) {
        let mut delivered = None;
        let result = intercept_unary_call(Some(handler), URI, slice, || {
            delivered = Some((*slice).payload().to_vec());
            SENT
        });
        (result, delivered)
    }

    #[test]
    fn unchanged_request_is_forwarded_as_is() {
        let handler = StubHandler::new(|| Ok(RequestDecision::Unchanged));
        unsafe {
            let mut slice = refcounted_slice(b"original request");
            let block = slice.refcount;

            let (result, delivered) = run(&handler, &mut slice);

            assert_eq!(result, SENT);
            assert_eq!(delivered.as_deref(), Some(&b"original request"[..]));
            assert_eq!(slice.refcount, block);
            free_slice(&slice);
        }

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, URI);
        assert_eq!(seen[0].1, b"original request");
    }

    #[test]
    fn replacement_is_sent_in_place_of_original() {
        let handler = StubHandler::new(|| Ok(RequestDecision::Replace(b"rewritten!".to_vec())));
        unsafe {
            let mut slice = refcounted_slice(b"original request");

            let (result, delivered) = run(&handler, &mut slice);

            assert_eq!(result, SENT);
            assert_eq!(delivered.as_deref(), Some(&b"rewritten!"[..]));
            assert_eq!(slice.length, 10);
            let header = std::slice::from_raw_parts(slice.refcount as *const u8, HEADER.len());
            assert_eq!(header, &HEADER);
            free_slice(&slice);
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_request_never_reaches_original() {
        let handler = StubHandler::new(|| Ok(RequestDecision::Cancel));
        unsafe {
            let mut slice = refcounted_slice(b"original request");

            let (result, delivered) = run(&handler, &mut slice);

            assert!(result.is_null());
            assert_eq!(delivered, None);
            free_slice(&slice);
        }
    }

    #[test]
    fn slice_without_refcount_skips_callback() {
        let handler = StubHandler::new(|| Ok(RequestDecision::Cancel));
        let mut bytes = *b"inline";
        let mut slice = GrpcSlice {
            refcount: ptr::null_mut(),
            length: bytes.len(),
            data: bytes.as_mut_ptr(),
        };

        let (result, delivered) = unsafe { run(&handler, &mut slice) };

        assert_eq!(result, SENT);
        assert_eq!(delivered.as_deref(), Some(&b"inline"[..]));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_callback_is_treated_as_unchanged() {
        let handler = StubHandler::new(|| Err(NativeError::ManagedException));
        unsafe {
            let mut slice = refcounted_slice(b"original request");

            let (result, delivered) = run(&handler, &mut slice);

            assert_eq!(result, SENT);
            assert_eq!(delivered.as_deref(), Some(&b"original request"[..]));
            free_slice(&slice);
        }
    }

    #[test]
    fn missing_handler_or_slice_passes_through() {
        let mut called = 0;
        let result = unsafe {
            intercept_unary_call(None, URI, ptr::null_mut(), || {
                called += 1;
                SENT
            })
        };
        assert_eq!(result, SENT);

        let handler = StubHandler::new(|| Ok(RequestDecision::Cancel));
        let result = unsafe {
            intercept_unary_call(Some(&handler), URI, ptr::null_mut(), || {
                called += 1;
                SENT
            })
        };
        assert_eq!(result, SENT);
        assert_eq!(called, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unrewritable_slice_sends_original_bytes() {
        let handler = StubHandler::new(|| Ok(RequestDecision::Replace(b"new".to_vec())));
        unsafe {
            let mut slice = refcounted_slice(b"original request");
            let block = slice.refcount;
            // data before the refcount block: the rewrite must be abandoned
            slice.refcount = (block as *mut u8).add(64) as *mut c_void;

            let (result, delivered) = run(&handler, &mut slice);

            assert_eq!(result, SENT);
            assert_eq!(delivered.as_deref(), Some(&b"original request"[..]));
            slice.refcount = block;
            free_slice(&slice);
        }
    }
}
