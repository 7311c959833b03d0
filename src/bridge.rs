//! JNI boundary: `JNI_OnLoad`, the `NativeLib` natives and the callback into
//! `onNativeUnaryCall`.

use crate::config::{HookTargets, NativeConfig};
use crate::context::context;
use crate::debug::init_logging;
use crate::error::{NativeError, Result};
use crate::intercept::unary::{RequestDecision, UnaryCallHandler};
use crate::symbol::finder::load_library;
use jni::objects::{GlobalRef, JByteArray, JMethodID, JObject, JString, JValue};
use jni::signature::ReturnType;
use jni::sys::{jint, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM, NativeMethod};
use log::{debug, error, info, warn};
use std::ffi::c_void;

const LOCAL_FRAME_CAPACITY: i32 = 8;

/// Calls `onNativeUnaryCall(String, byte[])` on the `NativeLib` instance that ran `init`.
pub struct JniUnaryCallHandler {
    vm: JavaVM,
    receiver: GlobalRef,
    method: JMethodID,
}

impl JniUnaryCallHandler {
    pub fn new(env: &mut JNIEnv, receiver: &JObject, targets: &HookTargets) -> Result<Self> {
        let class = env.get_object_class(receiver)?;
        let method = env.get_method_id(
            &class,
            targets.unary_call_method,
            targets.unary_call_method_sig,
        )?;

        Ok(Self {
            vm: env.get_java_vm()?,
            receiver: env.new_global_ref(receiver)?,
            method,
        })
    }

    fn dispatch(&self, env: &mut JNIEnv, uri: &str, request: &[u8]) -> Result<RequestDecision> {
        let uri = env.new_string(uri)?;
        let request = env.byte_array_from_slice(request)?;

        let result = unsafe {
            env.call_method_unchecked(
                &self.receiver,
                self.method,
                ReturnType::Object,
                &[JValue::Object(&uri).as_jni(), JValue::Object(&request).as_jni()],
            )
        };
        if env.exception_check()? {
            return Err(NativeError::ManagedException);
        }

        let data = result?.l()?;
        let data = if data.is_null() {
            None
        } else {
            Some(read_request_data(env, &data)?)
        };
        Ok(RequestData::decision(data))
    }
}

impl UnaryCallHandler for JniUnaryCallHandler {
    fn on_unary_call(&self, uri: &str, request: &[u8]) -> Result<RequestDecision> {
        // Fails on threads the VM does not know about; those calls go through untouched.
        let mut env = self.vm.get_env()?;

        let decision = env.with_local_frame(LOCAL_FRAME_CAPACITY, |env| {
            self.dispatch(env, uri, request)
        });

        if env.exception_check().unwrap_or(false) {
            let _ = env.exception_describe();
            let _ = env.exception_clear();
        }
        decision
    }
}

/// Fields of the `NativeRequestData` returned by `onNativeUnaryCall`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestData {
    pub canceled: bool,
    pub buffer: Option<Vec<u8>>,
}

impl RequestData {
    /// A null result, or one without a buffer, leaves the request alone.
    pub fn decision(data: Option<RequestData>) -> RequestDecision {
        match data {
            Some(RequestData { canceled: true, .. }) => RequestDecision::Cancel,
            Some(RequestData {
                buffer: Some(buffer),
                ..
            }) => RequestDecision::Replace(buffer),
            _ => RequestDecision::Unchanged,
        }
    }
}

/// Reads a `NativeRequestData { boolean canceled; byte[] buffer; }`. The
/// buffer is not copied out of a canceled request.
fn read_request_data(env: &mut JNIEnv, data: &JObject) -> Result<RequestData> {
    if env.get_field(data, "canceled", "Z")?.z()? {
        return Ok(RequestData {
            canceled: true,
            buffer: None,
        });
    }

    let buffer = env.get_field(data, "buffer", "[B")?.l()?;
    let buffer = if buffer.is_null() {
        None
    } else {
        Some(env.convert_byte_array(JByteArray::from(buffer))?)
    };
    Ok(RequestData {
        canceled: false,
        buffer,
    })
}

fn read_native_config(env: &mut JNIEnv, config: &JObject) -> Result<NativeConfig> {
    Ok(NativeConfig {
        disable_metrics: env.get_field(config, "disableMetrics", "Z")?.z()?,
        disable_bitmoji: env.get_field(config, "disableBitmoji", "Z")?.z()?,
    })
}

/// Asks the class loader where the client library lives and maps it.
fn load_client_library(env: &mut JNIEnv, class_loader: &JObject, name: &str) -> Result<()> {
    let jname = env.new_string(name)?;
    let path = env
        .call_method(
            class_loader,
            "findLibrary",
            "(Ljava/lang/String;)Ljava/lang/String;",
            &[JValue::Object(&jname)],
        )?
        .l()?;
    if path.is_null() {
        return Err(NativeError::LibraryNotFound(name.to_string()));
    }

    let path: String = env.get_string(&JString::from(path))?.into();
    debug!("loading {}", path);
    load_library(&path)
}

fn clear_exception(env: &mut JNIEnv) {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_clear();
    }
}

extern "system" fn native_init<'local>(
    mut env: JNIEnv<'local>,
    this: JObject<'local>,
    class_loader: JObject<'local>,
) {
    let ctx = context();
    if !ctx.begin_init() {
        debug!("native already initialized");
        return;
    }
    info!("Initializing native");

    let targets = HookTargets::from_env();

    match JniUnaryCallHandler::new(&mut env, &this, &targets) {
        Ok(handler) => {
            ctx.set_handler(Box::new(handler));
        }
        Err(e) => {
            clear_exception(&mut env);
            error!("unary call callback unavailable: {}", e);
        }
    }

    if let Err(e) = load_client_library(&mut env, &class_loader, targets.client_library) {
        clear_exception(&mut env);
        warn!("could not load lib{}.so through the class loader: {}", targets.client_library, e);
    }

    let status = ctx.install_hooks(&targets);
    info!("Native initialized ({:?})", status);
}

extern "system" fn native_load_config<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    config: JObject<'local>,
) {
    match read_native_config(&mut env, &config) {
        Ok(config) => {
            context().config.apply(config);
            info!(
                "config loaded: disable_metrics={}, disable_bitmoji={}",
                config.disable_metrics, config.disable_bitmoji
            );
        }
        Err(e) => {
            clear_exception(&mut env);
            error!("failed to read native config: {}", e);
        }
    }
}

fn load_config_signature(targets: &HookTargets) -> String {
    format!("(L{};)V", targets.native_config_class)
}

fn register_natives(env: &mut JNIEnv, targets: &HookTargets) -> Result<()> {
    let methods = [
        NativeMethod {
            name: "init".into(),
            sig: "(Ljava/lang/ClassLoader;)V".into(),
            fn_ptr: native_init as *mut c_void,
        },
        NativeMethod {
            name: "loadConfig".into(),
            sig: load_config_signature(targets).into(),
            fn_ptr: native_load_config as *mut c_void,
        },
    ];

    env.register_native_methods(targets.native_lib_class, &methods)?;
    Ok(())
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: JavaVM, _reserved: *mut c_void) -> jint {
    init_logging();

    match vm.get_env() {
        Ok(mut env) => {
            if let Err(e) = register_natives(&mut env, &HookTargets::default()) {
                clear_exception(&mut env);
                error!("failed to register natives: {}", e);
            }
        }
        Err(e) => error!("JNI_OnLoad without an environment: {}", e),
    }

    JNI_VERSION_1_6
}
