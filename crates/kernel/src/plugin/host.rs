//! Host functions linked into plugin instances.
//!
//! A plugin only gets the imports its manifest's capabilities grant; a
//! module importing anything else fails to instantiate, which the loader
//! reports as a load error. All string parameters use ptr+len pairs in the
//! plugin's linear memory.

use std::collections::BTreeSet;

use anyhow::Result;
use rand::RngCore;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Extern, Linker, Memory, StoreLimits};

/// Per-instance host state.
pub struct PluginState {
    /// Identifier of the plugin this store belongs to.
    pub plugin_id: String,
    /// Opaque configuration payload, serialized as JSON.
    pub config: Vec<u8>,
    /// Memory and instance limits enforced by the store.
    pub limits: StoreLimits,
}

impl PluginState {
    pub fn new(plugin_id: impl Into<String>, config: Vec<u8>, limits: StoreLimits) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            config,
            limits,
        }
    }
}

/// Build the import set for a plugin with the given capabilities.
pub fn register_for_capabilities(
    linker: &mut Linker<PluginState>,
    capabilities: &BTreeSet<String>,
) -> Result<()> {
    add_wasi_stubs(linker)?;

    if capabilities.contains("log") {
        register_logging_functions(linker)?;
    }
    if capabilities.contains("config") {
        register_config_functions(linker)?;
    }

    Ok(())
}

/// `hostdesk:kernel/logging.log(level_ptr, level_len, msg_ptr, msg_len)`.
pub fn register_logging_functions(linker: &mut Linker<PluginState>) -> Result<()> {
    linker.func_wrap(
        "hostdesk:kernel/logging",
        "log",
        |mut caller: Caller<'_, PluginState>,
         level_ptr: i32,
         level_len: i32,
         message_ptr: i32,
         message_len: i32| {
            let Some(memory) = exported_memory(&mut caller) else {
                error!(plugin = %caller.data().plugin_id, "plugin missing memory export");
                return;
            };

            let level = read_string_from_memory(&memory, &caller, level_ptr, level_len)
                .unwrap_or_else(|_| "info".to_string());
            let message = read_string_from_memory(&memory, &caller, message_ptr, message_len)
                .unwrap_or_else(|_| "<invalid message>".to_string());
            let plugin = &caller.data().plugin_id;

            match level.as_str() {
                "trace" => trace!(plugin = %plugin, "{}", message),
                "debug" => debug!(plugin = %plugin, "{}", message),
                "info" => info!(plugin = %plugin, "{}", message),
                "warn" => warn!(plugin = %plugin, "{}", message),
                "error" => error!(plugin = %plugin, "{}", message),
                _ => info!(plugin = %plugin, level = %level, "{}", message),
            }
        },
    )?;

    Ok(())
}

/// `hostdesk:kernel/config.config-len() -> i32` and
/// `config-read(ptr, len) -> i32` (bytes written, or -1 when out of bounds).
pub fn register_config_functions(linker: &mut Linker<PluginState>) -> Result<()> {
    linker.func_wrap(
        "hostdesk:kernel/config",
        "config-len",
        |caller: Caller<'_, PluginState>| -> i32 {
            i32::try_from(caller.data().config.len()).unwrap_or(i32::MAX)
        },
    )?;

    linker.func_wrap(
        "hostdesk:kernel/config",
        "config-read",
        |mut caller: Caller<'_, PluginState>, ptr: i32, len: i32| -> i32 {
            let Some(memory) = exported_memory(&mut caller) else {
                return -1;
            };
            let config = caller.data().config.clone();
            let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
                return -1;
            };
            let write_len = config.len().min(len);
            let data = memory.data_mut(&mut caller);
            let Some(target) = data.get_mut(ptr..ptr + write_len) else {
                return -1;
            };
            target.copy_from_slice(&config[..write_len]);
            i32::try_from(write_len).unwrap_or(-1)
        },
    )?;

    Ok(())
}

/// Minimal WASI stubs for wasi_snapshot_preview1.
///
/// Lets plugins compiled for wasm32-wasip1 instantiate without granting them
/// filesystem, environment or process access.
pub fn add_wasi_stubs(linker: &mut Linker<PluginState>) -> Result<()> {
    // fd_write(fd, iovs, iovs_len, nwritten) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "fd_write",
        |_fd: i32, _iovs: i32, _iovs_len: i32, _nwritten: i32| -> i32 {
            52 // ENOSYS
        },
    )?;

    // random_get(buf, buf_len) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "random_get",
        |mut caller: Caller<'_, PluginState>, buf: i32, buf_len: i32| -> i32 {
            let Some(memory) = exported_memory(&mut caller) else {
                return 8; // EBADF
            };
            let (Ok(buf), Ok(len)) = (usize::try_from(buf), usize::try_from(buf_len)) else {
                return 21; // EFAULT
            };
            let data = memory.data_mut(&mut caller);
            let Some(target) = data.get_mut(buf..buf + len) else {
                return 21; // EFAULT
            };
            rand::thread_rng().fill_bytes(target);
            0
        },
    )?;

    // environ_get(environ, environ_buf) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_get",
        |_environ: i32, _environ_buf: i32| -> i32 { 0 },
    )?;

    // environ_sizes_get(environ_count, environ_buf_size) -> errno
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "environ_sizes_get",
        |mut caller: Caller<'_, PluginState>, count_ptr: i32, size_ptr: i32| -> i32 {
            let Some(memory) = exported_memory(&mut caller) else {
                return 8; // EBADF
            };
            let (Ok(count_ptr), Ok(size_ptr)) =
                (usize::try_from(count_ptr), usize::try_from(size_ptr))
            else {
                return 21; // EFAULT
            };
            let data = memory.data_mut(&mut caller);
            if count_ptr + 4 > data.len() || size_ptr + 4 > data.len() {
                return 21; // EFAULT
            }
            data[count_ptr..count_ptr + 4].copy_from_slice(&0u32.to_le_bytes());
            data[size_ptr..size_ptr + 4].copy_from_slice(&0u32.to_le_bytes());
            0
        },
    )?;

    // proc_exit(code): a plugin may not end the host process
    linker.func_wrap(
        "wasi_snapshot_preview1",
        "proc_exit",
        |code: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::msg(format!(
                "plugin called proc_exit({code})"
            )))
        },
    )?;

    Ok(())
}

fn exported_memory(caller: &mut Caller<'_, PluginState>) -> Option<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Some(memory),
        _ => None,
    }
}

/// Read a UTF-8 string from plugin memory.
pub fn read_string_from_memory(
    memory: &Memory,
    store: &impl wasmtime::AsContext,
    ptr: i32,
    len: i32,
) -> Result<String> {
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        anyhow::bail!("negative string pointer or length: ptr={ptr}, len={len}");
    };

    let data = memory.data(store);
    let Some(bytes) = data.get(ptr..ptr + len) else {
        anyhow::bail!(
            "string read out of bounds: ptr={}, len={}, mem_size={}",
            ptr,
            len,
            data.len()
        );
    };

    String::from_utf8(bytes.to_vec())
        .map_err(|e| anyhow::anyhow!("invalid UTF-8 in WASM string: {}", e))
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Module, Store, StoreLimitsBuilder};

    fn store(engine: &Engine, config: &[u8]) -> Store<PluginState> {
        let state = PluginState::new(
            "config-reader",
            config.to_vec(),
            StoreLimitsBuilder::new().build(),
        );
        Store::new(engine, state)
    }

    #[test]
    fn register_all_capabilities_succeeds() {
        let engine = Engine::default();
        let mut linker: Linker<PluginState> = Linker::new(&engine);
        let caps: BTreeSet<String> = ["log", "config"].iter().map(|c| c.to_string()).collect();

        assert!(register_for_capabilities(&mut linker, &caps).is_ok());
    }

    #[test]
    fn config_read_copies_payload_into_memory() {
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"(module
  (import "hostdesk:kernel/config" "config-read" (func $read (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "read-config") (result i32)
    (call $read (i32.const 8) (i32.const 64))))"#,
        )
        .unwrap();

        let mut linker: Linker<PluginState> = Linker::new(&engine);
        register_config_functions(&mut linker).unwrap();
        let mut store = store(&engine, br#"{"region":"eu"}"#);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let read_config = instance
            .get_typed_func::<(), i32>(&mut store, "read-config")
            .unwrap();

        let written = read_config.call(&mut store, ()).unwrap();
        assert_eq!(written, 15);

        let memory = instance.get_memory(&mut store, "memory").unwrap();
        let text = read_string_from_memory(&memory, &store, 8, written).unwrap();
        assert_eq!(text, r#"{"region":"eu"}"#);
    }

    #[test]
    fn config_read_rejects_out_of_bounds_pointer() {
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"(module
  (import "hostdesk:kernel/config" "config-read" (func $read (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "read-config") (result i32)
    (call $read (i32.const 65535) (i32.const 16))))"#,
        )
        .unwrap();

        let mut linker: Linker<PluginState> = Linker::new(&engine);
        register_config_functions(&mut linker).unwrap();
        let mut store = store(&engine, b"0123456789");
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let read_config = instance
            .get_typed_func::<(), i32>(&mut store, "read-config")
            .unwrap();

        assert_eq!(read_config.call(&mut store, ()).unwrap(), -1);
    }

    #[test]
    fn ungranted_import_fails_to_link() {
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"(module (import "hostdesk:kernel/config" "config-len" (func (result i32))))"#,
        )
        .unwrap();

        let mut linker: Linker<PluginState> = Linker::new(&engine);
        register_for_capabilities(&mut linker, &BTreeSet::new()).unwrap();
        let mut store = store(&engine, b"{}");
        assert!(linker.instantiate(&mut store, &module).is_err());
    }
}
