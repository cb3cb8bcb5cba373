//! Process checkpointing
//!
//! Snapshots a process's global bindings to a file and restores them into a
//! fresh `Vm`, so a long-running process can be resumed after a restart.
//! Only the portable "plain data" subset of `Value` round-trips (the same
//! restriction `scheduler::MailboxValue` applies to messages) — a closure,
//! class, or instance has no meaning once the `Heap` that built it is gone.
//!
//! The file format is a fixed 9-byte magic, a `u32` format version, then a
//! `bincode`-encoded `CheckpointData` — deliberately simple next to the
//! teacher's FFI-serialized strand-migration format, since this crate has no
//! cross-process-heap migration story to preserve.

use crate::scheduler::MailboxValue;
use crate::vm::Vm;
use neutron_core::{CheckpointError, Value};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub const MAGIC: &[u8; 9] = b"NTRN_CKPT";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum PortableValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PortableValue>),
    Map(Vec<(String, PortableValue)>),
}

impl From<&MailboxValue> for PortableValue {
    fn from(v: &MailboxValue) -> Self {
        match v {
            MailboxValue::Nil => PortableValue::Nil,
            MailboxValue::Bool(b) => PortableValue::Bool(*b),
            MailboxValue::Number(n) => PortableValue::Number(*n),
            MailboxValue::String(s) => PortableValue::String(s.clone()),
            MailboxValue::Array(items) => PortableValue::Array(items.iter().map(PortableValue::from).collect()),
            MailboxValue::Map(entries) => {
                PortableValue::Map(entries.iter().map(|(k, v)| (k.clone(), PortableValue::from(v))).collect())
            }
        }
    }
}

impl From<&PortableValue> for MailboxValue {
    fn from(v: &PortableValue) -> Self {
        match v {
            PortableValue::Nil => MailboxValue::Nil,
            PortableValue::Bool(b) => MailboxValue::Bool(*b),
            PortableValue::Number(n) => MailboxValue::Number(*n),
            PortableValue::String(s) => MailboxValue::String(s.clone()),
            PortableValue::Array(items) => MailboxValue::Array(items.iter().map(MailboxValue::from).collect()),
            PortableValue::Map(entries) => {
                MailboxValue::Map(entries.iter().map(|(k, v)| (k.clone(), MailboxValue::from(v))).collect())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    created_at_unix_secs: u64,
    globals: Vec<(String, PortableValue)>,
}

/// Writes every global binding reachable from `vm` that's representable as
/// plain data. A global holding a closure/class/instance is silently
/// skipped (not an error — most programs have at least a handful of
/// function-valued globals that simply aren't meant to survive a restart).
pub fn write_checkpoint(path: impl AsRef<Path>, vm: &Vm) -> Result<(), CheckpointError> {
    let mut globals = Vec::new();
    for (name, value) in vm.globals_snapshot() {
        if let Ok(portable) = MailboxValue::capture(&value, vm.heap()) {
            globals.push((name, PortableValue::from(&portable)));
        }
    }
    let data = CheckpointData {
        created_at_unix_secs: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        globals,
    };
    let encoded = bincode::serialize(&data).map_err(|e| CheckpointError(format!("encode failed: {e}")))?;

    let mut file = std::fs::File::create(path.as_ref()).map_err(|e| CheckpointError(format!("{}: {e}", path.as_ref().display())))?;
    file.write_all(MAGIC).map_err(|e| CheckpointError(e.to_string()))?;
    file.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(|e| CheckpointError(e.to_string()))?;
    file.write_all(&encoded).map_err(|e| CheckpointError(e.to_string()))?;
    info!(path = %path.as_ref().display(), globals = data.globals.len(), "wrote checkpoint");
    Ok(())
}

/// Reads a checkpoint and installs its globals into `vm`, overwriting any
/// global of the same name already defined (e.g. a builtin shadowed by a
/// restored user global).
pub fn restore_checkpoint(path: impl AsRef<Path>, vm: &mut Vm) -> Result<(), CheckpointError> {
    let mut file = std::fs::File::open(path.as_ref()).map_err(|e| CheckpointError(format!("{}: {e}", path.as_ref().display())))?;
    let mut magic = [0u8; 9];
    file.read_exact(&mut magic).map_err(|e| CheckpointError(e.to_string()))?;
    if &magic != MAGIC {
        return Err(CheckpointError(format!("{}: not a neutron checkpoint file", path.as_ref().display())));
    }
    let mut version_bytes = [0u8; 4];
    file.read_exact(&mut version_bytes).map_err(|e| CheckpointError(e.to_string()))?;
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(CheckpointError(format!("unsupported checkpoint format version {version}")));
    }
    let mut rest = Vec::new();
    file.read_to_end(&mut rest).map_err(|e| CheckpointError(e.to_string()))?;
    let data: CheckpointData = bincode::deserialize(&rest).map_err(|e| CheckpointError(format!("decode failed: {e}")))?;

    for (name, portable) in &data.globals {
        let mailbox_value = MailboxValue::from(portable);
        let value: Value = mailbox_value.materialize(vm);
        vm.define_global(name, value);
    }
    info!(path = %path.as_ref().display(), globals = data.globals.len(), "restored checkpoint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;
    use neutron_core::StringInterner;

    #[test]
    fn round_trips_a_number_global() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.ntrnck");

        let mut vm = Vm::new(StringInterner::new(), VmConfig::default());
        vm.define_global("counter", Value::Number(42.0));
        write_checkpoint(&path, &vm).unwrap();

        let mut restored = Vm::new(StringInterner::new(), VmConfig::default());
        restore_checkpoint(&path, &mut restored).unwrap();
        assert_eq!(restored.global("counter"), Some(Value::Number(42.0)));
    }
}
