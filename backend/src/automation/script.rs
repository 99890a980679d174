// Script Sandbox - Lua runtime for `run_script` actions
//
// Every run gets a fresh VM with only the table, string, math and utf8
// libraries. Scripts reach data exclusively through the bound `get`, `list`,
// `update` and `log` functions. Instruction count, wall-clock time and heap
// size are all capped.

use async_trait::async_trait;
use crm_shared::Record;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Variadic, VmState};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ScriptLimits;
use crate::error::{ApiResult, AppError};
use crate::store::{ListQuery, ModuleRepository, RecordRepository};
use crate::validation::{RawFields, RecordValidator, ValidationMode};

/// Instructions between two limit checks
const HOOK_INTERVAL: u32 = 1_000;

const ABORT_NONE: u8 = 0;
const ABORT_TIMEOUT: u8 = 1;
const ABORT_INSTRUCTIONS: u8 = 2;

/// Globals removed from the base library before user code runs
const BLOCKED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "require", "collectgarbage", "print"];

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to prepare script runtime: {0}")]
    Setup(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("script exceeded its {0:?} time limit")]
    Timeout(Duration),

    #[error("script exceeded its limit of {0} instructions")]
    InstructionLimit(u64),

    #[error("script exceeded its memory limit of {0} bytes")]
    MemoryLimit(usize),
}

/// Data capabilities handed to scripts
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn get(&self, module: &str, id: Uuid) -> ApiResult<Option<serde_json::Value>>;
    async fn list(&self, module: &str, filter: RawFields) -> ApiResult<Vec<serde_json::Value>>;
    async fn update(&self, module: &str, id: Uuid, data: RawFields) -> ApiResult<serde_json::Value>;
}

/// Host backed by the record store. Writes run at automation trust: values are
/// type-converted but no permission mask or approval lock applies.
pub struct RepositoryHost {
    modules: Arc<dyn ModuleRepository>,
    records: Arc<dyn RecordRepository>,
    validator: RecordValidator,
}

impl RepositoryHost {
    pub fn new(
        modules: Arc<dyn ModuleRepository>,
        records: Arc<dyn RecordRepository>,
        validator: RecordValidator,
    ) -> Self {
        Self { modules, records, validator }
    }

    async fn module(&self, name: &str) -> ApiResult<crm_shared::Module> {
        self.modules
            .find_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Module '{}'", name)))
    }
}

#[async_trait]
impl ScriptHost for RepositoryHost {
    async fn get(&self, module: &str, id: Uuid) -> ApiResult<Option<serde_json::Value>> {
        let record = self.records.get(module, id).await?;
        Ok(record.map(|r| serde_json::Value::Object(r.to_document())))
    }

    async fn list(&self, module: &str, filter: RawFields) -> ApiResult<Vec<serde_json::Value>> {
        let schema = self.module(module).await?;
        let query = ListQuery {
            filter: RecordValidator::convert_filter(&schema, &filter)?,
            ..Default::default()
        };
        let (records, _) = self.records.list(module, &query).await?;
        Ok(records
            .into_iter()
            .map(|r| serde_json::Value::Object(r.to_document()))
            .collect())
    }

    async fn update(&self, module: &str, id: Uuid, data: RawFields) -> ApiResult<serde_json::Value> {
        let schema = self.module(module).await?;
        let fields = self.validator.validate(&schema, &data, ValidationMode::Partial).await?;
        let record = self.records.set_fields(module, id, fields).await?;
        Ok(serde_json::Value::Object(record.to_document()))
    }
}

#[derive(Clone)]
pub struct ScriptSandbox {
    host: Arc<dyn ScriptHost>,
    limits: ScriptLimits,
}

impl ScriptSandbox {
    pub fn new(host: Arc<dyn ScriptHost>, limits: ScriptLimits) -> Self {
        Self { host, limits }
    }

    /// Run `source` against `record` and return the chunk's result as JSON.
    pub async fn run(&self, source: &str, record: &Record) -> Result<serde_json::Value, ScriptError> {
        let host = self.host.clone();
        let limits = self.limits.clone();
        let source = source.to_string();
        let record = record.clone();
        let handle = Handle::current();

        tokio::task::spawn_blocking(move || execute(&source, &record, host, handle, &limits))
            .await
            .map_err(|e| ScriptError::Runtime(format!("script worker failed: {}", e)))?
    }
}

fn execute(
    source: &str,
    record: &Record,
    host: Arc<dyn ScriptHost>,
    handle: Handle,
    limits: &ScriptLimits,
) -> Result<serde_json::Value, ScriptError> {
    let started = Instant::now();
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(|e| ScriptError::Setup(e.to_string()))?;

    lua.set_memory_limit(limits.memory_limit_bytes)
        .map_err(|e| ScriptError::Setup(e.to_string()))?;

    let abort = Arc::new(AtomicU8::new(ABORT_NONE));
    install_limits(&lua, limits, started + limits.timeout, abort.clone());

    bind(&lua, record, host, handle).map_err(|e| ScriptError::Setup(e.to_string()))?;

    let result = lua
        .load(source)
        .set_name("automation")
        .eval::<mlua::Value>()
        .and_then(|value| lua.from_value::<serde_json::Value>(value));

    debug!(
        record_id = %record.id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Script finished"
    );

    result.map_err(|err| match abort.load(Ordering::SeqCst) {
        ABORT_TIMEOUT => ScriptError::Timeout(limits.timeout),
        ABORT_INSTRUCTIONS => ScriptError::InstructionLimit(limits.max_instructions),
        _ => classify(err, limits),
    })
}

fn install_limits(lua: &Lua, limits: &ScriptLimits, deadline: Instant, abort: Arc<AtomicU8>) {
    let executed = AtomicU64::new(0);
    let max_instructions = limits.max_instructions;

    let _ = lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            let count = executed.fetch_add(HOOK_INTERVAL as u64, Ordering::Relaxed) + HOOK_INTERVAL as u64;
            if count > max_instructions {
                abort.store(ABORT_INSTRUCTIONS, Ordering::SeqCst);
                return Err(mlua::Error::runtime("instruction limit exceeded"));
            }
            if Instant::now() >= deadline {
                abort.store(ABORT_TIMEOUT, Ordering::SeqCst);
                return Err(mlua::Error::runtime("time limit exceeded"));
            }
            Ok(VmState::Continue)
        },
    );
}

fn classify(err: mlua::Error, limits: &ScriptLimits) -> ScriptError {
    match err {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Compile(message),
        mlua::Error::MemoryError(_) => ScriptError::MemoryLimit(limits.memory_limit_bytes),
        other => ScriptError::Runtime(other.to_string()),
    }
}

fn parse_id(id: &str) -> mlua::Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| mlua::Error::runtime(format!("invalid record id '{}'", id)))
}

fn table_to_fields(lua: &Lua, value: mlua::Value) -> mlua::Result<RawFields> {
    match value {
        mlua::Value::Nil => Ok(RawFields::new()),
        other => match lua.from_value::<serde_json::Value>(other)? {
            serde_json::Value::Object(map) => Ok(map),
            // Lua cannot tell an empty table from an empty array
            serde_json::Value::Array(items) if items.is_empty() => Ok(RawFields::new()),
            _ => Err(mlua::Error::runtime("expected a table of field values")),
        },
    }
}

fn host_error(err: AppError) -> mlua::Error {
    mlua::Error::runtime(err.to_string())
}

fn bind(lua: &Lua, record: &Record, host: Arc<dyn ScriptHost>, handle: Handle) -> mlua::Result<()> {
    let globals = lua.globals();

    for name in BLOCKED_GLOBALS {
        globals.set(*name, mlua::Nil)?;
    }

    globals.set("module", record.module.clone())?;
    globals.set("record_id", record.id.to_string())?;
    globals.set(
        "record",
        lua.to_value(&serde_json::Value::Object(record.to_document()))?,
    )?;

    let (h, rt) = (host.clone(), handle.clone());
    globals.set(
        "get",
        lua.create_function(move |lua, (module, id): (String, String)| {
            let id = parse_id(&id)?;
            match rt.block_on(h.get(&module, id)).map_err(host_error)? {
                Some(doc) => lua.to_value(&doc),
                None => Ok(mlua::Value::Nil),
            }
        })?,
    )?;

    let (h, rt) = (host.clone(), handle.clone());
    globals.set(
        "list",
        lua.create_function(move |lua, (module, filter): (String, mlua::Value)| {
            let filter = table_to_fields(lua, filter)?;
            let docs = rt.block_on(h.list(&module, filter)).map_err(host_error)?;
            lua.to_value(&docs)
        })?,
    )?;

    let (h, rt) = (host, handle);
    globals.set(
        "update",
        lua.create_function(move |lua, (module, id, data): (String, String, mlua::Value)| {
            let id = parse_id(&id)?;
            let data = table_to_fields(lua, data)?;
            let doc = rt.block_on(h.update(&module, id, data)).map_err(host_error)?;
            lua.to_value(&doc)
        })?,
    )?;

    let (module, record_id) = (record.module.clone(), record.id);
    globals.set(
        "log",
        lua.create_function(move |_lua, args: Variadic<mlua::Value>| {
            let line = args.iter().map(lua_display).collect::<Vec<_>>().join(" ");
            info!(target: "script", module = %module, record_id = %record_id, "{}", line);
            Ok(())
        })?,
    )?;

    Ok(())
}

fn lua_display(value: &mlua::Value) -> String {
    match value {
        mlua::Value::Nil => "nil".to_string(),
        mlua::Value::Boolean(b) => b.to_string(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        mlua::Value::String(s) => s.to_string_lossy().to_string(),
        other => other.type_name().to_string(),
    }
}
