use std::path::PathBuf;

use crate::utils::env::{read_bool_from_env, read_uint_from_env, read_uint_from_str};

/// Tunables of a [`Runtime`](crate::runtime::Runtime).
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Cells per pool block.
    pub pool_block: usize,
    /// Cells a context takes from a pool per refill.
    pub alloc_batch: usize,
    /// Retired buffers kept before a drain is forced.
    pub dead_blocks: usize,
    /// Operand stack limit per context.
    pub max_stack: usize,
    /// Frame stack limit per context.
    pub max_call_depth: usize,
    /// Nesting limit of native-to-script calls through sub-contexts.
    pub max_nesting: usize,
    pub max_marks: usize,
    pub max_parents_depth: usize,
    pub max_parents_visits: usize,
    pub disassemble: bool,
    pub filename: Option<PathBuf>,
    pub script_args: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeOptions {
    pub fn new() -> Self {
        RuntimeOptions {
            pool_block: 512,
            alloc_batch: 32,
            dead_blocks: 64,
            max_stack: 16 * 1024,
            max_call_depth: 4096,
            max_nesting: 128,
            max_marks: 1024,
            max_parents_depth: 32,
            max_parents_visits: 4096,
            disassemble: false,
            filename: None,
            script_args: Vec::new(),
        }
    }

    /// Defaults overridden by `SABLE_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::new();
        let overrides: [(&str, &mut usize); 6] = [
            ("SABLE_POOL_BLOCK", &mut options.pool_block),
            ("SABLE_ALLOC_BATCH", &mut options.alloc_batch),
            ("SABLE_DEAD_BLOCKS", &mut options.dead_blocks),
            ("SABLE_MAX_STACK", &mut options.max_stack),
            ("SABLE_MAX_CALL_DEPTH", &mut options.max_call_depth),
            ("SABLE_MAX_NESTING", &mut options.max_nesting),
        ];
        for (var, slot) in overrides {
            if let Some(value) = read_uint_from_env(var) {
                *slot = value.max(1);
            }
        }
        if let Some(dis) = read_bool_from_env("SABLE_DISASSEMBLE") {
            options.disassemble = dis;
        }
        options
    }

    pub fn parse() -> Result<Self, String> {
        parse()
    }
}

fn size_flag(args: &mut pico_args::Arguments, flag: &'static str) -> Result<Option<usize>, String> {
    match args.opt_value_from_str::<_, String>(flag) {
        Ok(Some(size)) => read_uint_from_str(&size)
            .map(Some)
            .ok_or_else(|| format!("invalid value for {}: {}", flag, size)),
        Ok(None) => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

pub fn parse() -> Result<RuntimeOptions, String> {
    let mut args = pico_args::Arguments::from_env();
    let mut options = RuntimeOptions::from_env();

    if args.contains(["-h", "--help"]) {
        println!("Usage: sable [options] <script> [script args...]");
        println!("Options:");
        println!("  -h, --help: Print this help message");
        println!("  --disassemble: Print the bytecode of the script before running it");
        println!("  --pool-block <n>: Cells per allocation block (default: 512)");
        println!("  --max-stack <n>: Operand stack limit (default: 16k)");
        println!("  --max-call-depth <n>: Call depth limit (default: 4096)");
        std::process::exit(0);
    }

    options.disassemble |= args.contains("--disassemble");
    if let Some(n) = size_flag(&mut args, "--pool-block")? {
        options.pool_block = n.max(1);
    }
    if let Some(n) = size_flag(&mut args, "--max-stack")? {
        options.max_stack = n.max(1);
    }
    if let Some(n) = size_flag(&mut args, "--max-call-depth")? {
        options.max_call_depth = n.max(1);
    }

    let filename = args
        .free_from_str::<PathBuf>()
        .map_err(|e| e.to_string())?;
    options.filename = Some(filename);
    options.script_args = args
        .finish()
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    Ok(options)
}
